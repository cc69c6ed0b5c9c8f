//! HTTP surface
//!
//! Router, handlers, error-to-status mapping, and server lifecycle.

pub mod handlers;
pub mod server;

pub use handlers::{AppState, create_router};
pub use server::Gateway;
