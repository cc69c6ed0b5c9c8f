//! Error types for the Dataverse gateway

use std::io;

use thiserror::Error;

use crate::auth::AuthError;
use crate::identity::ResolveError;

/// Result type alias for the Dataverse gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token validation or authorization failure
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Identity resolution failure
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
