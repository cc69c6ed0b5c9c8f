//! Dataverse Gateway Library
//!
//! OAuth2-protected backend fronting the Dataverse Web API. Every request is
//! authenticated against Azure AD (signature, issuer, audience, lifetime,
//! scope/role policy) and then executed downstream under one of two
//! mutually exclusive identities:
//!
//! - **On-Behalf-Of**: the validated user token is exchanged for a
//!   Dataverse-scoped token and the call runs as the calling user.
//! - **Service-to-Service**: the calling application's client id is mapped
//!   to a provisioned Dataverse application user and the call runs
//!   impersonating that user over a client-credentials connection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod dataverse;
pub mod error;
pub mod gateway;
pub mod identity;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
