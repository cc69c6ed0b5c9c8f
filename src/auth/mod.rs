//! Token validation pipeline
//!
//! Three stages, in order: the [`metadata::MetadataCache`] supplies the
//! tenant's signing keys, the [`validator::TokenValidator`] verifies
//! signature/issuer/audience/lifetime, and [`claims::authorize`] applies the
//! scope/role allow-list policy. A [`claims::ValidatedClaims`] value exists
//! only for tokens that passed every validator check.

pub mod claims;
pub mod metadata;
pub mod middleware;
pub mod validator;

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use claims::{AuthorizationDecision, ValidatedClaims, authorize};
pub use metadata::{MetadataCache, MetadataFetcher, OidcMetadata};
pub use middleware::{AuthenticatedRequest, RequestAuthenticator, auth_middleware};
pub use validator::TokenValidator;

/// Error variants for token validation and authorization failures.
///
/// Each check failure maps to its own variant; callers match structurally,
/// never on message content.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Identity provider metadata could not be fetched and no usable
    /// last-known-good value exists.
    #[error("identity provider metadata unavailable: {0}")]
    MetadataUnavailable(String),

    /// The token is not a structurally valid JWT.
    #[error("malformed bearer token: {0}")]
    Malformed(String),

    /// The `kid` in the token header is not in the signing-key set,
    /// even after a forced metadata refresh.
    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),

    /// Signature verification failed against the resolved key.
    #[error("token signature verification failed")]
    SignatureInvalid,

    /// The `iss` claim is not in the accepted issuer set.
    #[error("issuer not accepted: {0}")]
    IssuerMismatch(String),

    /// The `aud` claim does not intersect the accepted audience set.
    #[error("audience not accepted: {0}")]
    AudienceMismatch(String),

    /// The token's expiry is in the past (beyond clock-skew allowance).
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),

    /// The token's not-before is in the future (beyond clock-skew allowance).
    #[error("token not valid before {0}")]
    NotYetValid(DateTime<Utc>),

    /// The validated claims did not satisfy the scope/role policy.
    #[error("authorization rejected: {0}")]
    AuthorizationRejected(String),
}

/// A raw bearer token as received on the wire.
///
/// The compact string is held verbatim for downstream exchange, but never
/// printed: the `Debug` impl redacts it so tokens cannot leak through logs
/// or error bodies.
#[derive(Clone)]
pub struct BearerToken(String);

impl BearerToken {
    /// Wrap a compact token string.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw compact form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_debug_redacts_value() {
        let token = BearerToken::new("eyJhbGciOi.secret.payload");
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("redacted"));
    }
}
