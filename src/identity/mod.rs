//! Dual-path downstream identity resolution
//!
//! A validated, authorized request resolves its downstream identity through
//! exactly one of two flows, chosen by the entry point it arrived on:
//!
//! - [`obo::OboExchanger`] — delegated: exchange the user's token for a
//!   Dataverse-scoped token and act as the calling user.
//! - [`s2s::ApplicationIdentityResolver`] — service-to-service: map the
//!   calling application's client id to a provisioned application user and
//!   impersonate it over the client-credentials connection.
//!
//! The two paths share no mutable state and may run concurrently for
//! different requests without coordination.

pub mod obo;
pub mod s2s;

use thiserror::Error;

pub use obo::{DelegatedContext, OboExchanger};
pub use s2s::{ApplicationIdentityResolver, ImpersonationContext};

use crate::auth::BearerToken;

/// Identity resolution failures.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The identity provider rejected the On-Behalf-Of exchange.
    /// Classified as an authentication failure and never retried.
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// No client id could be extracted from the token, or no application
    /// user is registered downstream for it.
    #[error("client id not found: {0}")]
    ClientIdNotFound(String),

    /// A matching downstream record exists but does not carry a usable
    /// identity.
    #[error("application identity not found: {0}")]
    IdentityNotFound(String),

    /// The identity provider or the downstream system could not be reached.
    #[error("downstream system unavailable: {0}")]
    DownstreamUnavailable(String),
}

/// A request to resolve a downstream identity. Exactly one variant per
/// request; the variant determines which resolver executes.
pub enum IdentityRequest {
    /// Act as the calling user via On-Behalf-Of token exchange.
    Delegated {
        /// The caller's validated bearer token, presented as the assertion.
        user_assertion: BearerToken,
    },
    /// Act as the application user mapped to the calling application.
    ServiceToService {
        /// The calling service's validated bearer token.
        service_token: BearerToken,
    },
}

/// An executable downstream identity. Used exactly once per request and
/// never persisted beyond it.
pub enum ResolvedIdentity {
    /// Delegated context from the On-Behalf-Of exchange.
    Delegated(DelegatedContext),
    /// Impersonation handle over the client-credentials connection.
    Impersonation(ImpersonationContext),
}

/// Routes resolution requests to the matching resolver.
pub struct IdentityResolver {
    obo: OboExchanger,
    s2s: ApplicationIdentityResolver,
}

impl IdentityResolver {
    /// Create a resolver over the two flow implementations.
    #[must_use]
    pub fn new(obo: OboExchanger, s2s: ApplicationIdentityResolver) -> Self {
        Self { obo, s2s }
    }

    /// Resolve the downstream identity for `request`.
    ///
    /// # Errors
    ///
    /// Propagates the executing resolver's [`ResolveError`] unchanged.
    pub async fn resolve(&self, request: IdentityRequest) -> Result<ResolvedIdentity, ResolveError> {
        match request {
            IdentityRequest::Delegated { user_assertion } => Ok(ResolvedIdentity::Delegated(
                self.obo.exchange(&user_assertion).await?,
            )),
            IdentityRequest::ServiceToService { service_token } => {
                Ok(ResolvedIdentity::Impersonation(
                    self.s2s.resolve_application_identity(&service_token).await?,
                ))
            }
        }
    }
}
