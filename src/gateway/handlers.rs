//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::auth::{AuthenticatedRequest, RequestAuthenticator, auth_middleware};
use crate::dataverse::{DataverseInvoker, WhoAmIResponse};
use crate::identity::{IdentityRequest, IdentityResolver, ResolveError};

/// Shared application state
pub struct AppState {
    /// Bearer authentication pipeline.
    pub authenticator: Arc<RequestAuthenticator>,
    /// Dual-path identity resolver.
    pub resolver: IdentityResolver,
    /// Downstream operation executor.
    pub invoker: DataverseInvoker,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let authenticator = Arc::clone(&state.authenticator);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/whoami", get(whoami_handler))
        .route("/api/whoami-s2s", get(whoami_s2s_handler))
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(authenticator, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - liveness probe, public
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /api/whoami - execute WhoAmI as the calling user (On-Behalf-Of)
async fn whoami_handler(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthenticatedRequest>,
) -> Result<Json<WhoAmIResponse>, ApiError> {
    info!(subject = %auth.claims.subject, "WhoAmI request over the On-Behalf-Of flow");

    let identity = state
        .resolver
        .resolve(IdentityRequest::Delegated {
            user_assertion: auth.token.clone(),
        })
        .await?;

    let response = state.invoker.who_am_i(&identity).await?;
    Ok(Json(response))
}

/// GET /api/whoami-s2s - execute WhoAmI as the mapped application user
async fn whoami_s2s_handler(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthenticatedRequest>,
) -> Result<Json<WhoAmIResponse>, ApiError> {
    info!(subject = %auth.claims.subject, "WhoAmI request over the service-to-service flow");

    let identity = state
        .resolver
        .resolve(IdentityRequest::ServiceToService {
            service_token: auth.token.clone(),
        })
        .await?;

    let response = state.invoker.who_am_i(&identity).await?;
    Ok(Json(response))
}

/// Resolution failure mapped to an HTTP response.
///
/// The mapping is structural on the error kind, never on message content:
/// a failed exchange is an authentication failure (401), a missing
/// application identity is 404, and unreachable collaborators are 500.
pub struct ApiError(ResolveError);

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, label) = match &self.0 {
            ResolveError::TokenExchangeFailed(_) => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ResolveError::ClientIdNotFound(_) | ResolveError::IdentityNotFound(_) => {
                (StatusCode::NOT_FOUND, "Application User Not Found")
            }
            ResolveError::DownstreamUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Downstream Unavailable")
            }
        };

        warn!(status = %status, error = %self.0, "Request failed");

        (
            status,
            Json(json!({
                "error": label,
                "message": self.0.to_string()
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ResolveError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn exchange_failure_maps_to_401() {
        assert_eq!(
            status_of(ResolveError::TokenExchangeFailed("invalid_grant".to_string())),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn missing_identity_maps_to_404() {
        assert_eq!(
            status_of(ResolveError::ClientIdNotFound("no user".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ResolveError::IdentityNotFound("no id".to_string())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn unavailability_maps_to_500() {
        assert_eq!(
            status_of(ResolveError::DownstreamUnavailable("timeout".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
