//! Bearer authentication middleware
//!
//! Protected routes require `Authorization: Bearer <token>`. The middleware
//! runs the full pipeline (validate, then authorize) and attaches the
//! authenticated principal to request extensions; handlers never see an
//! unauthenticated request. Absent or rejected tokens yield a JSON
//! `{"error", "message"}` body with 401 (or 500 when the identity
//! provider's metadata cannot be obtained at all).

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::claims::{ValidatedClaims, authorize};
use super::{AuthError, BearerToken, TokenValidator};
use crate::config::{AzureAdConfig, ServerConfig};

/// Authenticated principal, attached to request extensions on success.
#[derive(Clone, Debug)]
pub struct AuthenticatedRequest {
    /// The raw bearer token, kept for downstream exchange or claim decoding.
    pub token: BearerToken,
    /// Claims of the validated token.
    pub claims: Arc<ValidatedClaims>,
    /// The scope or role that satisfied the policy, when one did.
    pub matched: Option<String>,
}

/// Runs the validation pipeline for inbound requests.
pub struct RequestAuthenticator {
    validator: TokenValidator,
    accepted_scopes: Vec<String>,
    accepted_roles: Vec<String>,
    public_paths: Vec<String>,
}

impl RequestAuthenticator {
    /// Create an authenticator from the validator and policy configuration.
    #[must_use]
    pub fn new(validator: TokenValidator, azure: &AzureAdConfig, server: &ServerConfig) -> Self {
        Self {
            validator,
            accepted_scopes: azure.accepted_scopes.clone(),
            accepted_roles: azure.accepted_roles.clone(),
            public_paths: server.public_paths.clone(),
        }
    }

    /// Check if a path is public (bypasses auth)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p))
    }

    /// Validate and authorize a bearer token.
    ///
    /// # Errors
    ///
    /// Any validator failure propagates unchanged; a policy rejection is
    /// returned as [`AuthError::AuthorizationRejected`].
    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedRequest, AuthError> {
        let claims = self.validator.validate(token).await?;

        let decision = authorize(&claims, &self.accepted_scopes, &self.accepted_roles);
        if !decision.accepted {
            let reason = decision
                .reason
                .unwrap_or_else(|| "token did not satisfy the scope/role policy".to_string());
            return Err(AuthError::AuthorizationRejected(reason));
        }

        Ok(AuthenticatedRequest {
            token: BearerToken::new(token),
            claims: Arc::new(claims),
            matched: decision.matched,
        })
    }
}

/// Authentication middleware for protected routes.
pub async fn auth_middleware(
    State(authenticator): State<Arc<RequestAuthenticator>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if authenticator.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_from_header);

    let Some(token) = token else {
        warn!(path = %path, "Missing Authorization header");
        return unauthorized_response(
            "Missing Authorization header. Use: Authorization: Bearer <token>",
        );
    };

    match authenticator.authenticate(token).await {
        Ok(authenticated) => {
            debug!(
                path = %path,
                subject = %authenticated.claims.subject,
                matched = authenticated.matched.as_deref().unwrap_or("<none>"),
                "Authenticated request"
            );
            request.extensions_mut().insert(authenticated);
            next.run(request).await
        }
        Err(AuthError::MetadataUnavailable(message)) => {
            warn!(path = %path, error = %message, "Signing keys unavailable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Metadata Unavailable",
                    "message": message
                })),
            )
                .into_response()
        }
        Err(err) => {
            warn!(path = %path, error = %err, "Token rejected");
            unauthorized_response(&err.to_string())
        }
    }
}

/// Strip the `Bearer ` scheme prefix from an Authorization header value.
fn bearer_from_header(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
}

/// Create a 401 Unauthorized response
fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", "Bearer")],
        Json(json!({
            "error": "Unauthorized",
            "message": message
        })),
    )
        .into_response()
}
