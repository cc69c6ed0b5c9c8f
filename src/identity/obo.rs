//! On-Behalf-Of token exchange
//!
//! Exchanges the caller's validated token for a Dataverse-scoped token at
//! the tenant's token endpoint, presenting this service's confidential
//! client credential. Tokens are never cached: the [`DelegatedContext`]
//! re-performs the exchange for every downstream call so each call runs on
//! a token valid for its own execution window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::ResolveError;
use crate::auth::BearerToken;
use crate::config::{AzureAdConfig, DataverseConfig};
use crate::{Error, Result};

/// RFC 8693 / Azure AD grant type for the On-Behalf-Of assertion exchange.
const GRANT_JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Confidential-client exchanger for the On-Behalf-Of flow.
///
/// Cheap to clone; the credential and HTTP client are shared. Created once
/// at startup and reused across requests — only the tokens themselves are
/// per-call.
#[derive(Clone)]
pub struct OboExchanger {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

/// Token endpoint success body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Token endpoint error body (`error` + `error_description`).
#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

impl OboExchanger {
    /// Create an exchanger bound to this service's application identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(azure: &AzureAdConfig, dataverse: &DataverseConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(azure.http_timeout)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                token_endpoint: azure.token_endpoint(),
                client_id: azure.client_id.clone(),
                client_secret: azure.resolve_client_secret(),
                scope: dataverse.scope(),
            }),
        })
    }

    /// Exchange a user assertion for a delegated downstream context.
    ///
    /// # Errors
    ///
    /// [`ResolveError::TokenExchangeFailed`] when the provider rejects the
    /// exchange (an authentication failure — never retried, since replaying
    /// a delegated assertion can trip provider-side throttling), or
    /// [`ResolveError::DownstreamUnavailable`] when the token endpoint is
    /// unreachable.
    pub async fn exchange(
        &self,
        assertion: &BearerToken,
    ) -> std::result::Result<DelegatedContext, ResolveError> {
        let (access_token, expires_at) = self.acquire(assertion).await?;
        info!(expires_at = %expires_at, "Acquired Dataverse token via On-Behalf-Of exchange");

        Ok(DelegatedContext {
            access_token,
            expires_at,
            exchanger: self.clone(),
            assertion: assertion.clone(),
        })
    }

    /// One exchange round-trip against the token endpoint.
    async fn acquire(
        &self,
        assertion: &BearerToken,
    ) -> std::result::Result<(String, DateTime<Utc>), ResolveError> {
        let inner = &self.inner;
        let params = [
            ("grant_type", GRANT_JWT_BEARER),
            ("client_id", inner.client_id.as_str()),
            ("client_secret", inner.client_secret.as_str()),
            ("assertion", assertion.as_str()),
            ("scope", inner.scope.as_str()),
            ("requested_token_use", "on_behalf_of"),
        ];

        debug!(endpoint = %inner.token_endpoint, scope = %inner.scope, "Requesting On-Behalf-Of exchange");

        let response = inner
            .http
            .post(&inner.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                ResolveError::DownstreamUnavailable(format!("token endpoint unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body: TokenErrorResponse = response.json().await.unwrap_or_default();
            return Err(ResolveError::TokenExchangeFailed(format!(
                "HTTP {status}: {}: {}",
                body.error.as_deref().unwrap_or("unknown_error"),
                body.error_description.as_deref().unwrap_or("no description"),
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            ResolveError::TokenExchangeFailed(format!("unparseable token response: {e}"))
        })?;

        let expires_in = token.expires_in.unwrap_or(300);
        let expires_at = Utc::now() + chrono::Duration::seconds(expires_in as i64);
        Ok((token.access_token, expires_at))
    }
}

/// Delegated downstream identity: a Dataverse-scoped token plus the means
/// to re-acquire one per call.
pub struct DelegatedContext {
    access_token: String,
    expires_at: DateTime<Utc>,
    exchanger: OboExchanger,
    assertion: BearerToken,
}

impl std::fmt::Debug for DelegatedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedContext")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("assertion", &self.assertion)
            .finish_non_exhaustive()
    }
}

impl DelegatedContext {
    /// The token acquired when this context was resolved.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Expiry of the initially acquired token.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Re-perform the exchange and return a token valid for the calling
    /// operation's execution window.
    ///
    /// # Errors
    ///
    /// Same classification as [`OboExchanger::exchange`].
    pub async fn fresh_token(&self) -> std::result::Result<String, ResolveError> {
        let (access_token, _) = self.exchanger.acquire(&self.assertion).await?;
        Ok(access_token)
    }
}
