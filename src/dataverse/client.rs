//! Client-credentials Dataverse Web API client
//!
//! Authenticates as the gateway's own app registration
//! (`grant_type=client_credentials`) and executes OData queries and
//! functions. The acquired app token is the service's own credential — not
//! a delegated assertion — so it is cached and re-acquired shortly before
//! expiry.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ApplicationUser, DataverseConnection, WhoAmIResponse};
use crate::config::{AzureAdConfig, DataverseConfig};
use crate::identity::ResolveError;
use crate::{Error, Result};

/// Web API route prefix.
const API_PATH: &str = "api/data/v9.2";

/// Header that makes a call execute as the named system user.
const IMPERSONATION_HEADER: &str = "MSCRMCallerID";

/// Re-acquire the app token this long before its stated expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Web API base for an environment URL.
#[must_use]
pub fn api_base(environment_url: &str) -> String {
    format!("{}/{}", environment_url.trim_end_matches('/'), API_PATH)
}

/// Cached client-credentials token.
struct AppToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl AppToken {
    fn is_expired(&self) -> bool {
        Utc::now() + chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

/// Token endpoint success body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// OData collection envelope.
#[derive(Debug, Deserialize)]
struct ODataCollection<T> {
    value: Vec<T>,
}

/// Raw `systemusers` row as returned by the query.
#[derive(Debug, Deserialize)]
struct SystemUserRecord {
    systemuserid: Option<Uuid>,
    fullname: Option<String>,
}

/// Client-credentials connection to a Dataverse environment.
pub struct DataverseClient {
    http: reqwest::Client,
    api_base: String,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    scope: String,
    app_token: RwLock<Option<AppToken>>,
}

impl DataverseClient {
    /// Create a connection for the configured environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(azure: &AzureAdConfig, dataverse: &DataverseConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(dataverse.http_timeout)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            http,
            api_base: api_base(&dataverse.url),
            token_endpoint: azure.token_endpoint(),
            client_id: azure.client_id.clone(),
            client_secret: azure.resolve_client_secret(),
            scope: dataverse.scope(),
            app_token: RwLock::new(None),
        })
    }

    /// Return a valid app token, re-acquiring if absent or near expiry.
    async fn app_token(&self) -> std::result::Result<String, ResolveError> {
        {
            let token = self.app_token.read();
            if let Some(ref t) = *token {
                if !t.is_expired() {
                    return Ok(t.access_token.clone());
                }
            }
        }

        let token = self.acquire_app_token().await?;
        let access_token = token.access_token.clone();
        *self.app_token.write() = Some(token);
        Ok(access_token)
    }

    /// Acquire a token with the client-credentials grant.
    async fn acquire_app_token(&self) -> std::result::Result<AppToken, ResolveError> {
        debug!(endpoint = %self.token_endpoint, scope = %self.scope, "Acquiring client-credentials token");

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                ResolveError::DownstreamUnavailable(format!("token endpoint unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ResolveError::DownstreamUnavailable(format!(
                "client-credentials token request failed: HTTP {status}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            ResolveError::DownstreamUnavailable(format!("unparseable token response: {e}"))
        })?;

        info!("Connected to Dataverse with client-credentials authentication");
        Ok(AppToken {
            access_token: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in.unwrap_or(300) as i64),
        })
    }
}

#[async_trait::async_trait]
impl DataverseConnection for DataverseClient {
    async fn find_application_users(
        &self,
        application_id: Uuid,
    ) -> std::result::Result<Vec<ApplicationUser>, ResolveError> {
        let token = self.app_token().await?;
        let url = format!("{}/systemusers", self.api_base);

        debug!(application_id = %application_id, "Querying application users");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header("Accept", "application/json")
            .query(&[
                ("$select", "systemuserid,fullname,applicationid"),
                ("$filter", &format!("applicationid eq {application_id}")),
            ])
            .send()
            .await
            .map_err(|e| {
                ResolveError::DownstreamUnavailable(format!("systemusers query failed: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ResolveError::DownstreamUnavailable(format!(
                "systemusers query failed: HTTP {status}"
            )));
        }

        let collection: ODataCollection<SystemUserRecord> =
            response.json().await.map_err(|e| {
                ResolveError::DownstreamUnavailable(format!("unparseable systemusers response: {e}"))
            })?;

        collection
            .value
            .into_iter()
            .map(|record| {
                let id = record.systemuserid.ok_or_else(|| {
                    ResolveError::IdentityNotFound(format!(
                        "application user record for {application_id} carries no systemuserid"
                    ))
                })?;
                Ok(ApplicationUser {
                    id,
                    full_name: record.fullname,
                })
            })
            .collect()
    }

    async fn who_am_i(
        &self,
        caller_id: Option<Uuid>,
    ) -> std::result::Result<WhoAmIResponse, ResolveError> {
        let token = self.app_token().await?;
        execute_who_am_i(&self.http, &self.api_base, &token, caller_id).await
    }
}

/// Execute the WhoAmI function with the given bearer token, impersonating
/// `caller_id` when given. Shared by the client-credentials connection and
/// delegated invocation.
pub(crate) async fn execute_who_am_i(
    http: &reqwest::Client,
    api_base: &str,
    bearer: &str,
    caller_id: Option<Uuid>,
) -> std::result::Result<WhoAmIResponse, ResolveError> {
    let url = format!("{api_base}/WhoAmI");

    let mut request = http
        .get(&url)
        .bearer_auth(bearer)
        .header("OData-MaxVersion", "4.0")
        .header("OData-Version", "4.0")
        .header("Accept", "application/json");

    if let Some(id) = caller_id {
        request = request.header(IMPERSONATION_HEADER, id.to_string());
    }

    let response = request.send().await.map_err(|e| {
        ResolveError::DownstreamUnavailable(format!("WhoAmI request failed: {e}"))
    })?;

    if !response.status().is_success() {
        let status = response.status();
        return Err(ResolveError::DownstreamUnavailable(format!(
            "WhoAmI request failed: HTTP {status}"
        )));
    }

    response.json().await.map_err(|e| {
        ResolveError::DownstreamUnavailable(format!("unparseable WhoAmI response: {e}"))
    })
}
