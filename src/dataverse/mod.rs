//! Dataverse downstream collaborator
//!
//! Two independent connection kinds reach the Dataverse Web API:
//!
//! - the client-credentials [`DataverseClient`], shared across requests,
//!   used for S2S queries and impersonated execution;
//! - per-call delegated execution through [`DataverseInvoker`], which runs
//!   on a token re-acquired from the caller's delegated context.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub use client::DataverseClient;

use crate::config::DataverseConfig;
use crate::identity::{ResolveError, ResolvedIdentity};
use crate::{Error, Result};

/// WhoAmI payload — PascalCase GUID triple, exactly as the Dataverse Web
/// API returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    /// Executing user id (the delegated user or the impersonated
    /// application user).
    #[serde(rename = "UserId")]
    pub user_id: Uuid,
    /// Business unit of the executing user.
    #[serde(rename = "BusinessUnitId")]
    pub business_unit_id: Uuid,
    /// Organization the call executed against.
    #[serde(rename = "OrganizationId")]
    pub organization_id: Uuid,
}

/// An application user record from the `systemusers` table.
#[derive(Debug, Clone)]
pub struct ApplicationUser {
    /// `systemuserid` of the record.
    pub id: Uuid,
    /// `fullname`, when set on the record.
    pub full_name: Option<String>,
}

/// Client-credentials connection to the Dataverse Web API.
///
/// The production implementation is [`DataverseClient`]; tests substitute
/// fakes to drive the resolver without a live environment.
#[async_trait]
pub trait DataverseConnection: Send + Sync {
    /// Query application users whose `applicationid` equals `application_id`.
    async fn find_application_users(
        &self,
        application_id: Uuid,
    ) -> std::result::Result<Vec<ApplicationUser>, ResolveError>;

    /// Execute WhoAmI, impersonating `caller_id` when given.
    async fn who_am_i(
        &self,
        caller_id: Option<Uuid>,
    ) -> std::result::Result<WhoAmIResponse, ResolveError>;
}

/// Executes downstream operations under a resolved identity.
pub struct DataverseInvoker {
    http: reqwest::Client,
    api_base: String,
}

impl DataverseInvoker {
    /// Create an invoker for the configured environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(dataverse: &DataverseConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(dataverse.http_timeout)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            http,
            api_base: client::api_base(&dataverse.url),
        })
    }

    /// Execute WhoAmI under `identity`.
    ///
    /// # Errors
    ///
    /// Propagates [`ResolveError`] from token re-acquisition or the
    /// downstream call.
    pub async fn who_am_i(
        &self,
        identity: &ResolvedIdentity,
    ) -> std::result::Result<WhoAmIResponse, ResolveError> {
        let response = match identity {
            ResolvedIdentity::Delegated(context) => {
                // Every delegated call runs on a freshly exchanged token so
                // long-lived connections never serve an expired one.
                let token = context.fresh_token().await?;
                client::execute_who_am_i(&self.http, &self.api_base, &token, None).await?
            }
            ResolvedIdentity::Impersonation(context) => {
                context
                    .connection
                    .who_am_i(Some(context.application_user_id))
                    .await?
            }
        };

        info!(
            user_id = %response.user_id,
            business_unit_id = %response.business_unit_id,
            organization_id = %response.organization_id,
            "WhoAmI executed"
        );
        Ok(response)
    }
}
