//! Service-to-service application identity resolution
//!
//! The calling application's client id is read from the already-validated
//! token (no re-validation here) and mapped to the Dataverse application
//! user provisioned for that app registration. The resulting context
//! impersonates that user over the client-credentials connection.
//!
//! Claim priority for the client id: `azp` (authorized party), then
//! `appid` (v1.0 application id), then — last resort — the `aud` claim.
//! The `aud` fallback is dubious: the audience names the resource the token
//! was minted *for*, not the caller, so it is logged as a warning whenever
//! taken.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ResolveError;
use crate::auth::BearerToken;
use crate::auth::claims::{
    CLAIM_APP_ID, CLAIM_AUDIENCE, CLAIM_AUTHORIZED_PARTY, decode_claims_unverified,
};
use crate::dataverse::DataverseConnection;

/// Impersonation handle: a mapped application user id plus the S2S
/// connection the downstream call will execute over.
pub struct ImpersonationContext {
    /// Dataverse `systemuserid` of the mapped application user.
    pub application_user_id: Uuid,
    /// The client-credentials connection to execute under.
    pub connection: Arc<dyn DataverseConnection>,
}

impl std::fmt::Debug for ImpersonationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpersonationContext")
            .field("application_user_id", &self.application_user_id)
            .field("connection", &"<dyn DataverseConnection>")
            .finish()
    }
}

/// Advisory TTL cache for client-id → application-user mappings.
///
/// A miss or stale entry always falls through to a fresh downstream query;
/// cache absence is never a failure by itself.
struct IdentityMappingCache {
    entries: DashMap<String, CachedMapping>,
    ttl: Duration,
}

struct CachedMapping {
    user_id: Uuid,
    cached_at: Instant,
}

impl IdentityMappingCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, client_id: &str) -> Option<Uuid> {
        if self.ttl.is_zero() {
            return None;
        }
        let entry = self.entries.get(client_id)?;
        (entry.cached_at.elapsed() < self.ttl).then(|| entry.user_id)
    }

    fn insert(&self, client_id: &str, user_id: Uuid) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(
            client_id.to_string(),
            CachedMapping {
                user_id,
                cached_at: Instant::now(),
            },
        );
    }
}

/// Maps calling applications to provisioned Dataverse application users.
pub struct ApplicationIdentityResolver {
    connection: Arc<dyn DataverseConnection>,
    cache: IdentityMappingCache,
}

impl ApplicationIdentityResolver {
    /// Create a resolver over the client-credentials connection.
    /// `cache_ttl` of zero disables the mapping cache.
    #[must_use]
    pub fn new(connection: Arc<dyn DataverseConnection>, cache_ttl: Duration) -> Self {
        Self {
            connection,
            cache: IdentityMappingCache::new(cache_ttl),
        }
    }

    /// Resolve the impersonation context for a validated service token.
    ///
    /// # Errors
    ///
    /// [`ResolveError::ClientIdNotFound`] when no client id can be read
    /// from the token or no application user is registered for it;
    /// [`ResolveError::IdentityNotFound`] when a record matches but carries
    /// no usable identity; [`ResolveError::DownstreamUnavailable`] when the
    /// query cannot be executed.
    pub async fn resolve_application_identity(
        &self,
        service_token: &BearerToken,
    ) -> Result<ImpersonationContext, ResolveError> {
        let client_id = extract_client_id(service_token)?;
        info!(client_id = %client_id, "Resolving application identity");

        if let Some(user_id) = self.cache.get(&client_id) {
            debug!(client_id = %client_id, user_id = %user_id, "Application identity cache hit");
            return Ok(self.context(user_id));
        }

        let application_id = Uuid::parse_str(&client_id).map_err(|_| {
            ResolveError::ClientIdNotFound(format!(
                "client id '{client_id}' is not an application id"
            ))
        })?;

        let records = self.connection.find_application_users(application_id).await?;

        let record = match records.as_slice() {
            [] => {
                return Err(ResolveError::ClientIdNotFound(format!(
                    "no application user registered for client id {client_id}"
                )));
            }
            [only] => only,
            [first, ..] => {
                warn!(
                    client_id = %client_id,
                    matches = records.len(),
                    "Multiple application users for client id, using the first"
                );
                first
            }
        };

        info!(
            user_id = %record.id,
            name = record.full_name.as_deref().unwrap_or("<unnamed>"),
            "Found application user"
        );

        self.cache.insert(&client_id, record.id);
        Ok(self.context(record.id))
    }

    fn context(&self, application_user_id: Uuid) -> ImpersonationContext {
        ImpersonationContext {
            application_user_id,
            connection: Arc::clone(&self.connection),
        }
    }
}

/// Extract the calling application's client id from token claims, in
/// `azp` → `appid` → `aud` priority order.
fn extract_client_id(token: &BearerToken) -> Result<String, ResolveError> {
    let claims = decode_claims_unverified(token.as_str())
        .map_err(|e| ResolveError::ClientIdNotFound(e.to_string()))?;

    for claim in [CLAIM_AUTHORIZED_PARTY, CLAIM_APP_ID] {
        if let Some(value) = claims.get(claim).and_then(Value::as_str) {
            debug!(claim = claim, "Extracted client id from token");
            return Ok(value.to_string());
        }
    }

    let aud = match claims.get(CLAIM_AUDIENCE) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(values)) => values.iter().find_map(Value::as_str).map(str::to_string),
        _ => None,
    };
    if let Some(aud) = aud {
        // The audience names the token's resource, not the caller; a
        // managed-identity token can resolve to the wrong application user
        // through this path.
        warn!(aud = %aud, "No azp/appid claim, falling back to aud as client id");
        return Ok(aud);
    }

    Err(ResolveError::ClientIdNotFound(
        "token carries no azp, appid, or aud claim".to_string(),
    ))
}
