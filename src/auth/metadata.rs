//! Issuer metadata cache — OIDC discovery and JWKS fetching.
//!
//! # Refresh discipline
//!
//! - Cache hit (younger than TTL) returns immediately.
//! - On miss or expiry, exactly one fetch is in flight no matter how many
//!   callers arrive; the rest wait on the refresh gate and share the result.
//! - If a refresh fails and the previous value is younger than the stale
//!   ceiling, the previous value is served with a warning; otherwise the
//!   cache fails closed with [`AuthError::MetadataUnavailable`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::AuthError;
use crate::config::AzureAdConfig;

/// Issuer metadata and signing keys from the OIDC discovery endpoint.
#[derive(Debug, Clone)]
pub struct OidcMetadata {
    /// Issuer URL as published by the discovery document.
    pub issuer: String,
    /// Published signing-key set, keyed by `kid`.
    pub keys: JwkSet,
    /// When this value was fetched.
    pub fetched_at: Instant,
}

impl OidcMetadata {
    /// Age of this metadata value.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Seam for fetching issuer metadata. The HTTP implementation is used in
/// production; tests substitute counting or static fetchers.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    /// Fetch a fresh metadata value from the identity provider.
    async fn fetch(&self) -> Result<OidcMetadata, AuthError>;
}

/// OIDC discovery document (the fields this gateway consumes).
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: String,
}

/// Fetches the discovery document, then the JWKS it points at.
pub struct HttpMetadataFetcher {
    http: reqwest::Client,
    discovery_url: String,
}

impl HttpMetadataFetcher {
    /// Create a fetcher for the tenant's discovery URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(azure: &AzureAdConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(azure.http_timeout)
            .build()
            .map_err(|e| AuthError::MetadataUnavailable(e.to_string()))?;
        Ok(Self {
            http,
            discovery_url: azure.metadata_url(),
        })
    }
}

#[async_trait]
impl MetadataFetcher for HttpMetadataFetcher {
    async fn fetch(&self) -> Result<OidcMetadata, AuthError> {
        let unavailable = |e: reqwest::Error| AuthError::MetadataUnavailable(e.to_string());

        debug!(url = %self.discovery_url, "Fetching OIDC discovery document");
        let document: DiscoveryDocument = self
            .http
            .get(&self.discovery_url)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;

        debug!(jwks_uri = %document.jwks_uri, "Fetching signing-key set");
        let keys: JwkSet = self
            .http
            .get(&document.jwks_uri)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;

        Ok(OidcMetadata {
            issuer: document.issuer,
            keys,
            fetched_at: Instant::now(),
        })
    }
}

/// Caching front for a [`MetadataFetcher`] with single-flight refresh.
///
/// Created once at startup and shared by reference across request tasks.
pub struct MetadataCache {
    fetcher: Arc<dyn MetadataFetcher>,
    ttl: Duration,
    stale_ceiling: Duration,
    current: RwLock<Option<Arc<OidcMetadata>>>,
    refresh_gate: Mutex<()>,
}

impl MetadataCache {
    /// Create a cache over `fetcher` with the given freshness windows.
    #[must_use]
    pub fn new(fetcher: Arc<dyn MetadataFetcher>, ttl: Duration, stale_ceiling: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            stale_ceiling,
            current: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Return fresh metadata, fetching if the cached value is absent or
    /// older than the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MetadataUnavailable`] if the fetch fails and no
    /// stale value within the ceiling exists.
    pub async fn get(&self) -> Result<Arc<OidcMetadata>, AuthError> {
        if let Some(meta) = self.snapshot().await {
            if meta.age() < self.ttl {
                return Ok(meta);
            }
        }
        self.refresh().await
    }

    /// Force a refresh, bypassing the TTL. Used when a token carries a key
    /// id missing from the cached set (a key may have been rotated in).
    ///
    /// Coalesced: a refresh completed by another caller while this one
    /// waited on the gate satisfies this call too.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MetadataUnavailable`] if the fetch fails and no
    /// stale value within the ceiling exists.
    pub async fn refresh(&self) -> Result<Arc<OidcMetadata>, AuthError> {
        let started = Instant::now();
        let _gate = self.refresh_gate.lock().await;

        if let Some(meta) = self.snapshot().await {
            if meta.fetched_at >= started {
                return Ok(meta);
            }
        }

        match self.fetcher.fetch().await {
            Ok(meta) => {
                let meta = Arc::new(meta);
                *self.current.write().await = Some(Arc::clone(&meta));
                debug!(keys = meta.keys.keys.len(), issuer = %meta.issuer, "Issuer metadata refreshed");
                Ok(meta)
            }
            Err(err) => {
                if let Some(stale) = self.snapshot().await {
                    if stale.age() < self.stale_ceiling {
                        warn!(
                            error = %err,
                            age_secs = stale.age().as_secs(),
                            "Metadata refresh failed, serving last-known-good signing keys"
                        );
                        return Ok(stale);
                    }
                }
                Err(err)
            }
        }
    }

    async fn snapshot(&self) -> Option<Arc<OidcMetadata>> {
        self.current.read().await.clone()
    }
}
