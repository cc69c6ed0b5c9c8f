//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
///
/// Built once at startup and passed by reference into each component's
/// constructor; nothing reads the environment after `load` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order, later files override earlier. Variables are set into
    /// the process environment for `env:VAR` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Azure AD / token validation configuration
    pub azure_ad: AzureAdConfig,
    /// Dataverse downstream configuration
    pub dataverse: DataverseConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Paths that bypass authentication (default: `["/health"]`)
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7071,
            public_paths: default_public_paths(),
        }
    }
}

/// Azure AD tenant, app registration, and token validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureAdConfig {
    /// Directory (tenant) id
    pub tenant_id: String,

    /// App registration client id. Doubles as an accepted audience.
    pub client_id: String,

    /// App registration client secret (supports `env:VAR_NAME`)
    pub client_secret: String,

    /// Authority host. Sovereign clouds use a different host
    /// (e.g. `https://login.microsoftonline.us`).
    pub authority_host: String,

    /// Scopes accepted on delegated tokens (empty = any delegated token)
    #[serde(default)]
    pub accepted_scopes: Vec<String>,

    /// App roles accepted on application tokens (empty = any role)
    #[serde(default)]
    pub accepted_roles: Vec<String>,

    /// Accepted issuer URLs. Empty = derived from the tenant id
    /// (v2.0, legacy sts, and managed-identity issuer forms).
    #[serde(default)]
    pub accepted_issuers: Vec<String>,

    /// Accepted audiences. Empty = derived from the client id
    /// (bare id plus the `api://` resource form).
    #[serde(default)]
    pub accepted_audiences: Vec<String>,

    /// How long fetched issuer metadata (signing keys) stays fresh
    #[serde(with = "humantime_serde")]
    pub metadata_ttl: Duration,

    /// Hard ceiling on serving stale metadata after a failed refresh.
    /// Past this age the gateway fails closed.
    #[serde(with = "humantime_serde")]
    pub metadata_stale_ceiling: Duration,

    /// Clock-skew allowance for token lifetime checks
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,

    /// Timeout for metadata and token-endpoint requests
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
}

impl Default for AzureAdConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            authority_host: "https://login.microsoftonline.com".to_string(),
            accepted_scopes: Vec::new(),
            accepted_roles: Vec::new(),
            accepted_issuers: Vec::new(),
            accepted_audiences: Vec::new(),
            metadata_ttl: Duration::from_secs(3600),
            metadata_stale_ceiling: Duration::from_secs(24 * 3600),
            clock_skew: Duration::from_secs(60),
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl AzureAdConfig {
    /// Tenant authority URL, e.g. `https://login.microsoftonline.com/<tenant>`
    #[must_use]
    pub fn authority(&self) -> String {
        format!(
            "{}/{}",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }

    /// OIDC discovery URL for the tenant
    #[must_use]
    pub fn metadata_url(&self) -> String {
        format!("{}/v2.0/.well-known/openid-configuration", self.authority())
    }

    /// OAuth2 token endpoint for the tenant
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority())
    }

    /// Accepted issuer set.
    ///
    /// Defaults to the three issuer forms Azure AD stamps on tokens for the
    /// same tenant: v2.0 tokens, legacy v1.0 tokens, and tokens acquired via
    /// managed identity.
    #[must_use]
    pub fn issuers(&self) -> Vec<String> {
        if !self.accepted_issuers.is_empty() {
            return self.accepted_issuers.clone();
        }
        vec![
            format!("https://login.microsoftonline.com/{}/v2.0", self.tenant_id),
            format!("https://sts.windows.net/{}/", self.tenant_id),
            format!("https://login.microsoftonline.com/{}/", self.tenant_id),
        ]
    }

    /// Accepted audience set.
    ///
    /// Defaults to the bare client id plus the `api://` resource identifier;
    /// v1.0 and v2.0 tokens format the audience differently for the same app.
    #[must_use]
    pub fn audiences(&self) -> Vec<String> {
        if !self.accepted_audiences.is_empty() {
            return self.accepted_audiences.clone();
        }
        vec![self.client_id.clone(), format!("api://{}", self.client_id)]
    }

    /// Resolve the client secret (expand `env:VAR_NAME` indirection)
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        resolve_secret(&self.client_secret)
    }
}

/// Dataverse downstream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataverseConfig {
    /// Environment URL, e.g. `https://org.crm.dynamics.com`
    pub url: String,

    /// Timeout for Dataverse Web API requests
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,

    /// TTL for the client-id -> application-user mapping cache.
    /// Zero disables the cache; every request then queries Dataverse.
    #[serde(with = "humantime_serde")]
    pub identity_cache_ttl: Duration,
}

impl Default for DataverseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            http_timeout: Duration::from_secs(10),
            identity_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl DataverseConfig {
    /// Token scope for the environment (`{url}/.default`)
    #[must_use]
    pub fn scope(&self) -> String {
        format!("{}/.default", self.url.trim_end_matches('/'))
    }
}

/// Resolve a secret value, expanding `env:VAR_NAME` indirection
fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (DV_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("DV_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before secret resolution)
        config.load_env_files();

        config.validate()?;
        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {path_str}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {path_str}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }

    /// Check that the settings the pipeline cannot run without are present
    fn validate(&self) -> Result<()> {
        for (value, name) in [
            (&self.azure_ad.tenant_id, "azure_ad.tenant_id"),
            (&self.azure_ad.client_id, "azure_ad.client_id"),
            (&self.azure_ad.client_secret, "azure_ad.client_secret"),
            (&self.dataverse.url, "dataverse.url"),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{name} is required")));
            }
        }

        Url::parse(&self.dataverse.url)
            .map_err(|e| Error::Config(format!("dataverse.url is not a valid URL: {e}")))?;
        Ok(())
    }
}
