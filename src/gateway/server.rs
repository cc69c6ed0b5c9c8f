//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::handlers::{AppState, create_router};
use crate::auth::metadata::HttpMetadataFetcher;
use crate::auth::{MetadataCache, RequestAuthenticator, TokenValidator};
use crate::config::Config;
use crate::dataverse::{DataverseClient, DataverseConnection, DataverseInvoker};
use crate::identity::{ApplicationIdentityResolver, IdentityResolver, OboExchanger};
use crate::{Error, Result};

/// Dataverse gateway server
///
/// Owns every long-lived component: built once here, shared by reference
/// across request tasks, dropped together at shutdown.
pub struct Gateway {
    config: Config,
}

impl Gateway {
    /// Create a gateway from validated configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the gateway until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if a component cannot be constructed or the listen
    /// address cannot be bound.
    pub async fn run(self) -> Result<()> {
        let config = &self.config;

        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );

        // Token validation pipeline
        let fetcher = Arc::new(HttpMetadataFetcher::new(&config.azure_ad)?);
        let metadata = Arc::new(MetadataCache::new(
            fetcher,
            config.azure_ad.metadata_ttl,
            config.azure_ad.metadata_stale_ceiling,
        ));
        let validator = TokenValidator::new(Arc::clone(&metadata), &config.azure_ad);
        let authenticator = Arc::new(RequestAuthenticator::new(
            validator,
            &config.azure_ad,
            &config.server,
        ));

        // Identity resolution: OBO exchange plus the S2S connection
        let exchanger = OboExchanger::new(&config.azure_ad, &config.dataverse)?;
        let connection: Arc<dyn DataverseConnection> =
            Arc::new(DataverseClient::new(&config.azure_ad, &config.dataverse)?);
        let s2s = ApplicationIdentityResolver::new(
            Arc::clone(&connection),
            config.dataverse.identity_cache_ttl,
        );
        let resolver = IdentityResolver::new(exchanger, s2s);
        let invoker = DataverseInvoker::new(&config.dataverse)?;

        let state = Arc::new(AppState {
            authenticator,
            resolver,
            invoker,
        });

        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("DATAVERSE GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %config.server.host, port = config.server.port, "Listening");
        info!(tenant = %config.azure_ad.tenant_id, "Validating tokens for tenant");
        info!(dataverse = %config.dataverse.url, "Downstream environment");

        if config.azure_ad.accepted_scopes.is_empty() && config.azure_ad.accepted_roles.is_empty() {
            warn!("No accepted scopes or roles configured - any validated token is authorized");
        } else {
            info!(
                scopes = config.azure_ad.accepted_scopes.len(),
                roles = config.azure_ad.accepted_roles.len(),
                "Scope/role policy active"
            );
        }

        info!("Endpoints:");
        info!("  GET /api/whoami      (On-Behalf-Of, delegated user)");
        info!("  GET /api/whoami-s2s  (service-to-service, impersonated app user)");
        info!("  GET /health          (public)");
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
