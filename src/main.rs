//! Dataverse Gateway - OAuth2-protected backend for Dataverse
//!
//! Validates Azure AD bearer tokens and executes downstream operations as
//! either the calling user (On-Behalf-Of) or a mapped application user
//! (service-to-service impersonation).

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use dataverse_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Load configuration and run the server
async fn run_server(cli: Cli) -> ExitCode {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // CLI flags override file/env configuration
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }

    match Gateway::new(config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Gateway failed: {e}");
            ExitCode::FAILURE
        }
    }
}
