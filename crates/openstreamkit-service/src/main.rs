//! # OpenStreamKit Service
//!
//! Binary entry point for the OpenStreamKit engine.
//!
//! This executable:
//! - Loads configuration from files, `OSK__` variables and the plain `KICK_*` variables
//! - Initializes logging
//! - Wires the credential manager, webhook pipeline and built-in handlers
//! - Runs the background credential refresh loop next to the HTTP server
//! - Shuts everything down on SIGINT/SIGTERM
//!
//! Exit codes: 1 bind failure, 2 server failure, 3 invalid configuration,
//! 4 startup failure (token file, webhook key).

use clap::Parser;
use openstreamkit_api::config::LoggingConfig;
use openstreamkit_api::{start_server, AppState, ServiceConfig};
use openstreamkit_core::auth::run_refresh_loop;
use openstreamkit_core::dispatch::handlers::register_builtin_handlers;
use openstreamkit_core::{AuthState, HandlerRegistryBuilder};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "openstreamkit", version, about = "Local-first stream event engine")]
struct Args {
    /// Configuration file (YAML, JSON or TOML)
    #[arg(short, long, env = "OSK_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Print the effective configuration with secrets redacted, then exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match ServiceConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&LoggingConfig::default());
            error!(error = %e, "Service configuration is invalid; aborting");
            std::process::exit(3);
        }
    };

    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting OpenStreamKit");

    let login_hint = format!("http://{}/login", config.bind_address());
    let handlers = register_builtin_handlers(HandlerRegistryBuilder::new());
    let state = match AppState::from_config(config, handlers).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to start service");
            std::process::exit(e.exit_code());
        }
    };

    match state.credentials.status() {
        AuthState::NotAuthorized => {
            info!(url = %login_hint, "Not authorized yet; open the login URL to authorize")
        }
        AuthState::Authorized { expires_at } => {
            info!(expires_at = %expires_at, "Stored credential loaded")
        }
        AuthState::ReauthorizationRequired { reason } => {
            warn!(reason = %reason, url = %login_hint, "Authorization required")
        }
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let refresh = tokio::spawn(run_refresh_loop(
        state.credentials.clone(),
        shutdown.child_token(),
    ));

    let result = start_server(state.clone(), shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = refresh.await {
        warn!(error = %e, "Credential refresh loop ended abnormally");
    }
    if let Err(e) = state.credentials.close().await {
        warn!(error = %e, "Token store did not close cleanly");
    }

    if let Err(e) = result {
        error!(error = %e, "Server stopped with an error");
        std::process::exit(e.exit_code());
    }

    info!("OpenStreamKit stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json_format {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
