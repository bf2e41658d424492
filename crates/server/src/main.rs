//! Depot server binary.

use anyhow::{Context, Result};
use clap::Parser;
use depot_core::config::AppConfig;
use depot_progress::{ProgressRegistry, RegistryOptions};
use depot_server::{AppState, GatewayServer, create_router};
use depot_service::TransferService;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Depot - an artifact distribution server
#[derive(Parser, Debug)]
#[command(name = "depotd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DEPOT_CONFIG", default_value = "config/server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Depot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide or
    // override everything)
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("no config file found at {}", args.config);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("DEPOT_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    // Register Prometheus metrics
    depot_server::metrics::register_metrics();

    // Initialize storage and verify connectivity before accepting
    // requests
    let storage = depot_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .ensure_container()
        .await
        .context("failed to ensure storage container")?;
    storage
        .health()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "storage backend ready");

    // Progress registry and transfer service
    let registry = ProgressRegistry::new(RegistryOptions::from(&config.progress));
    let service = TransferService::new(
        storage,
        registry.clone(),
        config.server.clone(),
        config.progress.retention_after_terminal(),
    );

    let shutdown = CancellationToken::new();

    // Idle-session sweeper
    let sweeper = service.spawn_idle_sweeper(shutdown.clone());
    tracing::info!(
        idle_timeout_secs = config.server.session_idle_timeout_secs,
        "idle-session sweeper spawned"
    );

    // Subscription gateway on its own listener
    let gateway = GatewayServer::new(
        config.server.gateway_bind.clone(),
        registry.clone(),
        config.gateway.clone(),
        shutdown.clone(),
    );
    let gateway_task = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.run().await {
                tracing::error!("subscription gateway failed: {e}");
            }
        })
    };

    // RPC front
    let state = AppState::new(config.clone(), service, registry);
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    tracing::info!("listening on {addr}");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = serve_shutdown.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                }
            }
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = gateway_task.await;
    let _ = sweeper.await;
    tracing::info!("shutdown complete");

    Ok(())
}
