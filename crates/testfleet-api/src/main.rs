//! testfleet queue server

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use testfleet_api::{AppState, routes};
use testfleet_config::{QueueServerConfig, load_server_config};
use testfleet_scheduler::{spawn_aliveness_sweep, spawn_termination_watcher};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "testfleet-server")]
#[command(about = "Distributes test buckets to remote workers", long_about = None)]
struct Args {
    /// Path to the KDL configuration file
    #[arg(long, env = "TESTFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration file
    #[arg(long, env = "TESTFLEET_LISTEN")]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long, env = "TESTFLEET_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            load_server_config(path)?
        }
        None => QueueServerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let state = AppState::from_config(&config);
    info!(
        version = %state.dispatcher.version(),
        known_workers = config.workers.len(),
        worker_policy = ?config.worker_policy,
        termination = ?config.termination,
        "Queue initialized"
    );

    let shutdown = CancellationToken::new();
    let sweep = spawn_aliveness_sweep(
        state.dispatcher.clone(),
        config.aliveness.sweep_interval(),
        shutdown.child_token(),
    );
    let watcher = spawn_termination_watcher(
        state.dispatcher.clone(),
        config.termination_poll_interval(),
        shutdown.clone(),
    );

    // Build router
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    info!("Starting server on {}", config.listen);
    let listener = TcpListener::bind(config.listen).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = signal.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down");
                }
            }
        })
        .await?;

    shutdown.cancel();
    sweep.await?;
    watcher.await?;
    info!("Server stopped");
    Ok(())
}
