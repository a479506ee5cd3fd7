//! SFU binary entry point

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chorus_sfu::config::Config;
use chorus_sfu::engine::Engine;
use chorus_sfu::router::Router;
use chorus_sfu::rpc::{build_router, AppState};

/// Selective forwarding unit for real-time audio conferencing
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "chorus.toml", env = "CHORUS_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Arc::new(Config::load(&args.config)?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.engine.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        version = chorus_sfu::version(),
        config = %args.config,
        "starting SFU"
    );

    let engine = Engine::new(&config.engine);

    let monitor_handle = tokio::spawn(Arc::clone(&engine).run_monitor());

    let state = AppState {
        router: Arc::new(Router::new(engine)),
        config: Arc::clone(&config),
    };
    let app = build_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.rpc.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("RPC server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor_handle.abort();
    tracing::info!("SFU shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
