use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use blockdev::agent;
use blockdev::config::{self, AgentConfig};

/// Runs a Minecraft server on this host and exposes it over an
/// authenticated WebSocket.
#[derive(Debug, Parser)]
#[command(name = "blockdev-agent", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "BLOCKDEV_AGENT_PORT", default_value_t = config::DEFAULT_AGENT_PORT)]
    port: u16,

    /// Directory for the token, server files and uploads.
    #[arg(long, env = "BLOCKDEV_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = AgentConfig {
        port: args.port,
        data_dir: args.data_dir.unwrap_or_else(config::default_data_dir),
    };
    let bind_address = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    tracing::info!(data_dir = %cfg.data_dir.display(), "Starting agent");

    let state = agent::bootstrap(cfg).await?;

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            agent::shutdown(&state).await;
            return Err(e).with_context(|| format!("Failed to bind {}", bind_address));
        }
    };
    tracing::info!("Listening on {}", bind_address);

    agent::serve(state, listener, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
