mod config;
mod health;
mod http;
mod metrics;
mod route;
mod upstream;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::upstream::Forwarder;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "wellbeing-proxy", about = "Retrying reverse proxy for the wellbeing map API")]
struct Cli {
    /// Path to the YAML configuration file.  Built-in defaults apply when
    /// omitted.
    #[arg(short, long, env = "WELLBEING_PROXY_CONFIG")]
    config: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
    pub forwarder: Forwarder,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(config.upstream.user_agent.as_str())
            .build()
            .context("failed to build reqwest client")?;
        let forwarder = Forwarder::new(http_client.clone(), config.upstream.api_root());

        Ok(Self {
            config: Arc::new(config),
            metrics: MetricsRegistry::new(),
            http_client,
            forwarder,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .listen
        .parse()
        .context("invalid server.listen address")?;
    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(cli.config.as_deref())?;

    tracing::info!(
        config_path = ?cli.config,
        upstream = %config.upstream.api_root(),
        max_attempts = config.retry.max_attempts,
        "starting wellbeing-proxy"
    );

    // ---- App state ----
    let state = AppState::new(config)?;

    run_http_server(state).await?;

    tracing::info!("wellbeing-proxy shut down cleanly");
    Ok(())
}
