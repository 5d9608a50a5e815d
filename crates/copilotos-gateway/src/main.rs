mod app;
mod http;
mod middleware;
mod problem;
mod retrieval;

use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use copilotos_core::config::CopilotConfig;

use crate::app::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "copilotos-gateway", about = "Chat-orchestration API gateway")]
struct Args {
    /// Path to copilotos.toml (default: ~/.copilotos/copilotos.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = CopilotConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("metrics recorder install failed: {e}"))?;

    let state = Arc::new(AppState::build(config, metrics_handle)?);

    // Hourly cleanup of terminal tasks past their TTL.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let tasks = Arc::clone(&state.tasks);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            tasks.run_cleanup_loop(shutdown_rx).await;
        });
    }

    let addr = format!("{}:{}", state.config.gateway.bind, state.config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "copilotos gateway listening");

    let router = build_router(Arc::clone(&state));
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = result {
        error!(error = %e, "server exited with error");
        return Err(e.into());
    }
    info!("copilotos gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
