//! Transit feed archiver binary entrypoint.
//! Loads configuration, wires the ingestion cycle and runs the scheduler until
//! Ctrl-C / SIGTERM.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

use transit_feed_archiver::{
    bootstrap, clock::SystemClock, config::ArchiverConfig, metrics::Metrics, telemetry,
};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
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

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();

    let cfg = ArchiverConfig::load_default().context("loading configuration")?;
    telemetry::init_tracing(cfg.log_format);
    cfg.log_warnings();
    tracing::info!(?cfg, "configuration loaded");

    if let Some(addr) = cfg.metrics_addr {
        let metrics = Metrics::init()?;
        tokio::spawn(async move {
            if let Err(e) = metrics.serve(addr).await {
                tracing::error!(error = ?e, "metrics endpoint stopped");
            }
        });
    }

    let scheduler = bootstrap::build_scheduler(&cfg, Arc::new(SystemClock))?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = scheduler.spawn(stop_rx);

    shutdown_signal().await;
    tracing::info!("shutdown requested, waiting for the current cycle to finish");
    let _ = stop_tx.send(true);
    handle.await.context("scheduler task")?;
    Ok(())
}
