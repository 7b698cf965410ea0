//! enroll-daemon - Device Onboarding Service daemon
//!
//! Serves the onboarding API over HTTP and Prometheus metrics on a separate
//! listener. The onboarding core is synchronous; request handlers bridge
//! into it via `spawn_blocking`, so an in-flight saga survives client
//! disconnects and always reaches a terminal state before the task ends.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use enroll_core::adapter::{InMemoryPolicyStore, InMemoryRegistry, LocalIdentityAuthority};
use enroll_core::{Orchestrator, SqliteLedger};
use enroll_daemon::config::DaemonConfig;
use enroll_daemon::handlers::{metrics_router, router};
use enroll_daemon::metrics::MetricsRegistry;
use enroll_daemon::state::AppState;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "enroll-daemon", version, about = "Device onboarding service daemon")]
struct Args {
    /// Path to the daemon configuration file (TOML). Defaults apply when
    /// omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the API listen address from the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Tracing filter when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_filter.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    if let Some(dir) = &config.storage.certificate_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating certificate dir {}", dir.display()))?;
    }

    let ledger = Arc::new(
        SqliteLedger::open(&config.storage.ledger_path).with_context(|| {
            format!(
                "opening onboarding ledger at {}",
                config.storage.ledger_path.display()
            )
        })?,
    );

    let orchestrator = Arc::new(Orchestrator::new(
        ledger,
        Arc::new(LocalIdentityAuthority::new()),
        Arc::new(InMemoryPolicyStore::new()),
        Arc::new(InMemoryRegistry::new()),
        config.onboarding.clone(),
    ));

    let metrics_registry = Arc::new(MetricsRegistry::new().context("registering metrics")?);
    let state = Arc::new(AppState::new(
        orchestrator,
        metrics_registry.daemon_metrics(),
        &config,
    ));

    // Metrics on its own listener, detached from API lifecycle.
    let metrics_addr = config.server.metrics_addr;
    let metrics_app = metrics_router(Arc::clone(&metrics_registry));
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(metrics_addr).await {
            Ok(listener) => {
                info!(addr = %metrics_addr, "metrics listener started");
                if let Err(err) = axum::serve(listener, metrics_app).await {
                    error!(error = %err, "metrics server failed");
                }
            },
            Err(err) => error!(addr = %metrics_addr, error = %err, "failed to bind metrics listener"),
        }
    });

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("binding API listener on {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "onboarding API started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    info!("shutdown complete");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            return std::future::pending::<()>().await;
        },
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }
}
