//! Shared daemon state.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use enroll_core::Orchestrator;

use crate::config::DaemonConfig;
use crate::metrics::DaemonMetrics;

/// Shared daemon state handle.
pub type SharedState = Arc<AppState>;

/// Immutable per-process state shared by all handlers.
///
/// There is deliberately no daemon-level mutable state here: each request
/// is an independent unit of work, and same-key serialization lives in the
/// ledger's conditional writes, not in process-wide locks.
pub struct AppState {
    /// The saga coordinator.
    pub orchestrator: Arc<Orchestrator>,
    /// Daemon metrics handle.
    pub metrics: DaemonMetrics,
    /// Broker endpoint handed to freshly onboarded devices.
    pub broker_endpoint: Option<String>,
    /// Directory issued certificates are written to, if configured.
    pub certificate_dir: Option<PathBuf>,
    /// Time the daemon started.
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Creates the shared state.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        metrics: DaemonMetrics,
        config: &DaemonConfig,
    ) -> Self {
        Self {
            orchestrator,
            metrics,
            broker_endpoint: config.server.broker_endpoint.clone(),
            certificate_dir: config.storage.certificate_dir.clone(),
            started_at: Utc::now(),
        }
    }

    /// Daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}
