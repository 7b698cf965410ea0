//! Prometheus metrics for onboarding observability.
//!
//! # Metrics Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `enroll_requests_total` | Counter | `endpoint`, `status` |
//! | `enroll_onboardings_total` | Counter | `outcome` |
//! | `enroll_deprovisions_total` | Counter | `outcome` |
//! | `enroll_compensations_total` | Counter | `result` |
//! | `enroll_sagas_in_flight` | Gauge | - |

use std::sync::Arc;

use prometheus::{CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Daemon metrics, registered against a shared Prometheus registry.
///
/// All metrics use interior mutability and are safe to share across
/// threads.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    /// HTTP requests by endpoint and status class.
    requests_total: CounterVec,

    /// Onboarding results by outcome
    /// (`provisioned`/`resumed`/`replayed`/`rejected`/`in_progress`/`failed`).
    onboardings_total: CounterVec,

    /// Deprovisioning results by outcome (`ok`/`rejected`/`failed`).
    deprovisions_total: CounterVec,

    /// Compensation runs by result (`clean`/`failed`).
    compensations_total: CounterVec,

    /// Sagas currently executing.
    sagas_in_flight: Gauge,
}

impl DaemonMetrics {
    /// Creates daemon metrics and registers them with the given registry.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g. duplicate
    /// name).
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let requests_total = CounterVec::new(
            Opts::new("enroll_requests_total", "HTTP requests by endpoint"),
            &["endpoint", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let onboardings_total = CounterVec::new(
            Opts::new("enroll_onboardings_total", "Onboarding results by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(onboardings_total.clone()))?;

        let deprovisions_total = CounterVec::new(
            Opts::new(
                "enroll_deprovisions_total",
                "Deprovisioning results by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(deprovisions_total.clone()))?;

        let compensations_total = CounterVec::new(
            Opts::new("enroll_compensations_total", "Compensation runs by result"),
            &["result"],
        )?;
        registry.register(Box::new(compensations_total.clone()))?;

        let sagas_in_flight = Gauge::new("enroll_sagas_in_flight", "Sagas currently executing")?;
        registry.register(Box::new(sagas_in_flight.clone()))?;

        Ok(Self {
            requests_total,
            onboardings_total,
            deprovisions_total,
            compensations_total,
            sagas_in_flight,
        })
    }

    /// Records one handled HTTP request.
    pub fn request_completed(&self, endpoint: &str, status: u16) {
        self.requests_total
            .with_label_values(&[endpoint, &status.to_string()])
            .inc();
    }

    /// Records an onboarding result.
    pub fn onboarding_finished(&self, outcome: &str) {
        self.onboardings_total.with_label_values(&[outcome]).inc();
    }

    /// Records a deprovisioning result.
    pub fn deprovision_finished(&self, outcome: &str) {
        self.deprovisions_total.with_label_values(&[outcome]).inc();
    }

    /// Records that a compensation ran, and whether it was clean.
    pub fn compensation_ran(&self, clean: bool) {
        let result = if clean { "clean" } else { "failed" };
        self.compensations_total.with_label_values(&[result]).inc();
    }

    /// Marks a saga as started.
    pub fn saga_started(&self) {
        self.sagas_in_flight.inc();
    }

    /// Marks a saga as finished.
    pub fn saga_finished(&self) {
        self.sagas_in_flight.dec();
    }
}

/// A registry paired with its daemon metrics.
pub struct MetricsRegistry {
    registry: Registry,
    metrics: DaemonMetrics,
}

impl MetricsRegistry {
    /// Creates a fresh registry with all daemon metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let metrics = DaemonMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// The daemon metrics handle.
    #[must_use]
    pub fn daemon_metrics(&self) -> DaemonMetrics {
        self.metrics.clone()
    }

    /// Encodes all registered metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry handle.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;
