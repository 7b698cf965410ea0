//! HTTP request handlers.
//!
//! Thin glue between the HTTP surface and the orchestrator: deserialize,
//! validate-by-delegation, `spawn_blocking` into the synchronous core, map
//! the error taxonomy onto status codes. Failure details stay in the logs;
//! callers get generic messages (resource identifiers are returned only for
//! successfully provisioned devices).
//!
//! Routes:
//!
//! - `POST`/`PUT /onboard/{serial}` — provision (idempotent)
//! - `GET /onboard/{serial}?group=` — record status, never key material
//! - `GET /onboard?group=` — list a group's records
//! - `DELETE /onboard/{serial}?group=` — deprovision
//! - `GET /healthz` — liveness and ledger statistics

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use enroll_core::record::OnboardingRecord;
use enroll_core::request::{DeprovisionRequest, OnboardRequest, OnboardResult};
use enroll_core::{OnboardOutcome, OnboardingError};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::metrics::SharedMetricsRegistry;
use crate::state::SharedState;

/// Builds the onboarding API router.
pub fn router(state: SharedState) -> axum::Router {
    axum::Router::new()
        .route("/onboard", get(list_records))
        .route(
            "/onboard/:serial",
            get(get_record)
                .post(onboard)
                .put(onboard)
                .delete(deprovision),
        )
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Builds the metrics router served on the metrics listener.
pub fn metrics_router(registry: SharedMetricsRegistry) -> axum::Router {
    axum::Router::new().route(
        "/metrics",
        get(move || {
            let registry = Arc::clone(&registry);
            async move {
                match registry.encode_text() {
                    Ok(text) => (StatusCode::OK, text).into_response(),
                    Err(err) => {
                        error!(error = %err, "metrics encoding failed");
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    },
                }
            }
        }),
    )
}

/// JSON error body returned for every failure.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// An HTTP-mapped failure.
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.code,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

/// Maps orchestrator errors onto HTTP, leaking nothing beyond the taxonomy.
fn map_error(err: &OnboardingError) -> ApiError {
    match err {
        OnboardingError::Validation(cause) => ApiError::new(
            StatusCode::BAD_REQUEST,
            "validation_error",
            cause.to_string(),
        ),
        OnboardingError::InProgress { .. } => ApiError::new(
            StatusCode::CONFLICT,
            "in_progress",
            "onboarding already in progress; retry shortly",
        ),
        OnboardingError::Conflict { reason, .. } => {
            ApiError::new(StatusCode::CONFLICT, "conflict", reason.clone())
        },
        OnboardingError::ProvisioningFailed { .. } => ApiError::new(
            StatusCode::BAD_GATEWAY,
            "provisioning_failed",
            "device provisioning failed",
        ),
        OnboardingError::CompensationFailure { .. } => ApiError::new(
            StatusCode::BAD_GATEWAY,
            "provisioning_failed",
            "device provisioning failed; operator intervention required",
        ),
        _ => ApiError::internal(),
    }
}

/// Metrics outcome label for an onboarding result.
fn onboard_outcome_label(result: &Result<OnboardResult, OnboardingError>) -> &'static str {
    match result {
        Ok(result) => match result.outcome {
            OnboardOutcome::Provisioned => "provisioned",
            OnboardOutcome::Resumed => "resumed",
            OnboardOutcome::Replayed => "replayed",
        },
        Err(OnboardingError::Validation(_) | OnboardingError::Conflict { .. }) => "rejected",
        Err(OnboardingError::InProgress { .. }) => "in_progress",
        Err(
            OnboardingError::ProvisioningFailed { .. }
            | OnboardingError::CompensationFailure { .. },
        ) => "failed",
        Err(_) => "error",
    }
}

/// Opaque caller subject from the `Authorization` header. Validation is the
/// front door's job; the value is used for log attribution only.
fn caller_identity(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    Some(
        value
            .strip_prefix("Bearer ")
            .unwrap_or(value)
            .to_string(),
    )
}

// =============================================================================
// Onboard
// =============================================================================

/// Request body for `POST`/`PUT /onboard/{serial}`.
#[derive(Debug, Deserialize)]
struct OnboardBody {
    device_group: String,
    topic_namespace: String,
}

/// Response for a successful onboarding. `certificate` and `private_key`
/// are present exactly once, on first completion.
#[derive(Debug, Serialize)]
struct OnboardResponse {
    device_group: String,
    serial_number: String,
    identity_id: String,
    registry_entry_name: String,
    outcome: OnboardOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    broker_endpoint: Option<String>,
}

async fn onboard(
    State(state): State<SharedState>,
    Path(serial): Path<String>,
    headers: HeaderMap,
    Json(body): Json<OnboardBody>,
) -> Response {
    let request = OnboardRequest {
        device_group: body.device_group,
        serial_number: serial,
        topic_namespace: body.topic_namespace,
        caller_identity: caller_identity(&headers),
    };

    let orchestrator = Arc::clone(&state.orchestrator);
    state.metrics.saga_started();
    let result = tokio::task::spawn_blocking(move || orchestrator.onboard(&request)).await;
    state.metrics.saga_finished();

    // A panicked saga task is an internal error; the ledger record stays
    // resumable.
    let Ok(result) = result else {
        error!("onboarding task panicked");
        state.metrics.request_completed("onboard", 500);
        return ApiError::internal().into_response();
    };

    state
        .metrics
        .onboarding_finished(onboard_outcome_label(&result));
    match &result {
        Err(err @ OnboardingError::ProvisioningFailed { .. }) => {
            state.metrics.compensation_ran(true);
            warn!(error = %err, "onboarding failed");
        },
        Err(err @ OnboardingError::CompensationFailure { .. }) => {
            state.metrics.compensation_ran(false);
            error!(error = %err, "onboarding failed and cleanup is incomplete");
        },
        Err(err) => info!(error = %err, "onboarding not performed"),
        Ok(_) => {},
    }

    match result {
        Ok(result) => {
            if result.outcome == OnboardOutcome::Provisioned {
                write_certificate_artifact(&state, &result);
            }
            let status = match result.outcome {
                OnboardOutcome::Provisioned => StatusCode::CREATED,
                OnboardOutcome::Resumed | OnboardOutcome::Replayed => StatusCode::OK,
            };
            let response = OnboardResponse {
                device_group: result.device_group,
                serial_number: result.serial_number,
                identity_id: result.identity_id,
                registry_entry_name: result.registry_entry_name,
                outcome: result.outcome,
                certificate: result.certificate,
                private_key: result
                    .private_key
                    .as_ref()
                    .map(|key| key.expose_secret().clone()),
                broker_endpoint: state.broker_endpoint.clone(),
            };
            state.metrics.request_completed("onboard", status.as_u16());
            (status, Json(response)).into_response()
        },
        Err(err) => {
            let api_error = map_error(&err);
            state
                .metrics
                .request_completed("onboard", api_error.status.as_u16());
            api_error.into_response()
        },
    }
}

/// Writes the issued certificate (public material only) next to the ledger
/// for operator re-fetch. Best-effort; failure is logged, never fatal, and
/// the private key is never written anywhere.
fn write_certificate_artifact(state: &SharedState, result: &OnboardResult) {
    let (Some(dir), Some(certificate)) = (&state.certificate_dir, &result.certificate) else {
        return;
    };
    let path = dir.join(format!("{}.pem", result.registry_entry_name));
    if let Err(err) = std::fs::write(&path, certificate) {
        warn!(path = %path.display(), error = %err, "failed to write certificate artifact");
    }
}

// =============================================================================
// Status and listing
// =============================================================================

#[derive(Debug, Deserialize)]
struct GroupQuery {
    group: String,
}

/// Public view of a ledger record: status and resource names, never key
/// material, never failure internals.
#[derive(Debug, Serialize)]
struct RecordView {
    device_group: String,
    serial_number: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    registry_entry_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OnboardingRecord> for RecordView {
    fn from(record: OnboardingRecord) -> Self {
        Self {
            device_group: record.device_group,
            serial_number: record.serial_number,
            status: record.status.to_string(),
            identity_id: record.identity_id,
            policy_name: record.policy_name,
            registry_entry_name: record.registry_entry_name,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

async fn get_record(
    State(state): State<SharedState>,
    Path(serial): Path<String>,
    Query(query): Query<GroupQuery>,
) -> Response {
    let orchestrator = Arc::clone(&state.orchestrator);
    let result =
        tokio::task::spawn_blocking(move || orchestrator.status(&query.group, &serial)).await;

    let response = match result {
        Ok(Ok(Some(record))) => (StatusCode::OK, Json(RecordView::from(record))).into_response(),
        Ok(Ok(None)) => ApiError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "no onboarding record for this device",
        )
        .into_response(),
        Ok(Err(err)) => {
            warn!(error = %err, "status lookup failed");
            map_error(&err).into_response()
        },
        Err(_) => ApiError::internal().into_response(),
    };
    state
        .metrics
        .request_completed("status", response.status().as_u16());
    response
}

async fn list_records(
    State(state): State<SharedState>,
    Query(query): Query<GroupQuery>,
) -> Response {
    let orchestrator = Arc::clone(&state.orchestrator);
    let result = tokio::task::spawn_blocking(move || orchestrator.list(&query.group)).await;

    let response = match result {
        Ok(Ok(records)) => {
            let views: Vec<RecordView> = records.into_iter().map(RecordView::from).collect();
            (StatusCode::OK, Json(views)).into_response()
        },
        Ok(Err(err)) => {
            warn!(error = %err, "list failed");
            map_error(&err).into_response()
        },
        Err(_) => ApiError::internal().into_response(),
    };
    state
        .metrics
        .request_completed("list", response.status().as_u16());
    response
}

// =============================================================================
// Deprovision
// =============================================================================

async fn deprovision(
    State(state): State<SharedState>,
    Path(serial): Path<String>,
    Query(query): Query<GroupQuery>,
) -> Response {
    let request = DeprovisionRequest {
        device_group: query.group,
        serial_number: serial,
    };

    let orchestrator = Arc::clone(&state.orchestrator);
    state.metrics.saga_started();
    let result = tokio::task::spawn_blocking(move || orchestrator.deprovision(&request)).await;
    state.metrics.saga_finished();

    let response = match result {
        Ok(Ok(())) => {
            state.metrics.deprovision_finished("ok");
            StatusCode::NO_CONTENT.into_response()
        },
        Ok(Err(err)) => {
            let outcome = match &err {
                OnboardingError::CompensationFailure { .. } => "failed",
                _ => "rejected",
            };
            state.metrics.deprovision_finished(outcome);
            warn!(error = %err, "deprovisioning failed");
            map_error(&err).into_response()
        },
        Err(_) => {
            error!("deprovisioning task panicked");
            ApiError::internal().into_response()
        },
    };
    state
        .metrics
        .request_completed("deprovision", response.status().as_u16());
    response
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    records: u64,
    complete: u64,
    failed: u64,
}

async fn healthz(State(state): State<SharedState>) -> Response {
    match state.orchestrator.ledger_stats() {
        Ok(stats) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                uptime_secs: state.uptime_secs(),
                records: stats.record_count,
                complete: stats.complete_count,
                failed: stats.failed_count,
            }),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "ledger stats failed");
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "unhealthy",
                "ledger unavailable",
            )
            .into_response()
        },
    }
}
