//! Service-level error taxonomy.
//!
//! Maps the orchestrator's failure modes to what callers are allowed to
//! see: validation rejections return immediately, ledger races surface as
//! "already in progress", and both provisioning and cleanup failures are
//! generic at the API edge — the details go to the logs, not the caller.

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::record::RecordError;
use crate::request::ValidationError;

/// Errors returned by the onboarding orchestrator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OnboardingError {
    /// Malformed request; rejected before any state was touched.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Another orchestration holds this key; the caller may retry.
    #[error("onboarding already in progress for {device_group}/{serial_number}")]
    InProgress {
        /// Device group of the contested key.
        device_group: String,
        /// Serial number of the contested key.
        serial_number: String,
    },

    /// The request contradicts existing onboarding state.
    #[error("conflicting onboarding state for {device_group}/{serial_number}: {reason}")]
    Conflict {
        /// Device group of the record.
        device_group: String,
        /// Serial number of the record.
        serial_number: String,
        /// What the request collided with.
        reason: String,
    },

    /// A forward step failed permanently; compensation ran and the record
    /// is `FAILED`.
    #[error("provisioning failed: {reason}")]
    ProvisioningFailed {
        /// Cause of the failure.
        reason: String,
    },

    /// Cleanup itself failed; the record is left for operator intervention
    /// and never retried silently.
    #[error("cleanup failed, operator intervention required: {reason}")]
    CompensationFailure {
        /// The undo steps that failed.
        reason: String,
    },

    /// Internal state-machine violation (malformed stored record).
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Ledger storage fault.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
