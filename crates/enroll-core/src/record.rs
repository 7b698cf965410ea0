//! Onboarding record data model and lifecycle states.
//!
//! An [`OnboardingRecord`] is the durable ledger entry for one device,
//! keyed by `(device_group, serial_number)`. The record carries the saga's
//! current state plus the identifiers of every backend resource created so
//! far, which is all the orchestrator needs to resume or compensate after a
//! crash.
//!
//! # State graph
//!
//! ```text
//! PENDING -> IDENTITY_ISSUED -> POLICY_ATTACHED -> REGISTERED -> COMPLETE
//!    |              |                  |               |            |
//!    +--------------+------------------+---------------+        DEPROVISIONED
//!                          v
//!                        FAILED -> DEPROVISIONED (operator cleanup)
//! ```
//!
//! Transitions only move along this graph; anything else is a
//! [`RecordError::TransitionNotAllowed`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during record lifecycle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// State transition not allowed by the state machine.
    #[error("transition from {from} to {to} is not allowed")]
    TransitionNotAllowed {
        /// The current state.
        from: OnboardingStatus,
        /// The attempted target state.
        to: OnboardingStatus,
    },

    /// A status string read back from storage did not parse.
    #[error("unknown onboarding status: {value}")]
    UnknownStatus {
        /// The unparseable value.
        value: String,
    },
}

/// Lifecycle state of an onboarding record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnboardingStatus {
    /// Record created; no backend resource exists yet.
    Pending,
    /// A credential has been issued and its identifier persisted.
    IdentityIssued,
    /// The authorization policy exists and is attached to the credential.
    PolicyAttached,
    /// The registry entry exists with the credential as its principal.
    Registered,
    /// Terminal success; the device is fully provisioned.
    Complete,
    /// Terminal failure; compensation ran (or was attempted) and an operator
    /// must intervene before this key can be onboarded again.
    Failed,
    /// Terminal; the device was decommissioned via the reverse chain.
    Deprovisioned,
}

impl OnboardingStatus {
    /// Stable string form, as stored in the ledger.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::IdentityIssued => "IDENTITY_ISSUED",
            Self::PolicyAttached => "POLICY_ATTACHED",
            Self::Registered => "REGISTERED",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Deprovisioned => "DEPROVISIONED",
        }
    }

    /// Parses the stable string form.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::UnknownStatus`] for anything else.
    pub fn parse(value: &str) -> Result<Self, RecordError> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "IDENTITY_ISSUED" => Ok(Self::IdentityIssued),
            "POLICY_ATTACHED" => Ok(Self::PolicyAttached),
            "REGISTERED" => Ok(Self::Registered),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            "DEPROVISIONED" => Ok(Self::Deprovisioned),
            other => Err(RecordError::UnknownStatus {
                value: other.to_string(),
            }),
        }
    }

    /// True for states from which no forward onboarding step may run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Deprovisioned)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::IdentityIssued)
                | (Self::IdentityIssued, Self::PolicyAttached)
                | (Self::PolicyAttached, Self::Registered)
                | (Self::Registered, Self::Complete)
                | (
                    Self::Pending | Self::IdentityIssued | Self::PolicyAttached | Self::Registered,
                    Self::Failed
                )
                | (Self::Complete | Self::Failed, Self::Deprovisioned)
        )
    }
}

impl fmt::Display for OnboardingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable ledger entry for one device onboarding.
///
/// `version` implements the optimistic-concurrency discipline: every write
/// to the ledger is conditional on the version the writer last read, and a
/// successful write bumps it. Version 0 means "never persisted".
///
/// The record never holds private key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingRecord {
    /// Partition key: the device group.
    pub device_group: String,
    /// Sort key: the device serial number.
    pub serial_number: String,
    /// Current saga state.
    pub status: OnboardingStatus,
    /// Optimistic-concurrency version; bumped by every successful write.
    pub version: u64,
    /// Identifier of the issued credential, if one exists.
    pub identity_id: Option<String>,
    /// Name of the attached authorization policy, if attached.
    pub policy_name: Option<String>,
    /// Name of the registry entry, if created.
    pub registry_entry_name: Option<String>,
    /// Cause of the last failure, if the saga failed.
    pub last_error: Option<String>,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl OnboardingRecord {
    /// Creates a fresh, never-persisted record in `PENDING`.
    #[must_use]
    pub fn new(device_group: impl Into<String>, serial_number: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            device_group: device_group.into(),
            serial_number: serial_number.into(),
            status: OnboardingStatus::Pending,
            version: 0,
            identity_id: None,
            policy_name: None,
            registry_entry_name: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the record to `to`, enforcing the state graph.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::TransitionNotAllowed`] if the graph forbids it.
    pub fn transition_to(&mut self, to: OnboardingStatus) -> Result<(), RecordError> {
        if !self.status.can_transition(to) {
            return Err(RecordError::TransitionNotAllowed {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}
