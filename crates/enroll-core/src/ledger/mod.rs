//! Durable onboarding ledger.
//!
//! The ledger is the saga's single source of truth: a keyed record store
//! over `SQLite` with WAL mode, where every mutation is a single atomic
//! conditional write. The orchestrator writes a record's state transition
//! before acknowledging any step, so any process can resume an interrupted
//! onboarding from the persisted record, and two concurrent orchestrations
//! for the same `(device_group, serial_number)` key cannot interleave: the
//! later writer observes [`LedgerError::VersionConflict`] and aborts.
//!
//! # Example
//!
//! ```rust,no_run
//! use enroll_core::ledger::SqliteLedger;
//! use enroll_core::record::OnboardingRecord;
//!
//! # fn example() -> Result<(), enroll_core::ledger::LedgerError> {
//! let ledger = SqliteLedger::open("/var/lib/enroll/onboarding.db")?;
//!
//! let mut record = OnboardingRecord::new("sensors", "SN-001");
//! record.version = ledger.put_if_absent_or_matching_version(&record)?;
//!
//! let stored = ledger.get("sensors", "SN-001")?;
//! assert!(stored.is_some());
//! # Ok(())
//! # }
//! ```

mod storage;


pub use storage::{LedgerError, LedgerStats, SqliteLedger};
