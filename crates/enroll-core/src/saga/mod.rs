//! The onboarding orchestrator.
//!
//! Provisioning a device touches three backends with no cross-resource
//! transaction, so the orchestrator runs the sequence as a saga: each
//! forward step persists its outcome to the ledger before the next step
//! runs, each step has a compensating undo, and a permanent failure
//! unwinds the completed steps in strict reverse order.
//!
//! # Phase contracts
//!
//! - A step's resource identifier is durably recorded before the saga
//!   advances past it; the persisted write is the crash-recovery point.
//! - Resumption drives a non-terminal record forward from its recorded
//!   state; an issued-but-unattached credential is reused, never reissued.
//! - Every ledger mutation is a conditional write; losing the write means
//!   another orchestration owns the record, and the loser aborts without
//!   touching further backend state.
//! - Compensation never loops: a failed undo step is logged, the record is
//!   marked `FAILED`, and an operator takes over.

mod orchestrator;

#[cfg(test)]
mod tests;

pub use orchestrator::{Orchestrator, OrchestratorConfig};
