//! enroll-core - Device Onboarding Service core library
//!
//! This crate implements the onboarding saga for per-device cryptographic
//! identities: a request-driven orchestrator that provisions (and
//! decommissions) an identity, an authorization policy attachment, and a
//! registry entry across three backend stores, with every state transition
//! durably recorded in an onboarding ledger before and after each backend
//! call.
//!
//! There is no cross-resource transaction available across the backends, so
//! the orchestrator is written as a saga: a partially-ordered sequence of
//! remote mutations, each with a compensating undo action, driven forward
//! from whatever state the ledger last recorded. Any process can resume an
//! interrupted onboarding from the persisted record; concurrent orchestrations
//! for the same device are serialized purely through the ledger's
//! conditional-write discipline.
//!
//! # Modules
//!
//! - [`naming`]: deterministic derivation of registry and policy names
//! - [`record`]: the durable onboarding record and its state machine
//! - [`ledger`]: `SQLite`-backed onboarding ledger with optimistic versioning
//! - [`adapter`]: identity/policy/registry store traits, retry policy, and
//!   the local in-process implementations
//! - [`saga`]: the onboarding orchestrator (forward chain, resume,
//!   compensation, deprovisioning)
//! - [`request`]: request/response types and validation
//! - [`error`]: the service-level error taxonomy

pub mod adapter;
pub mod error;
pub mod ledger;
pub mod naming;
pub mod record;
pub mod request;
pub mod saga;

pub use adapter::{AdapterError, CredentialStatus, DeviceRegistry, IdentityStore, PolicyStore};
pub use error::OnboardingError;
pub use ledger::{LedgerError, SqliteLedger};
pub use naming::NamingScheme;
pub use record::{OnboardingRecord, OnboardingStatus};
pub use request::{DeprovisionRequest, OnboardOutcome, OnboardRequest, OnboardResult};
pub use saga::{Orchestrator, OrchestratorConfig};
