//! Tests for the onboarding orchestrator.
//!
//! Backend faults are injected through scripted adapter wrappers around the
//! real local stores, and every adapter call is recorded so tests can
//! assert on what the saga actually did (how many credentials were issued,
//! whether compensation ran in reverse order, and so on).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use secrecy::ExposeSecret;

use super::*;
use crate::adapter::{
    AdapterError, CredentialStatus, DeviceRegistry, EntryRef, IdentityStore,
    InMemoryPolicyStore, InMemoryRegistry, IssuedCredential, LocalIdentityAuthority, PolicyRef,
    PolicyRules, PolicyStore, RetryConfig,
};
use crate::error::OnboardingError;
use crate::ledger::SqliteLedger;
use crate::record::{OnboardingRecord, OnboardingStatus};
use crate::request::{DeprovisionRequest, OnboardOutcome, OnboardRequest};

// =============================================================================
// Scripted adapter doubles
// =============================================================================

/// Per-operation queues of scripted errors, consumed in order.
#[derive(Default)]
struct FaultPlan {
    faults: Mutex<HashMap<String, VecDeque<AdapterError>>>,
}

impl FaultPlan {
    fn inject(&self, op: &str, err: AdapterError) {
        self.faults
            .lock()
            .unwrap()
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    fn inject_transient(&self, op: &str, count: usize) {
        for _ in 0..count {
            self.inject(
                op,
                AdapterError::Transient {
                    reason: "injected".to_string(),
                },
            );
        }
    }

    fn take(&self, op: &str) -> Option<AdapterError> {
        self.faults.lock().unwrap().get_mut(op)?.pop_front()
    }
}

/// Shared record of every adapter call, in order.
#[derive(Default)]
struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }

    fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == op)
            .count()
    }
}

macro_rules! scripted_op {
    ($self:ident, $op:literal, $call:expr) => {{
        $self.log.record($op);
        if let Some(err) = $self.plan.take($op) {
            return Err(err);
        }
        $call
    }};
}

struct ScriptedIdentity {
    inner: Arc<LocalIdentityAuthority>,
    plan: Arc<FaultPlan>,
    log: Arc<CallLog>,
}

impl IdentityStore for ScriptedIdentity {
    fn issue_credential(&self, device_name: &str) -> Result<IssuedCredential, AdapterError> {
        scripted_op!(
            self,
            "identity.issue_credential",
            self.inner.issue_credential(device_name)
        )
    }

    fn revoke_credential(&self, identity_id: &str) -> Result<(), AdapterError> {
        scripted_op!(
            self,
            "identity.revoke_credential",
            self.inner.revoke_credential(identity_id)
        )
    }

    fn update_credential_status(
        &self,
        identity_id: &str,
        status: CredentialStatus,
    ) -> Result<(), AdapterError> {
        scripted_op!(
            self,
            "identity.update_credential_status",
            self.inner.update_credential_status(identity_id, status)
        )
    }
}

struct ScriptedPolicy {
    inner: Arc<InMemoryPolicyStore>,
    plan: Arc<FaultPlan>,
    log: Arc<CallLog>,
}

impl PolicyStore for ScriptedPolicy {
    fn ensure_policy(&self, name: &str, rules: &PolicyRules) -> Result<PolicyRef, AdapterError> {
        scripted_op!(
            self,
            "policy.ensure_policy",
            self.inner.ensure_policy(name, rules)
        )
    }

    fn attach_policy(&self, policy: &PolicyRef, identity_id: &str) -> Result<(), AdapterError> {
        scripted_op!(
            self,
            "policy.attach_policy",
            self.inner.attach_policy(policy, identity_id)
        )
    }

    fn detach_policy(&self, policy: &PolicyRef, identity_id: &str) -> Result<(), AdapterError> {
        scripted_op!(
            self,
            "policy.detach_policy",
            self.inner.detach_policy(policy, identity_id)
        )
    }

    fn delete_policy_if_unreferenced(&self, policy: &PolicyRef) -> Result<(), AdapterError> {
        scripted_op!(
            self,
            "policy.delete_policy_if_unreferenced",
            self.inner.delete_policy_if_unreferenced(policy)
        )
    }
}

struct ScriptedRegistry {
    inner: Arc<InMemoryRegistry>,
    plan: Arc<FaultPlan>,
    log: Arc<CallLog>,
}

impl DeviceRegistry for ScriptedRegistry {
    fn create_entry(&self, name: &str, device_group: &str) -> Result<EntryRef, AdapterError> {
        scripted_op!(
            self,
            "registry.create_entry",
            self.inner.create_entry(name, device_group)
        )
    }

    fn attach_principal(&self, entry: &EntryRef, identity_id: &str) -> Result<(), AdapterError> {
        scripted_op!(
            self,
            "registry.attach_principal",
            self.inner.attach_principal(entry, identity_id)
        )
    }

    fn detach_principal(&self, entry: &EntryRef, identity_id: &str) -> Result<(), AdapterError> {
        scripted_op!(
            self,
            "registry.detach_principal",
            self.inner.detach_principal(entry, identity_id)
        )
    }

    fn delete_entry(&self, entry: &EntryRef) -> Result<(), AdapterError> {
        scripted_op!(
            self,
            "registry.delete_entry",
            self.inner.delete_entry(entry)
        )
    }

    fn describe(&self, name: &str) -> Result<Option<crate::adapter::RegistryEntry>, AdapterError> {
        self.inner.describe(name)
    }

    fn list_entries(
        &self,
        device_group: &str,
    ) -> Result<Vec<crate::adapter::RegistryEntry>, AdapterError> {
        self.inner.list_entries(device_group)
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    ledger: Arc<SqliteLedger>,
    authority: Arc<LocalIdentityAuthority>,
    policies: Arc<InMemoryPolicyStore>,
    registry: Arc<InMemoryRegistry>,
    plan: Arc<FaultPlan>,
    log: Arc<CallLog>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        let ledger = Arc::new(SqliteLedger::in_memory().expect("in-memory ledger"));
        let authority = Arc::new(LocalIdentityAuthority::from_seed([42u8; 32]));
        let policies = Arc::new(InMemoryPolicyStore::new());
        let registry = Arc::new(InMemoryRegistry::new());
        let plan = Arc::new(FaultPlan::default());
        let log = Arc::new(CallLog::default());

        let config = OrchestratorConfig {
            environment: None,
            root_topic: "data/#".to_string(),
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 2.0,
                max_delay: Duration::from_millis(4),
            },
        };

        let orchestrator = Orchestrator::new(
            Arc::clone(&ledger),
            Arc::new(ScriptedIdentity {
                inner: Arc::clone(&authority),
                plan: Arc::clone(&plan),
                log: Arc::clone(&log),
            }),
            Arc::new(ScriptedPolicy {
                inner: Arc::clone(&policies),
                plan: Arc::clone(&plan),
                log: Arc::clone(&log),
            }),
            Arc::new(ScriptedRegistry {
                inner: Arc::clone(&registry),
                plan: Arc::clone(&plan),
                log: Arc::clone(&log),
            }),
            config,
        );

        Self {
            ledger,
            authority,
            policies,
            registry,
            plan,
            log,
            orchestrator,
        }
    }

    fn request(serial: &str) -> OnboardRequest {
        OnboardRequest {
            device_group: "sensors".to_string(),
            serial_number: serial.to_string(),
            topic_namespace: format!("data/sensors/{serial}"),
            caller_identity: None,
        }
    }

    fn deprovision_request(serial: &str) -> DeprovisionRequest {
        DeprovisionRequest {
            device_group: "sensors".to_string(),
            serial_number: serial.to_string(),
        }
    }

    /// No credential, no policy, no registry entry left for the reference
    /// device.
    fn assert_no_orphans(&self) {
        assert_eq!(self.authority.credential_count(), 0, "credential leaked");
        assert!(
            !self.policies.policy_exists("pol-sensors-data"),
            "policy leaked"
        );
        assert!(
            self.registry.describe("thing-SN-001").unwrap().is_none(),
            "registry entry leaked"
        );
    }
}

// =============================================================================
// Forward chain
// =============================================================================

#[test]
fn example_scenario_end_to_end() {
    let h = Harness::new();
    let result = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();

    assert_eq!(result.outcome, OnboardOutcome::Provisioned);
    assert_eq!(result.registry_entry_name, "thing-SN-001");
    assert!(result.identity_id.starts_with("id-"));

    // Key material is disclosed on first completion.
    let certificate = result.certificate.as_deref().expect("certificate");
    let payload = h.authority.verify_certificate(certificate).unwrap();
    assert_eq!(payload.identity_id, result.identity_id);
    assert!(
        result
            .private_key
            .as_ref()
            .expect("private key")
            .expose_secret()
            .contains("PRIVATE KEY")
    );

    // Ledger record is terminal-success with all resource identifiers.
    let record = h.orchestrator.status("sensors", "SN-001").unwrap().unwrap();
    assert_eq!(record.status, OnboardingStatus::Complete);
    assert_eq!(record.identity_id.as_deref(), Some(result.identity_id.as_str()));
    assert_eq!(record.policy_name.as_deref(), Some("pol-sensors-data"));
    assert_eq!(record.registry_entry_name.as_deref(), Some("thing-SN-001"));

    // Backend state converged.
    let entry = h.registry.describe("thing-SN-001").unwrap().unwrap();
    assert_eq!(entry.principal.as_deref(), Some(result.identity_id.as_str()));
    assert_eq!(h.policies.attachment_count("pol-sensors-data"), 1);
    assert_eq!(
        h.authority.credential_status(&result.identity_id),
        Some(CredentialStatus::Active)
    );
}

#[test]
fn replay_is_idempotent_and_never_rediscloses_keys() {
    let h = Harness::new();
    let first = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();
    let second = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();

    assert_eq!(second.outcome, OnboardOutcome::Replayed);
    assert_eq!(second.identity_id, first.identity_id);
    assert_eq!(second.registry_entry_name, first.registry_entry_name);
    assert!(second.certificate.is_none());
    assert!(second.private_key.is_none());

    // Exactly one credential was ever issued.
    assert_eq!(h.log.count("identity.issue_credential"), 1);
    assert_eq!(h.authority.credential_count(), 1);
}

#[test]
fn validation_failure_touches_no_state() {
    let h = Harness::new();
    let mut request = Harness::request("SN-001");
    request.topic_namespace = "other/tree/SN-001".to_string();

    let err = h.orchestrator.onboard(&request).unwrap_err();
    assert!(matches!(err, OnboardingError::Validation(_)));
    assert!(h.orchestrator.status("sensors", "SN-001").unwrap().is_none());
    assert_eq!(h.log.count("identity.issue_credential"), 0);
}

// =============================================================================
// Failure injection and compensation
// =============================================================================

#[test]
fn permanent_failure_at_each_forward_step_leaves_no_orphans() {
    for op in [
        "identity.issue_credential",
        "policy.ensure_policy",
        "policy.attach_policy",
        "registry.create_entry",
        "registry.attach_principal",
    ] {
        let h = Harness::new();
        h.plan.inject(
            op,
            AdapterError::Permanent {
                reason: format!("injected at {op}"),
            },
        );

        let err = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap_err();
        assert!(
            matches!(err, OnboardingError::ProvisioningFailed { .. }),
            "{op}: {err}"
        );

        let record = h.orchestrator.status("sensors", "SN-001").unwrap().unwrap();
        assert_eq!(record.status, OnboardingStatus::Failed, "{op}");
        assert!(record.last_error.is_some(), "{op}");

        h.assert_no_orphans();
    }
}

#[test]
fn transient_failures_are_retried_within_the_step() {
    let h = Harness::new();
    h.plan.inject_transient("identity.issue_credential", 2);

    let result = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();
    assert_eq!(result.outcome, OnboardOutcome::Provisioned);
    // Two transient failures plus the success, all inside one saga step.
    assert_eq!(h.log.count("identity.issue_credential"), 3);
}

#[test]
fn exhausted_transient_budget_escalates_to_compensation() {
    let h = Harness::new();
    h.plan.inject_transient("registry.create_entry", 3);

    let err = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap_err();
    assert!(matches!(err, OnboardingError::ProvisioningFailed { .. }));
    assert_eq!(h.log.count("registry.create_entry"), 3);

    let record = h.orchestrator.status("sensors", "SN-001").unwrap().unwrap();
    assert_eq!(record.status, OnboardingStatus::Failed);
    h.assert_no_orphans();
}

#[test]
fn compensation_runs_in_reverse_order() {
    let h = Harness::new();
    h.plan.inject(
        "registry.attach_principal",
        AdapterError::Permanent {
            reason: "injected".to_string(),
        },
    );

    h.orchestrator
        .onboard(&Harness::request("SN-001"))
        .unwrap_err();

    let calls = h.log.calls.lock().unwrap().clone();
    let position = |op: &str| {
        calls
            .iter()
            .rposition(|c| c == op)
            .unwrap_or_else(|| panic!("{op} never called"))
    };
    // Registry undo strictly before policy undo, policy undo strictly
    // before credential revocation.
    assert!(position("registry.delete_entry") < position("policy.detach_policy"));
    assert!(position("policy.detach_policy") < position("policy.delete_policy_if_unreferenced"));
    assert!(position("policy.delete_policy_if_unreferenced") < position("identity.revoke_credential"));
}

#[test]
fn failed_compensation_is_surfaced_and_cleaned_up_by_operator_path() {
    let h = Harness::new();
    h.plan.inject(
        "registry.create_entry",
        AdapterError::Permanent {
            reason: "injected".to_string(),
        },
    );
    // The cleanup itself fails too: revocation is rejected.
    h.plan.inject(
        "identity.revoke_credential",
        AdapterError::Permanent {
            reason: "revocation rejected".to_string(),
        },
    );

    let err = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap_err();
    assert!(matches!(err, OnboardingError::CompensationFailure { .. }));

    let record = h.orchestrator.status("sensors", "SN-001").unwrap().unwrap();
    assert_eq!(record.status, OnboardingStatus::Failed);
    // The credential survived the failed revocation.
    assert_eq!(h.authority.credential_count(), 1);

    // Onboarding against the failed record is rejected.
    let err = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap_err();
    assert!(matches!(err, OnboardingError::Conflict { .. }));

    // Operator path: deprovision cleans up what the record still holds.
    h.orchestrator
        .deprovision(&Harness::deprovision_request("SN-001"))
        .unwrap();
    assert!(h.orchestrator.status("sensors", "SN-001").unwrap().is_none());
    h.assert_no_orphans();

    // The key is free for a fresh onboarding again.
    let result = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();
    assert_eq!(result.outcome, OnboardOutcome::Provisioned);
}

// =============================================================================
// Resume
// =============================================================================

#[test]
fn resume_from_identity_issued_reuses_the_credential() {
    let h = Harness::new();

    // Simulate a crash after the identity step persisted: the credential
    // exists and the record is at IDENTITY_ISSUED.
    let credential = h.authority.issue_credential("thing-SN-001").unwrap();
    let mut record = OnboardingRecord::new("sensors", "SN-001");
    record.identity_id = Some(credential.identity_id.clone());
    record.status = OnboardingStatus::IdentityIssued;
    record.version = h.ledger.put_if_absent_or_matching_version(&record).unwrap();

    let result = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();

    assert_eq!(result.outcome, OnboardOutcome::Resumed);
    assert_eq!(result.identity_id, credential.identity_id);
    // Reuse policy: nothing was reissued, and the lost key is not
    // redisclosed.
    assert_eq!(h.log.count("identity.issue_credential"), 0);
    assert!(result.private_key.is_none());

    let record = h.orchestrator.status("sensors", "SN-001").unwrap().unwrap();
    assert_eq!(record.status, OnboardingStatus::Complete);
    let entry = h.registry.describe("thing-SN-001").unwrap().unwrap();
    assert_eq!(entry.principal.as_deref(), Some(credential.identity_id.as_str()));
}

#[test]
fn resume_from_policy_attached_finishes_registration_only() {
    let h = Harness::new();

    let credential = h.authority.issue_credential("thing-SN-001").unwrap();
    let policy = h
        .policies
        .ensure_policy(
            "pol-sensors-data",
            &PolicyRules::for_namespace("data/sensors/SN-001"),
        )
        .unwrap();
    h.policies
        .attach_policy(&policy, &credential.identity_id)
        .unwrap();

    let mut record = OnboardingRecord::new("sensors", "SN-001");
    record.identity_id = Some(credential.identity_id.clone());
    record.policy_name = Some("pol-sensors-data".to_string());
    record.status = OnboardingStatus::PolicyAttached;
    record.version = h.ledger.put_if_absent_or_matching_version(&record).unwrap();

    let result = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();

    assert_eq!(result.outcome, OnboardOutcome::Resumed);
    assert_eq!(h.log.count("identity.issue_credential"), 0);
    assert_eq!(h.log.count("policy.ensure_policy"), 0);
    assert_eq!(h.log.count("registry.create_entry"), 1);

    let record = h.orchestrator.status("sensors", "SN-001").unwrap().unwrap();
    assert_eq!(record.status, OnboardingStatus::Complete);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn concurrent_same_key_requests_serialize_through_the_ledger() {
    let h = Arc::new(Harness::new());

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let h = Arc::clone(&h);
            thread::spawn(move || h.orchestrator.onboard(&Harness::request("SN-001")))
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|j| j.join().unwrap()).collect();

    let ok_count = results.iter().filter(|r| r.is_ok()).count();
    assert!(ok_count >= 1, "at least one request must win");

    let provisioned = results
        .iter()
        .filter(|r| matches!(r, Ok(result) if result.outcome == OnboardOutcome::Provisioned))
        .count();
    assert!(provisioned <= 1, "key material disclosed more than once");

    for result in &results {
        if let Err(err) = result {
            assert!(
                matches!(err, OnboardingError::InProgress { .. }),
                "losers must see in-progress, got: {err}"
            );
        }
    }

    // The record converged to terminal success and exactly one credential
    // exists; every loser revoked its own issuance.
    let record = h.orchestrator.status("sensors", "SN-001").unwrap().unwrap();
    assert_eq!(record.status, OnboardingStatus::Complete);
    assert_eq!(h.authority.credential_count(), 1);
}

// =============================================================================
// Deprovisioning
// =============================================================================

#[test]
fn deprovision_round_trip_allows_fresh_onboarding() {
    let h = Harness::new();
    let first = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();

    h.orchestrator
        .deprovision(&Harness::deprovision_request("SN-001"))
        .unwrap();

    assert!(h.orchestrator.status("sensors", "SN-001").unwrap().is_none());
    h.assert_no_orphans();

    let second = h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();
    assert_eq!(second.outcome, OnboardOutcome::Provisioned);
    assert_ne!(second.identity_id, first.identity_id);
}

#[test]
fn deprovision_is_idempotent() {
    let h = Harness::new();

    // Absent record is a no-op success.
    h.orchestrator
        .deprovision(&Harness::deprovision_request("SN-001"))
        .unwrap();

    h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();
    h.orchestrator
        .deprovision(&Harness::deprovision_request("SN-001"))
        .unwrap();
    h.orchestrator
        .deprovision(&Harness::deprovision_request("SN-001"))
        .unwrap();
}

#[test]
fn deprovision_rejected_while_onboarding_in_flight() {
    let h = Harness::new();

    let credential = h.authority.issue_credential("thing-SN-001").unwrap();
    let mut record = OnboardingRecord::new("sensors", "SN-001");
    record.identity_id = Some(credential.identity_id);
    record.status = OnboardingStatus::IdentityIssued;
    h.ledger.put_if_absent_or_matching_version(&record).unwrap();

    let err = h
        .orchestrator
        .deprovision(&Harness::deprovision_request("SN-001"))
        .unwrap_err();
    assert!(matches!(err, OnboardingError::Conflict { .. }));
}

#[test]
fn shared_policy_survives_deprovisioning_of_one_device() {
    let h = Harness::new();
    // Two devices of the same group under the same topic tree share one
    // policy.
    h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();
    let kept = h.orchestrator.onboard(&Harness::request("SN-002")).unwrap();
    assert_eq!(h.policies.attachment_count("pol-sensors-data"), 2);

    h.orchestrator
        .deprovision(&Harness::deprovision_request("SN-001"))
        .unwrap();

    // The delete probe returned a conflict, treated as success: the shared
    // policy stays, only SN-001's attachment is gone.
    assert!(h.policies.policy_exists("pol-sensors-data"));
    assert_eq!(h.policies.attachment_count("pol-sensors-data"), 1);

    // SN-002 is untouched.
    let record = h.orchestrator.status("sensors", "SN-002").unwrap().unwrap();
    assert_eq!(record.status, OnboardingStatus::Complete);
    assert_eq!(
        h.authority.credential_status(&kept.identity_id),
        Some(CredentialStatus::Active)
    );
    assert!(h.registry.describe("thing-SN-001").unwrap().is_none());
    assert!(h.registry.describe("thing-SN-002").unwrap().is_some());
}

#[test]
fn failed_deprovision_step_leaves_record_for_retry() {
    let h = Harness::new();
    h.orchestrator.onboard(&Harness::request("SN-001")).unwrap();

    h.plan.inject(
        "registry.delete_entry",
        AdapterError::Permanent {
            reason: "injected".to_string(),
        },
    );
    let err = h
        .orchestrator
        .deprovision(&Harness::deprovision_request("SN-001"))
        .unwrap_err();
    assert!(matches!(err, OnboardingError::CompensationFailure { .. }));

    // The record survived with its resource identifiers, so a retry can
    // finish the job.
    let record = h.orchestrator.status("sensors", "SN-001").unwrap().unwrap();
    assert_eq!(record.status, OnboardingStatus::Complete);
    assert!(record.registry_entry_name.is_some());

    h.orchestrator
        .deprovision(&Harness::deprovision_request("SN-001"))
        .unwrap();
    assert!(h.orchestrator.status("sensors", "SN-001").unwrap().is_none());
    h.assert_no_orphans();
}
