//! Saga coordinator for device onboarding and deprovisioning.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::adapter::{
    AdapterError, CredentialStatus, DeviceRegistry, EntryRef, IdentityStore, IssuedCredential,
    PolicyRef, PolicyRules, PolicyStore, RetryConfig, with_retries,
};
use crate::error::OnboardingError;
use crate::ledger::{LedgerError, LedgerStats, SqliteLedger};
use crate::naming::NamingScheme;
use crate::record::{OnboardingRecord, OnboardingStatus};
use crate::request::{DeprovisionRequest, OnboardOutcome, OnboardRequest, OnboardResult};

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deployment environment appended to derived resource names.
    #[serde(default)]
    pub environment: Option<String>,

    /// Root topic filter devices publish under (first segment is enforced
    /// on every requested namespace).
    #[serde(default = "default_root_topic")]
    pub root_topic: String,

    /// Retry policy for adapter calls.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_root_topic() -> String {
    "data/#".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            environment: None,
            root_topic: default_root_topic(),
            retry: RetryConfig::default(),
        }
    }
}

/// Backend resources known to exist for the in-flight saga; the unwind set
/// for compensation.
///
/// Rebuilt from the ledger record on resume, extended call-by-call while
/// the saga advances. The distinction between "resource exists" and
/// "attachment exists" matters: an `ensure_policy` that succeeded before a
/// failed attach leaves a policy with no attachment, and the undo must not
/// try to detach it.
#[derive(Default)]
struct SagaScope {
    identity_id: Option<String>,
    policy: Option<PolicyRef>,
    policy_attached: bool,
    entry: Option<EntryRef>,
    principal_attached: bool,
}

impl SagaScope {
    fn from_record(record: &OnboardingRecord) -> Self {
        // Persisted names imply the attachment succeeded: policy_name and
        // registry_entry_name are written only after their attach calls.
        Self {
            identity_id: record.identity_id.clone(),
            policy: record.policy_name.clone().map(PolicyRef::new),
            policy_attached: record.policy_name.is_some(),
            entry: record.registry_entry_name.clone().map(EntryRef::new),
            principal_attached: record.registry_entry_name.is_some(),
        }
    }
}

/// The saga coordinator.
///
/// One instance serves the whole daemon; each call is an independent unit
/// of work with no shared mutable state between invocations. Concurrency
/// control for a given onboarding key lives entirely in the ledger's
/// conditional writes.
pub struct Orchestrator {
    ledger: Arc<SqliteLedger>,
    identity: Arc<dyn IdentityStore>,
    policy: Arc<dyn PolicyStore>,
    registry: Arc<dyn DeviceRegistry>,
    naming: NamingScheme,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator over the given ledger and backend adapters.
    #[must_use]
    pub fn new(
        ledger: Arc<SqliteLedger>,
        identity: Arc<dyn IdentityStore>,
        policy: Arc<dyn PolicyStore>,
        registry: Arc<dyn DeviceRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let naming = NamingScheme::new(config.environment.clone());
        Self {
            ledger,
            identity,
            policy,
            registry,
            naming,
            config,
        }
    }

    /// Provisions a device, or resumes/replays a previous attempt for the
    /// same `(device_group, serial_number)` key.
    ///
    /// # Errors
    ///
    /// See [`OnboardingError`]; notably [`OnboardingError::InProgress`]
    /// when another orchestration holds the record, and
    /// [`OnboardingError::Conflict`] when the record is `FAILED` and needs
    /// operator intervention.
    pub fn onboard(&self, request: &OnboardRequest) -> Result<OnboardResult, OnboardingError> {
        request.validate(&self.config.root_topic)?;

        let span = tracing::info_span!(
            "onboard",
            device_group = %request.device_group,
            serial_number = %request.serial_number,
            caller = request.caller_identity.as_deref().unwrap_or("-"),
        );
        let _guard = span.enter();

        match self
            .ledger
            .get(&request.device_group, &request.serial_number)?
        {
            Some(record) => match record.status {
                OnboardingStatus::Complete => {
                    debug!("record already complete; replaying without reissue");
                    Ok(OnboardResult::replay(&record))
                },
                OnboardingStatus::Failed => Err(OnboardingError::Conflict {
                    device_group: request.device_group.clone(),
                    serial_number: request.serial_number.clone(),
                    reason: "previous onboarding failed; deprovision before retrying".to_string(),
                }),
                OnboardingStatus::Deprovisioned => {
                    // Crash window between the terminal mark and the row
                    // delete; finish the delete and start over.
                    self.ledger
                        .delete(&request.device_group, &request.serial_number)?;
                    self.start_fresh(request)
                },
                _ => {
                    info!(status = %record.status, "resuming interrupted onboarding");
                    self.drive(record, request)
                },
            },
            None => self.start_fresh(request),
        }
    }

    /// Decommissions a device by running the chain in reverse, gated on a
    /// terminal record. Absent and already-deprovisioned records are no-op
    /// successes.
    ///
    /// # Errors
    ///
    /// [`OnboardingError::Conflict`] while the onboarding is still in
    /// flight, [`OnboardingError::CompensationFailure`] when an undo step
    /// fails (record left in place for a later retry).
    pub fn deprovision(&self, request: &DeprovisionRequest) -> Result<(), OnboardingError> {
        request.validate()?;

        let span = tracing::info_span!(
            "deprovision",
            device_group = %request.device_group,
            serial_number = %request.serial_number,
        );
        let _guard = span.enter();

        let Some(record) = self
            .ledger
            .get(&request.device_group, &request.serial_number)?
        else {
            debug!("no record; deprovision is a no-op");
            return Ok(());
        };

        match record.status {
            OnboardingStatus::Deprovisioned => {
                self.ledger
                    .delete(&record.device_group, &record.serial_number)?;
                Ok(())
            },
            // FAILED is the operator path: best-effort cleanup of whatever
            // resource ids the record still holds.
            OnboardingStatus::Complete | OnboardingStatus::Failed => self.teardown(record),
            _ => Err(OnboardingError::Conflict {
                device_group: request.device_group.clone(),
                serial_number: request.serial_number.clone(),
                reason: format!("onboarding still in progress (status {})", record.status),
            }),
        }
    }

    /// Fetches the ledger record for a key, if any.
    ///
    /// # Errors
    ///
    /// Ledger faults only.
    pub fn status(
        &self,
        device_group: &str,
        serial_number: &str,
    ) -> Result<Option<OnboardingRecord>, OnboardingError> {
        Ok(self.ledger.get(device_group, serial_number)?)
    }

    /// Lists all ledger records of a device group.
    ///
    /// # Errors
    ///
    /// Ledger faults only.
    pub fn list(&self, device_group: &str) -> Result<Vec<OnboardingRecord>, OnboardingError> {
        Ok(self.ledger.list_group(device_group)?)
    }

    /// Ledger statistics for the health surface.
    ///
    /// # Errors
    ///
    /// Ledger faults only.
    pub fn ledger_stats(&self) -> Result<LedgerStats, OnboardingError> {
        Ok(self.ledger.stats()?)
    }

    fn start_fresh(&self, request: &OnboardRequest) -> Result<OnboardResult, OnboardingError> {
        let mut record = OnboardingRecord::new(&request.device_group, &request.serial_number);
        self.persist(&mut record)?;
        self.drive(record, request)
    }

    /// Runs the forward chain from the record's current state to
    /// `COMPLETE`.
    fn drive(
        &self,
        mut record: OnboardingRecord,
        request: &OnboardRequest,
    ) -> Result<OnboardResult, OnboardingError> {
        let mut scope = SagaScope::from_record(&record);
        let mut issued: Option<IssuedCredential> = None;

        // Step 1: issue the credential.
        if record.status == OnboardingStatus::Pending {
            let device_name = self.naming.registry_entry_name(&request.serial_number);
            let credential = match with_retries(&self.config.retry, "identity.issue_credential", || {
                self.identity.issue_credential(&device_name)
            }) {
                Ok(credential) => credential,
                Err(err) => return Err(self.compensate(record, &scope, &err)),
            };
            scope.identity_id = Some(credential.identity_id.clone());
            record.identity_id = Some(credential.identity_id.clone());
            record.transition_to(OnboardingStatus::IdentityIssued)?;
            if let Err(err) = self.persist(&mut record) {
                // Another orchestration owns the record (or the ledger
                // failed); the credential issued here was never recorded
                // anywhere and must not leak.
                self.revoke_quietly(&credential.identity_id);
                return Err(err);
            }
            info!(identity_id = %credential.identity_id, "credential issued");
            issued = Some(credential);
        }

        let Some(identity_id) = record.identity_id.clone() else {
            let err = AdapterError::Permanent {
                reason: format!("record in {} without an identity id", record.status),
            };
            return Err(self.compensate(record, &scope, &err));
        };

        // Step 2: ensure the policy and attach it to the credential.
        if record.status == OnboardingStatus::IdentityIssued {
            let policy_name = self
                .naming
                .policy_name(&request.device_group, &request.topic_namespace);
            let rules = PolicyRules::for_namespace(&request.topic_namespace);
            let policy = match with_retries(&self.config.retry, "policy.ensure_policy", || {
                self.policy.ensure_policy(&policy_name, &rules)
            }) {
                Ok(policy) => policy,
                Err(err) => return Err(self.compensate(record, &scope, &err)),
            };
            scope.policy = Some(policy.clone());
            if let Err(err) = with_retries(&self.config.retry, "policy.attach_policy", || {
                self.policy.attach_policy(&policy, &identity_id)
            }) {
                return Err(self.compensate(record, &scope, &err));
            }
            scope.policy_attached = true;
            record.policy_name = Some(policy_name.clone());
            record.transition_to(OnboardingStatus::PolicyAttached)?;
            self.persist(&mut record)?;
            info!(policy_name = %policy_name, "policy attached");
        }

        // Step 3: create the registry entry and attach the credential as
        // its principal.
        if record.status == OnboardingStatus::PolicyAttached {
            let entry_name = self.naming.registry_entry_name(&request.serial_number);
            let entry = match with_retries(&self.config.retry, "registry.create_entry", || {
                self.registry.create_entry(&entry_name, &request.device_group)
            }) {
                Ok(entry) => entry,
                Err(err) => return Err(self.compensate(record, &scope, &err)),
            };
            scope.entry = Some(entry.clone());
            if let Err(err) = with_retries(&self.config.retry, "registry.attach_principal", || {
                self.registry.attach_principal(&entry, &identity_id)
            }) {
                return Err(self.compensate(record, &scope, &err));
            }
            scope.principal_attached = true;
            record.registry_entry_name = Some(entry_name.clone());
            record.transition_to(OnboardingStatus::Registered)?;
            self.persist(&mut record)?;
            info!(registry_entry_name = %entry_name, "device registered");
        }

        // Step 4: terminal success.
        if record.status == OnboardingStatus::Registered {
            record.transition_to(OnboardingStatus::Complete)?;
            self.persist(&mut record)?;
            info!("onboarding complete");
        }

        let outcome = if issued.is_some() {
            OnboardOutcome::Provisioned
        } else {
            OnboardOutcome::Resumed
        };
        Ok(OnboardResult {
            device_group: record.device_group,
            serial_number: record.serial_number,
            identity_id,
            registry_entry_name: record.registry_entry_name.unwrap_or_default(),
            certificate: issued.as_ref().map(|c| c.certificate.clone()),
            private_key: issued.map(|c| c.private_key),
            outcome,
        })
    }

    /// Undoes completed forward steps in strict reverse order, then marks
    /// the record `FAILED`. Never retried as a whole; a failed undo step is
    /// collected and surfaced for operator intervention.
    fn compensate(
        &self,
        mut record: OnboardingRecord,
        scope: &SagaScope,
        cause: &AdapterError,
    ) -> OnboardingError {
        warn!(error = %cause, "permanent failure; compensating in reverse order");
        let mut failures: Vec<String> = Vec::new();

        if let Some(entry) = &scope.entry {
            if scope.principal_attached {
                if let Some(identity_id) = &scope.identity_id {
                    if let Err(err) =
                        with_retries(&self.config.retry, "registry.detach_principal", || {
                            self.registry.detach_principal(entry, identity_id)
                        })
                    {
                        if !matches!(err, AdapterError::NotFound { .. }) {
                            failures.push(format!("detach principal: {err}"));
                        }
                    }
                }
            }
            match with_retries(&self.config.retry, "registry.delete_entry", || {
                self.registry.delete_entry(entry)
            }) {
                Ok(()) | Err(AdapterError::NotFound { .. }) => {},
                Err(err) => failures.push(format!("delete registry entry: {err}")),
            }
        }

        if let Some(policy) = &scope.policy {
            if scope.policy_attached {
                if let Some(identity_id) = &scope.identity_id {
                    if let Err(err) = with_retries(&self.config.retry, "policy.detach_policy", || {
                        self.policy.detach_policy(policy, identity_id)
                    }) {
                        if !matches!(err, AdapterError::NotFound { .. }) {
                            failures.push(format!("detach policy: {err}"));
                        }
                    }
                }
            }
            match with_retries(
                &self.config.retry,
                "policy.delete_policy_if_unreferenced",
                || self.policy.delete_policy_if_unreferenced(policy),
            ) {
                Ok(()) | Err(AdapterError::NotFound { .. }) => {},
                Err(AdapterError::Conflict { .. }) => {
                    debug!(policy_name = policy.name(), "policy shared; leaving in place");
                },
                Err(err) => failures.push(format!("delete policy: {err}")),
            }
        }

        if let Some(identity_id) = &scope.identity_id {
            match with_retries(&self.config.retry, "identity.revoke_credential", || {
                self.identity.revoke_credential(identity_id)
            }) {
                Ok(()) | Err(AdapterError::NotFound { .. }) => {},
                Err(err) => failures.push(format!("revoke credential: {err}")),
            }
        }

        record.last_error = Some(cause.to_string());
        if let Err(err) = record.transition_to(OnboardingStatus::Failed) {
            failures.push(format!("mark failed: {err}"));
        } else if let Err(err) = self.persist(&mut record) {
            failures.push(format!("persist failed state: {err}"));
        }

        if failures.is_empty() {
            OnboardingError::ProvisioningFailed {
                reason: cause.to_string(),
            }
        } else {
            for failure in &failures {
                error!(failure = %failure, "compensation step failed; operator intervention required");
            }
            OnboardingError::CompensationFailure {
                reason: failures.join("; "),
            }
        }
    }

    /// Reverse chain for deprovisioning. Each undo clears its record field
    /// through a conditional write, so a crashed teardown resumes with only
    /// the remaining steps.
    fn teardown(&self, mut record: OnboardingRecord) -> Result<(), OnboardingError> {
        if let Some(entry_name) = record.registry_entry_name.clone() {
            let entry = EntryRef::new(entry_name);
            if let Some(identity_id) = record.identity_id.clone() {
                match with_retries(&self.config.retry, "registry.detach_principal", || {
                    self.registry.detach_principal(&entry, &identity_id)
                }) {
                    Ok(()) | Err(AdapterError::NotFound { .. }) => {},
                    Err(err) => return Err(self.teardown_failed("detach principal", &err)),
                }
            }
            match with_retries(&self.config.retry, "registry.delete_entry", || {
                self.registry.delete_entry(&entry)
            }) {
                Ok(()) | Err(AdapterError::NotFound { .. }) => {},
                Err(err) => return Err(self.teardown_failed("delete registry entry", &err)),
            }
            record.registry_entry_name = None;
            self.persist(&mut record)?;
        }

        if let Some(policy_name) = record.policy_name.clone() {
            let policy = PolicyRef::new(policy_name);
            if let Some(identity_id) = record.identity_id.clone() {
                match with_retries(&self.config.retry, "policy.detach_policy", || {
                    self.policy.detach_policy(&policy, &identity_id)
                }) {
                    Ok(()) | Err(AdapterError::NotFound { .. }) => {},
                    Err(err) => return Err(self.teardown_failed("detach policy", &err)),
                }
            }
            match with_retries(
                &self.config.retry,
                "policy.delete_policy_if_unreferenced",
                || self.policy.delete_policy_if_unreferenced(&policy),
            ) {
                Ok(()) | Err(AdapterError::NotFound { .. }) => {},
                Err(AdapterError::Conflict { .. }) => {
                    debug!(policy_name = policy.name(), "policy shared; leaving in place");
                },
                Err(err) => return Err(self.teardown_failed("delete policy", &err)),
            }
            record.policy_name = None;
            self.persist(&mut record)?;
        }

        if let Some(identity_id) = record.identity_id.clone() {
            match with_retries(&self.config.retry, "identity.update_credential_status", || {
                self.identity
                    .update_credential_status(&identity_id, CredentialStatus::Revoked)
            }) {
                Ok(()) | Err(AdapterError::NotFound { .. }) => {},
                Err(err) => return Err(self.teardown_failed("revoke credential", &err)),
            }
            match with_retries(&self.config.retry, "identity.revoke_credential", || {
                self.identity.revoke_credential(&identity_id)
            }) {
                Ok(()) | Err(AdapterError::NotFound { .. }) => {},
                Err(err) => return Err(self.teardown_failed("delete credential", &err)),
            }
            record.identity_id = None;
            self.persist(&mut record)?;
        }

        record.transition_to(OnboardingStatus::Deprovisioned)?;
        self.persist(&mut record)?;
        self.ledger
            .delete(&record.device_group, &record.serial_number)?;
        info!("device deprovisioned");
        Ok(())
    }

    fn teardown_failed(&self, step: &str, err: &AdapterError) -> OnboardingError {
        error!(step, error = %err, "deprovisioning step failed; record left for retry");
        OnboardingError::CompensationFailure {
            reason: format!("{step}: {err}"),
        }
    }

    /// The single write path: a conditional ledger write, with a lost race
    /// surfaced as "in progress".
    fn persist(&self, record: &mut OnboardingRecord) -> Result<(), OnboardingError> {
        match self.ledger.put_if_absent_or_matching_version(record) {
            Ok(version) => {
                record.version = version;
                Ok(())
            },
            Err(LedgerError::VersionConflict { .. }) => Err(OnboardingError::InProgress {
                device_group: record.device_group.clone(),
                serial_number: record.serial_number.clone(),
            }),
            Err(err) => Err(OnboardingError::Ledger(err)),
        }
    }

    fn revoke_quietly(&self, identity_id: &str) {
        match self.identity.revoke_credential(identity_id) {
            Ok(()) | Err(AdapterError::NotFound { .. }) => {},
            Err(err) => {
                warn!(identity_id, error = %err, "failed to revoke credential after lost ledger race");
            },
        }
    }
}
