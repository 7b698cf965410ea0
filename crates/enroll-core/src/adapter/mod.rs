//! Backend store adapters.
//!
//! The orchestrator talks to three external stores through the traits in
//! this module: an identity store that issues and revokes credentials, a
//! policy store that manages authorization policies and their attachments,
//! and a device registry that holds logical device entries. Every operation
//! is a blocking remote call from the orchestrator's perspective; transient
//! failures are retried at this boundary (see [`retry`]), never by
//! restarting the saga.
//!
//! The local implementations ([`LocalIdentityAuthority`],
//! [`InMemoryPolicyStore`], [`InMemoryRegistry`]) are real, not test-only:
//! they back single-node deployments and make the crate self-contained.
//! Cloud-backed adapters are deployment concerns behind the same traits.

pub mod identity;
pub mod policy;
pub mod registry;
pub mod retry;

use secrecy::SecretString;
use thiserror::Error;

pub use identity::{CertificatePayload, LocalIdentityAuthority};
pub use policy::{InMemoryPolicyStore, PolicyRules};
pub use registry::InMemoryRegistry;
pub use retry::{RetryConfig, with_retries};

/// Errors returned by adapter operations.
///
/// The variants carry the orchestrator's failure policy: `Transient` is
/// retried with bounded backoff, `Conflict` is resolved per-operation
/// (shared policy, idempotent create), and everything else escalates to
/// compensation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AdapterError {
    /// Throttling, network fault, or timeout; safe to retry.
    #[error("transient backend failure: {reason}")]
    Transient {
        /// Diagnostic reason.
        reason: String,
    },

    /// Irrecoverable remote rejection (malformed input, invariant breach).
    #[error("permanent backend rejection: {reason}")]
    Permanent {
        /// Diagnostic reason.
        reason: String,
    },

    /// Idempotency or ownership collision; resolved by the caller's policy,
    /// not necessarily fatal.
    #[error("backend conflict: {reason}")]
    Conflict {
        /// Diagnostic reason.
        reason: String,
    },

    /// The referenced resource does not exist.
    #[error("not found: {resource}")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },
}

impl AdapterError {
    /// True for failures the retry wrapper may re-attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Activation status of an issued credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    /// The credential may be used to authenticate.
    Active,
    /// The credential is revoked and must be rejected.
    Revoked,
}

/// A freshly issued credential.
///
/// The private key exists only in this value; it is never persisted, never
/// logged, and disclosed to the caller at most once.
#[derive(Debug)]
pub struct IssuedCredential {
    /// Store-assigned identifier for the credential.
    pub identity_id: String,
    /// The signed certificate (public material).
    pub certificate: String,
    /// Private key material, write-once disclosure.
    pub private_key: SecretString,
}

/// Reference to an authorization policy by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRef(String);

impl PolicyRef {
    /// Wraps a policy name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The policy name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Reference to a registry entry by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryRef(String);

impl EntryRef {
    /// Wraps a registry entry name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The entry name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// A logical device record in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Entry name (deterministic from the serial number).
    pub name: String,
    /// Device group the entry belongs to.
    pub device_group: String,
    /// Attached credential, if any. At most one principal per entry.
    pub principal: Option<String>,
}

/// Issues and revokes cryptographic device credentials.
///
/// The store has no knowledge of devices or policies; callers must record
/// the returned identifier durably before taking any further step.
pub trait IdentityStore: Send + Sync {
    /// Issues a new key pair and certificate for a device.
    ///
    /// # Errors
    ///
    /// `Permanent` on malformed input, `Transient` on throttling or network
    /// failure.
    fn issue_credential(&self, device_name: &str) -> Result<IssuedCredential, AdapterError>;

    /// Revokes and deletes a credential.
    ///
    /// # Errors
    ///
    /// `NotFound` if the credential does not exist.
    fn revoke_credential(&self, identity_id: &str) -> Result<(), AdapterError>;

    /// Updates a credential's activation status.
    ///
    /// # Errors
    ///
    /// `NotFound` if the credential does not exist.
    fn update_credential_status(
        &self,
        identity_id: &str,
        status: CredentialStatus,
    ) -> Result<(), AdapterError>;
}

/// Manages authorization policies and their credential attachments.
pub trait PolicyStore: Send + Sync {
    /// Idempotent create-or-fetch. Policies are immutable once created:
    /// an existing policy with *different* rules is a `Conflict`.
    ///
    /// # Errors
    ///
    /// `Conflict` on a rules mismatch, `Transient` on backend failure.
    fn ensure_policy(&self, name: &str, rules: &PolicyRules) -> Result<PolicyRef, AdapterError>;

    /// Attaches a policy to a credential. Idempotent.
    ///
    /// # Errors
    ///
    /// `NotFound` if the policy does not exist.
    fn attach_policy(&self, policy: &PolicyRef, identity_id: &str) -> Result<(), AdapterError>;

    /// Detaches a policy from a credential. Detaching an attachment that
    /// does not exist is a no-op success.
    ///
    /// # Errors
    ///
    /// `NotFound` if the policy does not exist.
    fn detach_policy(&self, policy: &PolicyRef, identity_id: &str) -> Result<(), AdapterError>;

    /// Deletes the policy only if no credential is attached.
    ///
    /// # Errors
    ///
    /// `Conflict` signals the policy is shared and must not be deleted;
    /// callers treat this as success during compensation.
    fn delete_policy_if_unreferenced(&self, policy: &PolicyRef) -> Result<(), AdapterError>;
}

/// Manages logical device entries.
pub trait DeviceRegistry: Send + Sync {
    /// Creates an entry, or returns the existing one when the same name is
    /// already registered under the same group (names are deterministic).
    ///
    /// # Errors
    ///
    /// `Conflict` when the name exists under a *different* group.
    fn create_entry(&self, name: &str, device_group: &str) -> Result<EntryRef, AdapterError>;

    /// Attaches a credential as the entry's principal.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entry does not exist, `Conflict` if a different
    /// principal is already attached.
    fn attach_principal(&self, entry: &EntryRef, identity_id: &str) -> Result<(), AdapterError>;

    /// Detaches the entry's principal. Detaching when no principal is
    /// attached is a no-op success.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entry does not exist, `Conflict` if a *different*
    /// principal is attached.
    fn detach_principal(&self, entry: &EntryRef, identity_id: &str) -> Result<(), AdapterError>;

    /// Deletes an entry.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entry does not exist, `Conflict` while a principal
    /// is still attached.
    fn delete_entry(&self, entry: &EntryRef) -> Result<(), AdapterError>;

    /// Fetches an entry by name, if it exists.
    ///
    /// # Errors
    ///
    /// `Transient` on backend failure.
    fn describe(&self, name: &str) -> Result<Option<RegistryEntry>, AdapterError>;

    /// Lists all entries of a device group, ordered by name.
    ///
    /// # Errors
    ///
    /// `Transient` on backend failure.
    fn list_entries(&self, device_group: &str) -> Result<Vec<RegistryEntry>, AdapterError>;
}
