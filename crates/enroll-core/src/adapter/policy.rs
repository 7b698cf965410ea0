//! Authorization policy store.
//!
//! Policies scope what a credential may do on the message broker: publish
//! and subscribe grants under the device's topic namespace. A policy is
//! immutable once created and may be shared by every device of a group
//! publishing under the same topic tree, which is why deletion goes through
//! the reference probe [`PolicyStore::delete_policy_if_unreferenced`].

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::{AdapterError, PolicyRef, PolicyStore};

/// Topic grants carried by a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRules {
    /// Topic filters the credential may publish to.
    pub publish: Vec<String>,
    /// Topic filters the credential may subscribe to.
    pub subscribe: Vec<String>,
}

impl PolicyRules {
    /// Standard grants for a device topic namespace: publish to the
    /// namespace and everything below it, subscribe to the namespace's
    /// command subtree.
    #[must_use]
    pub fn for_namespace(topic_namespace: &str) -> Self {
        Self {
            publish: vec![
                topic_namespace.to_string(),
                format!("{topic_namespace}/#"),
            ],
            subscribe: vec![format!("{topic_namespace}/cmd/#")],
        }
    }
}

struct PolicyEntry {
    rules: PolicyRules,
    attachments: HashSet<String>,
}

/// In-process [`PolicyStore`].
#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<HashMap<String, PolicyEntry>>,
}

impl InMemoryPolicyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a policy with this name exists.
    #[must_use]
    pub fn policy_exists(&self, name: &str) -> bool {
        self.policies
            .read()
            .map(|map| map.contains_key(name))
            .unwrap_or(false)
    }

    /// Number of credentials attached to a policy (0 if absent).
    #[must_use]
    pub fn attachment_count(&self, name: &str) -> usize {
        self.policies
            .read()
            .ok()
            .and_then(|map| map.get(name).map(|entry| entry.attachments.len()))
            .unwrap_or(0)
    }

    fn lock_poisoned() -> AdapterError {
        AdapterError::Permanent {
            reason: "policy store lock poisoned".to_string(),
        }
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn ensure_policy(&self, name: &str, rules: &PolicyRules) -> Result<PolicyRef, AdapterError> {
        let mut policies = self.policies.write().map_err(|_| Self::lock_poisoned())?;
        match policies.get(name) {
            Some(entry) if entry.rules == *rules => Ok(PolicyRef::new(name)),
            Some(_) => Err(AdapterError::Conflict {
                reason: format!("policy {name} exists with different rules"),
            }),
            None => {
                policies.insert(
                    name.to_string(),
                    PolicyEntry {
                        rules: rules.clone(),
                        attachments: HashSet::new(),
                    },
                );
                Ok(PolicyRef::new(name))
            },
        }
    }

    fn attach_policy(&self, policy: &PolicyRef, identity_id: &str) -> Result<(), AdapterError> {
        let mut policies = self.policies.write().map_err(|_| Self::lock_poisoned())?;
        let entry = policies.get_mut(policy.name()).ok_or_else(|| AdapterError::NotFound {
            resource: format!("policy {}", policy.name()),
        })?;
        entry.attachments.insert(identity_id.to_string());
        Ok(())
    }

    fn detach_policy(&self, policy: &PolicyRef, identity_id: &str) -> Result<(), AdapterError> {
        let mut policies = self.policies.write().map_err(|_| Self::lock_poisoned())?;
        let entry = policies.get_mut(policy.name()).ok_or_else(|| AdapterError::NotFound {
            resource: format!("policy {}", policy.name()),
        })?;
        entry.attachments.remove(identity_id);
        Ok(())
    }

    fn delete_policy_if_unreferenced(&self, policy: &PolicyRef) -> Result<(), AdapterError> {
        let mut policies = self.policies.write().map_err(|_| Self::lock_poisoned())?;
        match policies.get(policy.name()) {
            None => Ok(()),
            Some(entry) if entry.attachments.is_empty() => {
                policies.remove(policy.name());
                Ok(())
            },
            Some(entry) => Err(AdapterError::Conflict {
                reason: format!(
                    "policy {} has {} attached principals",
                    policy.name(),
                    entry.attachments.len()
                ),
            }),
        }
    }
}
