//! Device registry.
//!
//! Holds the logical device records ("things"): a deterministic name, the
//! owning device group, and at most one attached credential principal.
//! Entry names derive from serial numbers, so a name collision across
//! groups means two different onboardings claim the same device; the
//! registry rejects that with a conflict rather than silently adopting the
//! entry.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{AdapterError, DeviceRegistry, EntryRef, RegistryEntry};

/// In-process [`DeviceRegistry`].
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl InMemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_poisoned() -> AdapterError {
        AdapterError::Permanent {
            reason: "registry lock poisoned".to_string(),
        }
    }
}

impl DeviceRegistry for InMemoryRegistry {
    fn create_entry(&self, name: &str, device_group: &str) -> Result<EntryRef, AdapterError> {
        let mut entries = self.entries.write().map_err(|_| Self::lock_poisoned())?;
        match entries.get(name) {
            Some(existing) if existing.device_group == device_group => Ok(EntryRef::new(name)),
            Some(existing) => Err(AdapterError::Conflict {
                reason: format!(
                    "entry {name} already exists under group {}",
                    existing.device_group
                ),
            }),
            None => {
                entries.insert(
                    name.to_string(),
                    RegistryEntry {
                        name: name.to_string(),
                        device_group: device_group.to_string(),
                        principal: None,
                    },
                );
                Ok(EntryRef::new(name))
            },
        }
    }

    fn attach_principal(&self, entry: &EntryRef, identity_id: &str) -> Result<(), AdapterError> {
        let mut entries = self.entries.write().map_err(|_| Self::lock_poisoned())?;
        let record = entries.get_mut(entry.name()).ok_or_else(|| AdapterError::NotFound {
            resource: format!("registry entry {}", entry.name()),
        })?;
        match &record.principal {
            Some(attached) if attached == identity_id => Ok(()),
            Some(attached) => Err(AdapterError::Conflict {
                reason: format!(
                    "entry {} already has principal {attached}",
                    entry.name()
                ),
            }),
            None => {
                record.principal = Some(identity_id.to_string());
                Ok(())
            },
        }
    }

    fn detach_principal(&self, entry: &EntryRef, identity_id: &str) -> Result<(), AdapterError> {
        let mut entries = self.entries.write().map_err(|_| Self::lock_poisoned())?;
        let record = entries.get_mut(entry.name()).ok_or_else(|| AdapterError::NotFound {
            resource: format!("registry entry {}", entry.name()),
        })?;
        match &record.principal {
            Some(attached) if attached == identity_id => {
                record.principal = None;
                Ok(())
            },
            Some(attached) => Err(AdapterError::Conflict {
                reason: format!(
                    "entry {} has a different principal {attached}",
                    entry.name()
                ),
            }),
            None => Ok(()),
        }
    }

    fn delete_entry(&self, entry: &EntryRef) -> Result<(), AdapterError> {
        let mut entries = self.entries.write().map_err(|_| Self::lock_poisoned())?;
        match entries.get(entry.name()) {
            None => Err(AdapterError::NotFound {
                resource: format!("registry entry {}", entry.name()),
            }),
            Some(record) if record.principal.is_some() => Err(AdapterError::Conflict {
                reason: format!("entry {} still has a principal attached", entry.name()),
            }),
            Some(_) => {
                entries.remove(entry.name());
                Ok(())
            },
        }
    }

    fn describe(&self, name: &str) -> Result<Option<RegistryEntry>, AdapterError> {
        let entries = self.entries.read().map_err(|_| Self::lock_poisoned())?;
        Ok(entries.get(name).cloned())
    }

    fn list_entries(&self, device_group: &str) -> Result<Vec<RegistryEntry>, AdapterError> {
        let entries = self.entries.read().map_err(|_| Self::lock_poisoned())?;
        let mut matching: Vec<_> = entries
            .values()
            .filter(|entry| entry.device_group == device_group)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matching)
    }
}
