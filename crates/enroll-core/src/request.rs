//! Onboarding request and response types.
//!
//! Validation lives here, at the orchestrator's caller contract: a request
//! that fails validation is rejected before any ledger or backend state is
//! touched, and is never retried.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::naming::{is_valid_identifier, namespace_root};
use crate::record::OnboardingRecord;

/// Maximum length of device group and serial number identifiers.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Maximum length of a topic namespace.
pub const MAX_NAMESPACE_LEN: usize = 256;

/// Errors produced by request validation. Not retried; returned to the
/// caller immediately.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// A required field is empty.
    #[error("{field} must not be empty")]
    Empty {
        /// The offending field.
        field: &'static str,
    },

    /// A field exceeds its length bound.
    #[error("{field} exceeds {max} characters")]
    TooLong {
        /// The offending field.
        field: &'static str,
        /// The enforced bound.
        max: usize,
    },

    /// A field contains characters outside the identifier charset.
    #[error("{field} contains characters outside [A-Za-z0-9_.:-]")]
    InvalidCharacters {
        /// The offending field.
        field: &'static str,
    },

    /// The topic namespace contains an MQTT wildcard.
    #[error("topic namespace must not contain MQTT wildcards")]
    WildcardInNamespace,

    /// The topic namespace has an empty `/`-separated segment.
    #[error("topic namespace has an empty segment")]
    EmptyNamespaceSegment,

    /// The topic namespace does not live under the configured root topic.
    #[error("topic namespace must start under the root topic segment {expected_root:?}")]
    NamespaceOutsideRoot {
        /// First segment of the configured root topic.
        expected_root: String,
    },

    /// The serial number does not appear in the topic namespace.
    #[error("topic namespace must contain the device serial number as a segment")]
    SerialNotInNamespace,
}

/// A request to provision one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardRequest {
    /// Device group (ledger partition key).
    pub device_group: String,
    /// Device serial number (ledger sort key).
    pub serial_number: String,
    /// Topic namespace the device will publish under.
    pub topic_namespace: String,
    /// Opaque caller identity from the authentication front door; recorded
    /// in logs only.
    #[serde(default)]
    pub caller_identity: Option<String>,
}

impl OnboardRequest {
    /// Validates the request against the configured root topic.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self, root_topic: &str) -> Result<(), ValidationError> {
        validate_identifier("device_group", &self.device_group)?;
        validate_identifier("serial_number", &self.serial_number)?;

        let namespace = self.topic_namespace.as_str();
        if namespace.is_empty() {
            return Err(ValidationError::Empty {
                field: "topic_namespace",
            });
        }
        if namespace.len() > MAX_NAMESPACE_LEN {
            return Err(ValidationError::TooLong {
                field: "topic_namespace",
                max: MAX_NAMESPACE_LEN,
            });
        }
        if namespace.contains(['+', '#']) {
            return Err(ValidationError::WildcardInNamespace);
        }
        if namespace.split('/').any(str::is_empty) {
            return Err(ValidationError::EmptyNamespaceSegment);
        }

        // The root topic is configured as a filter like `data/#`; devices
        // must publish under its first concrete segment.
        let expected_root = namespace_root(root_topic);
        if expected_root != "#" && expected_root != "+" && namespace_root(namespace) != expected_root
        {
            return Err(ValidationError::NamespaceOutsideRoot {
                expected_root: expected_root.to_string(),
            });
        }

        if !namespace
            .split('/')
            .any(|segment| segment == self.serial_number)
        {
            return Err(ValidationError::SerialNotInNamespace);
        }

        Ok(())
    }
}

/// A request to decommission one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    /// Device group (ledger partition key).
    pub device_group: String,
    /// Device serial number (ledger sort key).
    pub serial_number: String,
}

impl DeprovisionRequest {
    /// Validates the request key.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("device_group", &self.device_group)?;
        validate_identifier("serial_number", &self.serial_number)
    }
}

fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_IDENTIFIER_LEN,
        });
    }
    if !is_valid_identifier(value) {
        return Err(ValidationError::InvalidCharacters { field });
    }
    Ok(())
}

/// How an onboarding request reached `COMPLETE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardOutcome {
    /// A credential was issued by this invocation; key material is present.
    Provisioned,
    /// An interrupted saga was driven to completion; the key was disclosed
    /// (at most) to the original caller and is not present.
    Resumed,
    /// The record was already `COMPLETE`; nothing was issued.
    Replayed,
}

/// Result of a successful onboarding.
///
/// `certificate` and `private_key` are present only when this invocation
/// issued the credential ([`OnboardOutcome::Provisioned`]); after that the
/// private key is never retrievable again.
#[derive(Debug)]
pub struct OnboardResult {
    /// Device group.
    pub device_group: String,
    /// Device serial number.
    pub serial_number: String,
    /// Identifier of the device's credential.
    pub identity_id: String,
    /// Name of the device's registry entry.
    pub registry_entry_name: String,
    /// The issued certificate, first completion only.
    pub certificate: Option<String>,
    /// Private key material, write-once disclosure.
    pub private_key: Option<SecretString>,
    /// How this result was produced.
    pub outcome: OnboardOutcome,
}

impl OnboardResult {
    /// Builds the replay shape for an already-`COMPLETE` record: resource
    /// identifiers only, no key material.
    #[must_use]
    pub fn replay(record: &OnboardingRecord) -> Self {
        Self {
            device_group: record.device_group.clone(),
            serial_number: record.serial_number.clone(),
            identity_id: record.identity_id.clone().unwrap_or_default(),
            registry_entry_name: record.registry_entry_name.clone().unwrap_or_default(),
            certificate: None,
            private_key: None,
            outcome: OnboardOutcome::Replayed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OnboardRequest {
        OnboardRequest {
            device_group: "sensors".to_string(),
            serial_number: "SN-001".to_string(),
            topic_namespace: "data/sensors/SN-001".to_string(),
            caller_identity: Some("operator@example.com".to_string()),
        }
    }

    #[test]
    fn accepts_the_reference_request() {
        request().validate("data/#").unwrap();
    }

    #[test]
    fn rejects_empty_and_oversized_fields() {
        let mut req = request();
        req.device_group = String::new();
        assert_eq!(
            req.validate("data/#").unwrap_err(),
            ValidationError::Empty {
                field: "device_group"
            }
        );

        let mut req = request();
        req.serial_number = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(
            req.validate("data/#").unwrap_err(),
            ValidationError::TooLong {
                field: "serial_number",
                ..
            }
        ));
    }

    #[test]
    fn rejects_wildcards_in_namespace() {
        for namespace in ["data/sensors/+", "data/#", "data/sensors/SN-001/#"] {
            let mut req = request();
            req.topic_namespace = namespace.to_string();
            assert_eq!(
                req.validate("data/#").unwrap_err(),
                ValidationError::WildcardInNamespace,
                "{namespace}"
            );
        }
    }

    #[test]
    fn rejects_namespace_outside_root() {
        let mut req = request();
        req.topic_namespace = "telemetry/sensors/SN-001".to_string();
        assert!(matches!(
            req.validate("data/#").unwrap_err(),
            ValidationError::NamespaceOutsideRoot { .. }
        ));
    }

    #[test]
    fn rejects_namespace_without_serial() {
        let mut req = request();
        req.topic_namespace = "data/sensors/other".to_string();
        assert_eq!(
            req.validate("data/#").unwrap_err(),
            ValidationError::SerialNotInNamespace
        );
    }

    #[test]
    fn rejects_empty_segments() {
        let mut req = request();
        req.topic_namespace = "data//SN-001".to_string();
        assert_eq!(
            req.validate("data/#").unwrap_err(),
            ValidationError::EmptyNamespaceSegment
        );
    }

    #[test]
    fn identifier_charset_is_enforced() {
        let mut req = request();
        req.serial_number = "SN 001".to_string();
        assert_eq!(
            req.validate("data/#").unwrap_err(),
            ValidationError::InvalidCharacters {
                field: "serial_number"
            }
        );
    }

    #[test]
    fn deprovision_request_validates_key_only() {
        DeprovisionRequest {
            device_group: "sensors".to_string(),
            serial_number: "SN-001".to_string(),
        }
        .validate()
        .unwrap();

        let err = DeprovisionRequest {
            device_group: "sensors".to_string(),
            serial_number: String::new(),
        }
        .validate()
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::Empty {
                field: "serial_number"
            }
        );
    }
}
