//! Deterministic resource naming.
//!
//! Registry entries and authorization policies are named by pure functions of
//! the onboarding key so that uniqueness and collision behavior are testable
//! in isolation, and so that a resumed or replayed onboarding always targets
//! the same backend resources. An optional environment suffix keeps parallel
//! deployments (dev/staging/prod) from colliding in shared backends.

/// Characters permitted in device groups, serial numbers, and environment
/// names. The set is closed under name composition: every derived name is
/// itself a valid identifier.
pub const IDENTIFIER_CHARSET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_.:-";

/// Returns true if every character of `value` is in [`IDENTIFIER_CHARSET`].
#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
}

/// Derives backend resource names from onboarding keys.
#[derive(Debug, Clone, Default)]
pub struct NamingScheme {
    environment: Option<String>,
}

impl NamingScheme {
    /// Creates a naming scheme, optionally scoped to a deployment
    /// environment. An environment name is appended as a `-<env>` suffix to
    /// every derived name.
    #[must_use]
    pub fn new(environment: Option<String>) -> Self {
        Self { environment }
    }

    /// Registry entry name for a serial number: `thing-<serial>`.
    #[must_use]
    pub fn registry_entry_name(&self, serial_number: &str) -> String {
        self.suffixed(format!("thing-{serial_number}"))
    }

    /// Policy name for a device group and topic namespace:
    /// `pol-<group>-<namespace root segment>`.
    ///
    /// The policy is keyed on the namespace root rather than the full
    /// namespace so that all devices of a group publishing under the same
    /// topic tree share one policy.
    #[must_use]
    pub fn policy_name(&self, device_group: &str, topic_namespace: &str) -> String {
        let root = namespace_root(topic_namespace);
        self.suffixed(format!("pol-{device_group}-{root}"))
    }

    fn suffixed(&self, name: String) -> String {
        match &self.environment {
            Some(env) => format!("{name}-{env}"),
            None => name,
        }
    }
}

/// First `/`-separated segment of a topic namespace.
///
/// `data/sensors/SN-001` -> `data`. A namespace without a separator is its
/// own root.
#[must_use]
pub fn namespace_root(topic_namespace: &str) -> &str {
    topic_namespace
        .split('/')
        .next()
        .unwrap_or(topic_namespace)
}
