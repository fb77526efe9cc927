//! Resource Registry
//!
//! References to every object produced during one convergence run, keyed by
//! logical name. Each run builds its own registry; nothing is shared between
//! runs. Entries are written once, and a step that needs an entry calls
//! [`ResourceRegistry::require`] so a missing producer fails the run instead
//! of sending half-filled requests to a platform.

use std::collections::BTreeMap;

use super::types::{ConvergeError, ResourceKey};
use crate::agents::platforms::ResourceRef;

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: BTreeMap<ResourceKey, ResourceRef>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a produced object. A second write for the same key is an error.
    pub fn register(&mut self, key: ResourceKey, reference: ResourceRef) -> Result<&ResourceRef, ConvergeError> {
        use std::collections::btree_map::Entry;

        match self.entries.entry(key) {
            Entry::Occupied(entry) => Err(ConvergeError::AlreadyRegistered(entry.key().to_string())),
            Entry::Vacant(entry) => Ok(entry.insert(reference)),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceRef> {
        self.entries.get(key)
    }

    /// Entry that `operation` depends on
    pub fn require(&self, operation: &'static str, key: &ResourceKey) -> Result<&ResourceRef, ConvergeError> {
        self.entries
            .get(key)
            .ok_or_else(|| ConvergeError::missing(operation, key))
    }

    /// Non-empty attribute of a required entry
    pub fn require_attr(
        &self,
        operation: &'static str,
        key: &ResourceKey,
        attribute: &str,
    ) -> Result<&str, ConvergeError> {
        let reference = self.require(operation, key)?;
        match reference.attr(attribute) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ConvergeError::InvalidPrerequisite {
                operation,
                prerequisite: key.to_string(),
                reason: format!("attribute '{}' is missing or empty", attribute),
            }),
        }
    }

    /// ARN of a required entry
    pub fn require_arn(&self, operation: &'static str, key: &ResourceKey) -> Result<&str, ConvergeError> {
        let reference = self.require(operation, key)?;
        match reference.arn.as_deref() {
            Some(arn) if !arn.is_empty() => Ok(arn),
            _ => Err(ConvergeError::InvalidPrerequisite {
                operation,
                prerequisite: key.to_string(),
                reason: "no ARN".to_string(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &ResourceRef)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::platforms::ResourceKind;

    fn bucket() -> ResourceRef {
        ResourceRef::new(ResourceKind::S3Bucket, "demo-tableflow-bucket", "demo-tableflow-bucket")
            .with_arn("arn:aws:s3:::demo-tableflow-bucket")
    }

    #[test]
    fn test_register_once() {
        let mut registry = ResourceRegistry::new();
        registry.register(ResourceKey::Bucket, bucket()).unwrap();

        let err = registry.register(ResourceKey::Bucket, bucket()).unwrap_err();
        assert!(matches!(err, ConvergeError::AlreadyRegistered(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_require_names_the_operation() {
        let registry = ResourceRegistry::new();
        let err = registry.require("create_catalog", &ResourceKey::ServicePrincipal).unwrap_err();
        assert_eq!(err.to_string(), "create_catalog: missing prerequisite service_principal");
    }

    #[test]
    fn test_require_attr_rejects_empty() {
        let mut registry = ResourceRegistry::new();
        registry
            .register(
                ResourceKey::ProviderIntegration,
                ResourceRef::new(ResourceKind::ProviderIntegration, "pi", "cspi-1")
                    .with_attr("external_id", ""),
            )
            .unwrap();

        let err = registry
            .require_attr("patch", &ResourceKey::ProviderIntegration, "external_id")
            .unwrap_err();
        assert!(matches!(err, ConvergeError::InvalidPrerequisite { .. }));
    }

    #[test]
    fn test_require_arn() {
        let mut registry = ResourceRegistry::new();
        registry.register(ResourceKey::Bucket, bucket()).unwrap();
        assert_eq!(
            registry.require_arn("attach", &ResourceKey::Bucket).unwrap(),
            "arn:aws:s3:::demo-tableflow-bucket"
        );
    }
}
