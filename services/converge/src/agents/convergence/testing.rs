//! Shared fixtures for coordinator tests

use serde_json::json;
use std::sync::Arc;

use super::config::StackConfig;
use super::coordinator::StageCoordinator;
use super::policy::PolicyDocument;
use super::types::{LinkingRole, NamedIdentity};
use crate::agents::lifecycle::SimulatedInvoker;
use crate::agents::platforms::{
    attr, InMemoryPlatform, PlatformKind, Platforms, ResourceKind, ResourceRef,
};

pub(crate) struct Harness {
    pub aws: Arc<InMemoryPlatform>,
    pub streaming: Arc<InMemoryPlatform>,
    pub lakehouse: Arc<InMemoryPlatform>,
    pub scripts: Arc<SimulatedInvoker>,
    pub coordinator: StageCoordinator,
}

impl Harness {
    pub fn new(config: StackConfig) -> Self {
        let region = config.region.clone();
        Self::build(config, InMemoryPlatform::new(PlatformKind::Aws, &region))
    }

    /// AWS reports missing roles as errors rather than `None`
    pub fn with_not_found_errors(config: StackConfig) -> Self {
        let region = config.region.clone();
        Self::build(
            config,
            InMemoryPlatform::new(PlatformKind::Aws, &region).with_not_found_errors(),
        )
    }

    fn build(config: StackConfig, aws: InMemoryPlatform) -> Self {
        let aws = Arc::new(aws);
        let streaming = Arc::new(InMemoryPlatform::new(PlatformKind::Confluent, &config.region));
        let lakehouse = Arc::new(InMemoryPlatform::new(PlatformKind::Databricks, &config.region));
        let scripts = Arc::new(SimulatedInvoker::new());

        let platforms = Platforms::new(aws.clone(), streaming.clone(), lakehouse.clone());
        let coordinator = StageCoordinator::new(config, platforms, scripts.clone());

        Self {
            aws,
            streaming,
            lakehouse,
            scripts,
            coordinator,
        }
    }

    /// Place a deny-all linking role directly on the AWS platform
    pub fn seed_role(&self, role: LinkingRole) {
        let identity = NamedIdentity::new(&self.coordinator.config().resource_prefix, role);
        let arn = format!("arn:aws:iam::{}:role/{}", self.aws.account_id(), identity.name);
        self.aws.insert(
            ResourceRef::new(ResourceKind::IamRole, &identity.name, format!("AROA-{}", identity.name))
                .with_arn(arn),
            json!({ "assume_role_policy": PolicyDocument::deny_all_trust().to_value() }),
        );
    }

    /// Current trust policy of a stored role
    pub fn role_policy(&self, name: &str) -> PolicyDocument {
        let stored = self
            .aws
            .stored(ResourceKind::IamRole, name)
            .unwrap_or_else(|| panic!("role {} not stored", name));
        PolicyDocument::from_value(&stored.properties[attr::ASSUME_ROLE_POLICY])
            .unwrap_or_else(|| panic!("role {} has no trust policy", name))
    }
}
