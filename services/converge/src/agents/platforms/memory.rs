//! In-Memory Platform
//!
//! A simulated platform that keeps declared objects in a map. Backs the
//! `--simulate` mode of the CLI and every coordinator test. Identifiers,
//! ARNs and one-time secrets are generated the way the real platforms
//! hand them out, so the cross-platform handshake can be exercised end to end.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::types::{
    attr, Applied, PlatformError, PlatformKind, ResourceKind, ResourceRef, ResourceSpec,
};
use super::Platform;

/// Account id the simulated AWS platform reports for itself
const SIMULATED_ACCOUNT_ID: &str = "123456789012";

/// Account the simulated streaming platform assumes customer roles from
const SIMULATED_STREAMING_ACCOUNT_ID: &str = "210987654321";

/// An object held by the in-memory platform
#[derive(Debug, Clone)]
pub struct StoredResource {
    pub reference: ResourceRef,
    pub properties: Value,
    pub tags: BTreeMap<String, String>,
    pub protect: bool,
    /// Bumped on every in-place update
    pub revision: u32,
}

#[derive(Default)]
struct MemoryState {
    resources: BTreeMap<(ResourceKind, String), StoredResource>,
    sequence: u64,
    creates: BTreeMap<ResourceKind, usize>,
    failures: BTreeMap<ResourceKind, String>,
    lookup_failure: Option<String>,
    not_found_as_error: bool,
}

/// Simulated platform
pub struct InMemoryPlatform {
    platform: PlatformKind,
    region: String,
    state: Mutex<MemoryState>,
}

impl InMemoryPlatform {
    pub fn new(platform: PlatformKind, region: &str) -> Self {
        Self {
            platform,
            region: region.to_string(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Report missing objects as `PlatformError::NotFound` instead of `None`,
    /// the way SDKs that raise on a failed get behave.
    pub fn with_not_found_errors(self) -> Self {
        self.state().not_found_as_error = true;
        self
    }

    /// Make every apply of `kind` fail with a platform error
    pub fn fail_on(&self, kind: ResourceKind, message: &str) {
        self.state().failures.insert(kind, message.to_string());
    }

    /// Make every lookup fail with a platform error
    pub fn fail_lookups(&self, message: &str) {
        self.state().lookup_failure = Some(message.to_string());
    }

    /// Place an object on the platform without going through `apply`
    pub fn insert(&self, reference: ResourceRef, properties: Value) {
        let key = (reference.kind, reference.name.clone());
        self.state().resources.insert(
            key,
            StoredResource {
                reference,
                properties,
                tags: BTreeMap::new(),
                protect: false,
                revision: 0,
            },
        );
    }

    /// Snapshot of a stored object
    pub fn stored(&self, kind: ResourceKind, name: &str) -> Option<StoredResource> {
        self.state()
            .resources
            .get(&(kind, name.to_string()))
            .cloned()
    }

    /// All stored objects of `kind`
    pub fn all(&self, kind: ResourceKind) -> Vec<StoredResource> {
        self.state()
            .resources
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, stored)| stored.clone())
            .collect()
    }

    /// Number of create calls that produced an object of `kind`
    pub fn created(&self, kind: ResourceKind) -> usize {
        self.state().creates.get(&kind).copied().unwrap_or(0)
    }

    pub fn account_id(&self) -> &str {
        SIMULATED_ACCOUNT_ID
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_owner(&self, kind: ResourceKind) -> Result<(), PlatformError> {
        if kind.platform() == self.platform {
            Ok(())
        } else {
            Err(PlatformError::Unsupported {
                platform: self.platform,
                kind,
            })
        }
    }

    fn arn_for(&self, kind: ResourceKind, name: &str, id: &str) -> Option<String> {
        let account = SIMULATED_ACCOUNT_ID;
        match kind {
            ResourceKind::IamRole => Some(format!("arn:aws:iam::{}:role/{}", account, name)),
            ResourceKind::IamPolicy => Some(format!("arn:aws:iam::{}:policy/{}", account, name)),
            ResourceKind::S3Bucket => Some(format!("arn:aws:s3:::{}", name)),
            ResourceKind::KmsKey => Some(format!(
                "arn:aws:kms:{}:{}:key/{}",
                self.region, account, id
            )),
            ResourceKind::DbInstance => Some(format!(
                "arn:aws:rds:{}:{}:db:{}",
                self.region, account, name
            )),
            _ => None,
        }
    }

    /// Attributes the platform generates on creation
    fn generated_attributes(&self, spec: &ResourceSpec, id: &str) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        match spec.kind {
            ResourceKind::Environment => {
                attrs.insert(
                    attr::RESOURCE_NAME.to_string(),
                    format!("crn://confluent.cloud/organization=simulated/environment={}", id),
                );
            }
            ResourceKind::KafkaCluster => {
                let host = format!("{}.{}.aws.confluent.cloud", id, self.region);
                attrs.insert(attr::REST_ENDPOINT.to_string(), format!("https://{}:443", host));
                attrs.insert(
                    attr::BOOTSTRAP_ENDPOINT.to_string(),
                    format!("SASL_SSL://{}:9092", host),
                );
            }
            ResourceKind::ProviderIntegration => {
                attrs.insert(
                    attr::IAM_ROLE_ARN.to_string(),
                    format!(
                        "arn:aws:iam::{}:role/tableflow-{}",
                        SIMULATED_STREAMING_ACCOUNT_ID,
                        &Uuid::new_v4().simple().to_string()[..12]
                    ),
                );
                attrs.insert(attr::EXTERNAL_ID.to_string(), Uuid::new_v4().to_string());
            }
            ResourceKind::StorageCredential => {
                attrs.insert(attr::EXTERNAL_ID.to_string(), Uuid::new_v4().to_string());
            }
            ResourceKind::ServicePrincipal => {
                attrs.insert(attr::APPLICATION_ID.to_string(), Uuid::new_v4().to_string());
            }
            ResourceKind::DbInstance => {
                attrs.insert(
                    attr::ENDPOINT.to_string(),
                    format!("{}.simulated.{}.rds.amazonaws.com:1521", spec.name, self.region),
                );
            }
            _ => {}
        }
        attrs
    }

    /// Attributes that mirror spec properties and follow updates
    fn echoed_attributes(spec: &ResourceSpec, attrs: &mut BTreeMap<String, String>) {
        let echoed = match spec.kind {
            ResourceKind::ProviderIntegration => spec.str_prop("customer_role_arn"),
            ResourceKind::StorageCredential => spec.str_prop("role_arn"),
            _ => None,
        };
        if let Some(value) = echoed {
            attrs.insert(attr::CUSTOMER_ROLE_ARN.to_string(), value.to_string());
        }
    }

    fn one_time_secret(kind: ResourceKind) -> Option<String> {
        match kind {
            ResourceKind::ApiKey | ResourceKind::ServicePrincipalSecret => {
                Some(Uuid::new_v4().simple().to_string())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Platform for InMemoryPlatform {
    fn kind(&self) -> PlatformKind {
        self.platform
    }

    async fn lookup(&self, spec: &ResourceSpec) -> Result<Option<ResourceRef>, PlatformError> {
        self.check_owner(spec.kind)?;
        let state = self.state();

        if let Some(message) = &state.lookup_failure {
            return Err(PlatformError::Api {
                platform: self.platform,
                status: Some(403),
                message: message.clone(),
            });
        }

        if spec.kind == ResourceKind::CallerIdentity {
            return Ok(Some(
                ResourceRef::new(ResourceKind::CallerIdentity, &spec.name, SIMULATED_ACCOUNT_ID)
                    .with_attr(attr::ACCOUNT_ID, SIMULATED_ACCOUNT_ID),
            ));
        }

        match state.resources.get(&(spec.kind, spec.name.clone())) {
            Some(stored) => Ok(Some(stored.reference.clone())),
            None if state.not_found_as_error => Err(PlatformError::NotFound {
                kind: spec.kind,
                name: spec.name.clone(),
            }),
            None => Ok(None),
        }
    }

    async fn apply(&self, spec: &ResourceSpec) -> Result<Applied, PlatformError> {
        self.check_owner(spec.kind)?;
        if spec.kind == ResourceKind::CallerIdentity {
            return Err(PlatformError::Unsupported {
                platform: self.platform,
                kind: spec.kind,
            });
        }

        let mut state = self.state();

        if let Some(message) = state.failures.get(&spec.kind) {
            return Err(PlatformError::Api {
                platform: self.platform,
                status: Some(400),
                message: message.clone(),
            });
        }

        let key = (spec.kind, spec.name.clone());
        if let Some(stored) = state.resources.get_mut(&key) {
            if stored.properties == spec.properties
                && stored.tags == spec.tags
                && stored.protect == spec.protect
            {
                debug!(kind = %spec.kind, name = %spec.name, "Simulated resource unchanged");
                return Ok(Applied::unchanged(stored.reference.clone()));
            }

            stored.properties = spec.properties.clone();
            stored.tags = spec.tags.clone();
            stored.protect = spec.protect;
            stored.revision += 1;
            Self::echoed_attributes(spec, &mut stored.reference.attributes);

            debug!(kind = %spec.kind, name = %spec.name, revision = stored.revision, "Simulated resource updated");
            return Ok(Applied::updated(stored.reference.clone()));
        }

        state.sequence += 1;
        let id = match spec.kind {
            ResourceKind::Vpc if spec.str_prop("vpc_id").is_some() => {
                spec.str_prop("vpc_id").unwrap_or_default().to_string()
            }
            ResourceKind::S3Bucket | ResourceKind::Catalog | ResourceKind::KafkaTopic => {
                spec.name.clone()
            }
            kind => format!("{}-{:05}", kind.as_str().replace('_', ""), state.sequence),
        };

        let mut reference = ResourceRef::new(spec.kind, &spec.name, &id);
        reference.arn = self.arn_for(spec.kind, &spec.name, &id);
        reference.attributes = self.generated_attributes(spec, &id);
        Self::echoed_attributes(spec, &mut reference.attributes);

        state.resources.insert(
            key,
            StoredResource {
                reference: reference.clone(),
                properties: spec.properties.clone(),
                tags: spec.tags.clone(),
                protect: spec.protect,
                revision: 0,
            },
        );
        *state.creates.entry(spec.kind).or_insert(0) += 1;

        debug!(kind = %spec.kind, name = %spec.name, id = %id, "Simulated resource created");

        // Secrets are only handed out once, on creation
        if let Some(secret) = Self::one_time_secret(spec.kind) {
            reference = reference.with_attr(attr::SECRET, secret);
        }
        Ok(Applied::created(reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::platforms::ApplyAction;

    #[tokio::test]
    async fn test_apply_is_lookup_or_create() {
        let aws = InMemoryPlatform::new(PlatformKind::Aws, "eu-central-1");
        let spec = ResourceSpec::new(ResourceKind::S3Bucket, "demo-tableflow-bucket")
            .tag("purpose", "storage");

        let first = aws.apply(&spec).await.unwrap();
        let second = aws.apply(&spec).await.unwrap();

        assert_eq!(first.action, ApplyAction::Created);
        assert_eq!(second.action, ApplyAction::Unchanged);
        assert_eq!(first.resource.id, second.resource.id);
        assert_eq!(aws.created(ResourceKind::S3Bucket), 1);
        assert_eq!(
            first.resource.arn.as_deref(),
            Some("arn:aws:s3:::demo-tableflow-bucket")
        );
    }

    #[tokio::test]
    async fn test_changed_properties_update_in_place() {
        let aws = InMemoryPlatform::new(PlatformKind::Aws, "eu-central-1");
        let spec = ResourceSpec::new(ResourceKind::IamRole, "demo-role").property("v", 1);
        aws.apply(&spec).await.unwrap();

        let applied = aws.apply(&spec.clone().property("v", 2)).await.unwrap();

        assert_eq!(applied.action, ApplyAction::Updated);
        let stored = aws.stored(ResourceKind::IamRole, "demo-role").unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.properties["v"], 2);
        assert_eq!(aws.created(ResourceKind::IamRole), 1);
    }

    #[tokio::test]
    async fn test_secret_only_returned_on_create() {
        let streaming = InMemoryPlatform::new(PlatformKind::Confluent, "eu-central-1");
        let spec = ResourceSpec::new(ResourceKind::ApiKey, "demo-key");

        let created = streaming.apply(&spec).await.unwrap();
        let again = streaming.apply(&spec).await.unwrap();

        assert!(created.resource.attr(attr::SECRET).is_some());
        assert!(again.resource.attr(attr::SECRET).is_none());
    }

    #[tokio::test]
    async fn test_provider_integration_exposes_trust_pair() {
        let streaming = InMemoryPlatform::new(PlatformKind::Confluent, "eu-central-1");
        let spec = ResourceSpec::new(ResourceKind::ProviderIntegration, "demo-s3")
            .property("customer_role_arn", "arn:aws:iam::123456789012:role/demo");

        let applied = streaming.apply(&spec).await.unwrap();
        let found = streaming.lookup(&spec).await.unwrap().unwrap();

        assert!(found.attr(attr::IAM_ROLE_ARN).unwrap().starts_with("arn:aws:iam::"));
        assert!(!found.attr(attr::EXTERNAL_ID).unwrap().is_empty());
        assert_eq!(found, applied.resource);
    }

    #[tokio::test]
    async fn test_missing_lookup_modes() {
        let quiet = InMemoryPlatform::new(PlatformKind::Aws, "eu-central-1");
        let loud = InMemoryPlatform::new(PlatformKind::Aws, "eu-central-1").with_not_found_errors();
        let spec = ResourceSpec::new(ResourceKind::IamRole, "absent");

        assert!(quiet.lookup(&spec).await.unwrap().is_none());
        assert!(loud.lookup(&spec).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_foreign_kind_is_rejected() {
        let aws = InMemoryPlatform::new(PlatformKind::Aws, "eu-central-1");
        let spec = ResourceSpec::new(ResourceKind::Catalog, "demo");

        let err = aws.apply(&spec).await.unwrap_err();
        assert!(matches!(err, PlatformError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let databricks = InMemoryPlatform::new(PlatformKind::Databricks, "eu-central-1");
        databricks.fail_on(ResourceKind::Catalog, "PERMISSION_DENIED");

        let err = databricks
            .apply(&ResourceSpec::new(ResourceKind::Catalog, "demo"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("PERMISSION_DENIED"));
        assert!(databricks.stored(ResourceKind::Catalog, "demo").is_none());
    }
}
