//! Platform Resource Types
//!
//! The declarative resource model shared by every platform adapter:
//! what we want to exist (`ResourceSpec`), what a platform reports back
//! (`ResourceRef`), and how an apply call changed the world (`ApplyAction`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// External platform identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Aws,
    Confluent,
    Databricks,
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformKind::Aws => write!(f, "aws"),
            PlatformKind::Confluent => write!(f, "confluent"),
            PlatformKind::Databricks => write!(f, "databricks"),
        }
    }
}

/// Every kind of object the stack declares across the three platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    // AWS
    CallerIdentity,
    Vpc,
    InternetGateway,
    Subnet,
    RouteTable,
    DbSubnetGroup,
    SecurityGroup,
    KmsKey,
    DbParameterGroup,
    DbOptionGroup,
    DbInstance,
    S3Bucket,
    IamPolicy,
    IamRole,
    RolePolicyAttachment,
    // Confluent Cloud
    Environment,
    KafkaCluster,
    ServiceAccount,
    RoleBinding,
    ApiKey,
    ProviderIntegration,
    KafkaTopic,
    TableflowTopic,
    Connector,
    CatalogIntegration,
    // Databricks
    ServicePrincipal,
    ServicePrincipalSecret,
    StorageCredential,
    Catalog,
    ExternalLocation,
    Grants,
}

impl ResourceKind {
    /// Platform that owns objects of this kind
    pub fn platform(&self) -> PlatformKind {
        use ResourceKind::*;
        match self {
            CallerIdentity | Vpc | InternetGateway | Subnet | RouteTable | DbSubnetGroup
            | SecurityGroup | KmsKey | DbParameterGroup | DbOptionGroup | DbInstance
            | S3Bucket | IamPolicy | IamRole | RolePolicyAttachment => PlatformKind::Aws,
            Environment | KafkaCluster | ServiceAccount | RoleBinding | ApiKey
            | ProviderIntegration | KafkaTopic | TableflowTopic | Connector
            | CatalogIntegration => PlatformKind::Confluent,
            ServicePrincipal | ServicePrincipalSecret | StorageCredential | Catalog
            | ExternalLocation | Grants => PlatformKind::Databricks,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use ResourceKind::*;
        match self {
            CallerIdentity => "caller_identity",
            Vpc => "vpc",
            InternetGateway => "internet_gateway",
            Subnet => "subnet",
            RouteTable => "route_table",
            DbSubnetGroup => "db_subnet_group",
            SecurityGroup => "security_group",
            KmsKey => "kms_key",
            DbParameterGroup => "db_parameter_group",
            DbOptionGroup => "db_option_group",
            DbInstance => "db_instance",
            S3Bucket => "s3_bucket",
            IamPolicy => "iam_policy",
            IamRole => "iam_role",
            RolePolicyAttachment => "role_policy_attachment",
            Environment => "environment",
            KafkaCluster => "kafka_cluster",
            ServiceAccount => "service_account",
            RoleBinding => "role_binding",
            ApiKey => "api_key",
            ProviderIntegration => "provider_integration",
            KafkaTopic => "kafka_topic",
            TableflowTopic => "tableflow_topic",
            Connector => "connector",
            CatalogIntegration => "catalog_integration",
            ServicePrincipal => "service_principal",
            ServicePrincipalSecret => "service_principal_secret",
            StorageCredential => "storage_credential",
            Catalog => "catalog",
            ExternalLocation => "external_location",
            Grants => "grants",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known attribute keys reported in `ResourceRef::attributes`
pub mod attr {
    /// Principal ARN a provider integration assumes the customer role from
    pub const IAM_ROLE_ARN: &str = "iam_role_arn";
    /// External id paired with a trusted principal
    pub const EXTERNAL_ID: &str = "external_id";
    /// Customer role ARN referenced by an integration or credential
    pub const CUSTOMER_ROLE_ARN: &str = "customer_role_arn";
    pub const REST_ENDPOINT: &str = "rest_endpoint";
    pub const BOOTSTRAP_ENDPOINT: &str = "bootstrap_endpoint";
    /// Confluent resource name (CRN)
    pub const RESOURCE_NAME: &str = "resource_name";
    /// One-time secret (API key secret, service principal secret)
    pub const SECRET: &str = "secret";
    pub const APPLICATION_ID: &str = "application_id";
    /// Database endpoint as `host:port`
    pub const ENDPOINT: &str = "endpoint";
    pub const ASSUME_ROLE_POLICY: &str = "assume_role_policy";
    pub const ACCOUNT_ID: &str = "account_id";
}

/// Desired state of a single external object
#[derive(Clone, PartialEq)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    /// Deterministic logical name (tag `Name`, display name or identifier)
    pub name: String,
    /// Kind-specific settings
    pub properties: Value,
    /// Values that must never be logged (passwords, API secrets)
    pub sensitive: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    /// Deletion protection
    pub protect: bool,
}

impl std::fmt::Debug for ResourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSpec")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("properties", &self.properties)
            .field("sensitive", &self.sensitive.keys().collect::<Vec<_>>())
            .field("tags", &self.tags)
            .field("protect", &self.protect)
            .finish()
    }
}

impl ResourceSpec {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            properties: Value::Object(Map::new()),
            sensitive: BTreeMap::new(),
            tags: BTreeMap::new(),
            protect: false,
        }
    }

    /// Set a single property
    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.properties {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Attach a sensitive value
    pub fn sensitive(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sensitive.insert(key.into(), value.into());
        self
    }

    /// Merge tags (later values win)
    pub fn tags(mut self, tags: &BTreeMap<String, String>) -> Self {
        self.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn protect(mut self, protect: bool) -> Self {
        self.protect = protect;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn str_prop(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Required string property, rejected when missing or empty
    pub fn require_str(&self, key: &str) -> Result<&str, PlatformError> {
        match self.str_prop(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(PlatformError::InvalidSpec {
                kind: self.kind,
                name: self.name.clone(),
                reason: format!("missing property '{}'", key),
            }),
        }
    }

    /// String list property (empty when absent)
    pub fn str_list(&self, key: &str) -> Vec<String> {
        self.properties
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Reference to an object that exists on a platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    /// Platform-assigned identifier
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            id: id.into(),
            arn: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_arn(mut self, arn: impl Into<String>) -> Self {
        self.arn = Some(arn.into());
        self
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// What an apply call did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyAction {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyAction::Created => write!(f, "created"),
            ApplyAction::Updated => write!(f, "updated"),
            ApplyAction::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Result of applying a `ResourceSpec`
#[derive(Debug, Clone)]
pub struct Applied {
    pub resource: ResourceRef,
    pub action: ApplyAction,
}

impl Applied {
    pub fn created(resource: ResourceRef) -> Self {
        Self { resource, action: ApplyAction::Created }
    }

    pub fn updated(resource: ResourceRef) -> Self {
        Self { resource, action: ApplyAction::Updated }
    }

    pub fn unchanged(resource: ResourceRef) -> Self {
        Self { resource, action: ApplyAction::Unchanged }
    }
}

/// Errors reported by platform adapters
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The addressed object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    /// The platform rejected the call
    #[error("{platform} API error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Api {
        platform: PlatformKind,
        status: Option<u16>,
        message: String,
    },

    #[error("{platform} does not manage {kind} resources")]
    Unsupported {
        platform: PlatformKind,
        kind: ResourceKind,
    },

    #[error("invalid {kind} spec '{name}': {reason}")]
    InvalidSpec {
        kind: ResourceKind,
        name: String,
        reason: String,
    },

    /// Network or process failure before the platform answered
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_platform_mapping() {
        assert_eq!(ResourceKind::IamRole.platform(), PlatformKind::Aws);
        assert_eq!(ResourceKind::ProviderIntegration.platform(), PlatformKind::Confluent);
        assert_eq!(ResourceKind::StorageCredential.platform(), PlatformKind::Databricks);
        assert_eq!(ResourceKind::TableflowTopic.to_string(), "tableflow_topic");
    }

    #[test]
    fn test_spec_builder() {
        let tags = BTreeMap::from([("team".to_string(), "data".to_string())]);
        let spec = ResourceSpec::new(ResourceKind::S3Bucket, "demo-tableflow-bucket")
            .property("region", "eu-central-1")
            .tags(&tags)
            .tag("purpose", "storage")
            .protect(true);

        assert_eq!(spec.str_prop("region"), Some("eu-central-1"));
        assert_eq!(spec.tags.len(), 2);
        assert!(spec.protect);
        assert!(spec.require_str("missing").is_err());
    }

    #[test]
    fn test_spec_debug_hides_sensitive_values() {
        let spec = ResourceSpec::new(ResourceKind::Connector, "cdc")
            .sensitive("database.password", "hunter2");

        let debug = format!("{:?}", spec);
        assert!(debug.contains("database.password"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_api_error_message() {
        let err = PlatformError::Api {
            platform: PlatformKind::Confluent,
            status: Some(409),
            message: "conflict".to_string(),
        };
        assert_eq!(err.to_string(), "confluent API error (409): conflict");
        assert!(!err.is_not_found());
    }
}
