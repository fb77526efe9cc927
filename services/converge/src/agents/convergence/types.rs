//! Convergence Types
//!
//! Linking roles and their named identities, the run stage, registry keys,
//! the run report and the error type every coordinator step returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::lifecycle::ScriptError;
use crate::agents::platforms::{ApplyAction, PlatformError, PlatformKind, ResourceKind};

/// One of the two cross-platform trust objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkingRole {
    /// Assumed by the streaming platform's provider integration (Tableflow)
    StreamingAccess,
    /// Assumed by the lakehouse platform through its storage credential
    LakehouseAccess,
}

impl LinkingRole {
    pub const ALL: [LinkingRole; 2] = [LinkingRole::StreamingAccess, LinkingRole::LakehouseAccess];

    pub fn suffix(&self) -> &'static str {
        match self {
            LinkingRole::StreamingAccess => "tableflow-access-role",
            LinkingRole::LakehouseAccess => "dbx-access-role",
        }
    }

    /// Value of the `Purpose` tag on the role
    pub fn purpose(&self) -> &'static str {
        match self {
            LinkingRole::StreamingAccess => "Tableflow S3 Access",
            LinkingRole::LakehouseAccess => "Databricks S3 Access",
        }
    }

    /// Platform whose principal ends up trusted by the role
    pub fn trusted_platform(&self) -> PlatformKind {
        match self {
            LinkingRole::StreamingAccess => PlatformKind::Confluent,
            LinkingRole::LakehouseAccess => PlatformKind::Databricks,
        }
    }
}

impl std::fmt::Display for LinkingRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkingRole::StreamingAccess => write!(f, "streaming-access"),
            LinkingRole::LakehouseAccess => write!(f, "lakehouse-access"),
        }
    }
}

/// Deterministic external name of a linking role
///
/// Stage one and stage two both derive the name from the prefix alone, so
/// probes and later patches always address the same object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamedIdentity {
    pub role: LinkingRole,
    pub name: String,
}

impl NamedIdentity {
    pub fn new(prefix: &str, role: LinkingRole) -> Self {
        Self {
            role,
            name: format!("{}-{}", prefix, role.suffix()),
        }
    }
}

impl std::fmt::Display for NamedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Where the whole environment stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// At least one linking role is missing
    Bootstrap,
    /// Both linking roles exist and can be dereferenced
    Linked,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Bootstrap => write!(f, "bootstrap"),
            Stage::Linked => write!(f, "linked"),
        }
    }
}

/// Logical name of an entry in the resource registry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "key", content = "qualifier")]
pub enum ResourceKey {
    CallerIdentity,
    Vpc,
    InternetGateway,
    Subnet(u8),
    RouteTable,
    DbSubnetGroup,
    SecurityGroup,
    KmsKey,
    DbParameterGroup,
    DbOptionGroup,
    Database,
    Bucket,
    AccessPolicy,
    Role(LinkingRole),
    /// The role after its trust policy was patched in stage two
    Trust(LinkingRole),
    PolicyAttachment(LinkingRole),
    Environment,
    KafkaCluster,
    ServiceAccount,
    EnvironmentAdmin,
    KafkaApiKey,
    TableflowApiKey,
    ProviderIntegration,
    Topic(String),
    TableflowTopic(String),
    Connector,
    ServicePrincipal,
    ServicePrincipalSecret,
    StorageCredential,
    Catalog,
    ExternalLocation,
    Grants(ResourceKind),
    CatalogIntegration,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKey::Subnet(index) => write!(f, "subnet[{}]", index),
            ResourceKey::Role(role) => write!(f, "role[{}]", role),
            ResourceKey::Trust(role) => write!(f, "trust[{}]", role),
            ResourceKey::PolicyAttachment(role) => write!(f, "policy_attachment[{}]", role),
            ResourceKey::Topic(dataset) => write!(f, "topic[{}]", dataset),
            ResourceKey::TableflowTopic(dataset) => write!(f, "tableflow_topic[{}]", dataset),
            ResourceKey::Grants(kind) => write!(f, "grants[{}]", kind),
            ResourceKey::CallerIdentity => write!(f, "caller_identity"),
            ResourceKey::Vpc => write!(f, "vpc"),
            ResourceKey::InternetGateway => write!(f, "internet_gateway"),
            ResourceKey::RouteTable => write!(f, "route_table"),
            ResourceKey::DbSubnetGroup => write!(f, "db_subnet_group"),
            ResourceKey::SecurityGroup => write!(f, "security_group"),
            ResourceKey::KmsKey => write!(f, "kms_key"),
            ResourceKey::DbParameterGroup => write!(f, "db_parameter_group"),
            ResourceKey::DbOptionGroup => write!(f, "db_option_group"),
            ResourceKey::Database => write!(f, "database"),
            ResourceKey::Bucket => write!(f, "bucket"),
            ResourceKey::AccessPolicy => write!(f, "access_policy"),
            ResourceKey::Environment => write!(f, "environment"),
            ResourceKey::KafkaCluster => write!(f, "kafka_cluster"),
            ResourceKey::ServiceAccount => write!(f, "service_account"),
            ResourceKey::EnvironmentAdmin => write!(f, "environment_admin"),
            ResourceKey::KafkaApiKey => write!(f, "kafka_api_key"),
            ResourceKey::TableflowApiKey => write!(f, "tableflow_api_key"),
            ResourceKey::ProviderIntegration => write!(f, "provider_integration"),
            ResourceKey::Connector => write!(f, "connector"),
            ResourceKey::ServicePrincipal => write!(f, "service_principal"),
            ResourceKey::ServicePrincipalSecret => write!(f, "service_principal_secret"),
            ResourceKey::StorageCredential => write!(f, "storage_credential"),
            ResourceKey::Catalog => write!(f, "catalog"),
            ResourceKey::ExternalLocation => write!(f, "external_location"),
            ResourceKey::CatalogIntegration => write!(f, "catalog_integration"),
        }
    }
}

/// One line of the run report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub key: String,
    pub kind: ResourceKind,
    pub name: String,
    pub id: String,
    pub action: ApplyAction,
}

/// Summary of a convergence run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub prefix: String,
    /// Decided after the foundation pass
    pub stage: Option<Stage>,
    /// Whether the stage-two link pass ran
    pub linked: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub changes: Vec<ResourceChange>,
}

impl RunReport {
    pub fn new(prefix: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            prefix: prefix.to_string(),
            stage: None,
            linked: false,
            started_at: Utc::now(),
            finished_at: None,
            changes: Vec::new(),
        }
    }

    pub fn record(&mut self, key: &ResourceKey, kind: ResourceKind, name: &str, id: &str, action: ApplyAction) {
        self.changes.push(ResourceChange {
            key: key.to_string(),
            kind,
            name: name.to_string(),
            id: id.to_string(),
            action,
        });
    }

    pub fn count(&self, action: ApplyAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// Errors that abort a convergence run
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// A platform call failed while applying or probing `name`
    #[error("{operation} failed for {kind} '{name}': {source}")]
    Platform {
        operation: &'static str,
        kind: ResourceKind,
        name: String,
        #[source]
        source: PlatformError,
    },

    #[error("{operation}: missing prerequisite {prerequisite}")]
    MissingPrerequisite {
        operation: &'static str,
        prerequisite: String,
    },

    #[error("{operation}: prerequisite {prerequisite} is unusable: {reason}")]
    InvalidPrerequisite {
        operation: &'static str,
        prerequisite: String,
        reason: String,
    },

    /// A registry entry was written twice in one run
    #[error("resource {0} was already registered in this run")]
    AlreadyRegistered(String),

    #[error("{operation}: {source}")]
    Script {
        operation: &'static str,
        #[source]
        source: ScriptError,
    },

    #[error("output store: {0}")]
    Outputs(String),

    #[error("configuration: {0}")]
    Config(String),
}

impl ConvergeError {
    pub fn missing(operation: &'static str, prerequisite: impl std::fmt::Display) -> Self {
        ConvergeError::MissingPrerequisite {
            operation,
            prerequisite: prerequisite.to_string(),
        }
    }
}
