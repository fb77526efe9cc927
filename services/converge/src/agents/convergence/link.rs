//! Link pass
//!
//! Stage two. Runs only once both linking roles exist, and closes the
//! cross-platform handshake in dependency order:
//!
//! 1. Lakehouse identity: service principal, its secret and the storage
//!    credential that references the lakehouse role
//! 2. Streaming foundation: environment, cluster, service account, API keys
//!    and the provider integration that references the streaming role
//! 3. Patch the streaming role to trust the integration's principal
//! 4. Per-dataset topics (concurrently) and the CDC connector
//! 5. Patch the lakehouse role to trust Unity Catalog
//! 6. Catalog, external location and the catalog integration

use futures::future::try_join_all;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::coordinator::{RunContext, StageCoordinator};
use super::outputs::keys;
use super::policy::PolicyDocument;
use super::types::{ConvergeError, LinkingRole, ResourceKey};
use crate::agents::lifecycle::CommandOp;
use crate::agents::platforms::{attr, Applied, ApplyAction, ResourceKind, ResourceRef, ResourceSpec};

const TABLE_FORMATS: [&str; 2] = ["ICEBERG", "DELTA"];
const ALL_PRIVILEGES: &str = "ALL_PRIVILEGES";
const ACCOUNT_USERS: &str = "account users";
const READER_PRIVILEGES: [&str; 6] = [
    "BROWSE",
    "EXECUTE",
    "READ_VOLUME",
    "SELECT",
    "USE_CATALOG",
    "USE_SCHEMA",
];

impl StageCoordinator {
    pub(super) async fn run_link(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        info!(prefix = %self.prefix(), "Running link pass");

        self.lakehouse_identity(ctx).await?;
        self.streaming_foundation(ctx).await?;
        self.patch_streaming_trust(ctx).await?;
        self.replicate_datasets(ctx).await?;
        self.cdc_connector(ctx).await?;
        self.patch_lakehouse_trust(ctx).await?;
        self.catalog(ctx).await?;
        self.catalog_integration(ctx).await
    }

    /// Service principal, its secret, the storage credential and its grants
    pub(super) async fn lakehouse_identity(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        const OPERATION: &str = "lakehouse_identity";
        let p = self.prefix().to_string();

        let principal = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::ServicePrincipal,
                &self
                    .spec(ResourceKind::ServicePrincipal, format!("{}-dbx-sa", p))
                    .property("workspace_access", true)
                    .property("databricks_sql_access", true),
            )
            .await?;

        let secret_spec = self
            .spec(ResourceKind::ServicePrincipalSecret, format!("{}-dbx-sa-secret", p))
            .property("service_principal_id", principal.id.as_str());
        let secret = self
            .apply(ctx, OPERATION, ResourceKey::ServicePrincipalSecret, &secret_spec)
            .await?;
        self.keep_secret(ctx, OPERATION, &secret, keys::SERVICE_PRINCIPAL_SECRET)?;

        // Prefer the exported ARN so stage one's output is the single source
        let identity = self.identity(LinkingRole::LakehouseAccess);
        let role_arn = match ctx.outputs.value(&identity.name) {
            Some(arn) => arn.to_string(),
            None => ctx
                .registry
                .require_arn(OPERATION, &ResourceKey::Role(LinkingRole::LakehouseAccess))?
                .to_string(),
        };

        let credential = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::StorageCredential,
                &self
                    .spec(ResourceKind::StorageCredential, format!("{}-dbx-storage-creds", p))
                    .property("role_arn", role_arn)
                    .property("comment", "Tableflow bucket access for Unity Catalog"),
            )
            .await?;

        let application_id = ctx
            .registry
            .require_attr(OPERATION, &ResourceKey::ServicePrincipal, attr::APPLICATION_ID)?
            .to_string();
        self.grant(
            ctx,
            OPERATION,
            ResourceKind::StorageCredential,
            &credential.name,
            vec![(application_id, vec![ALL_PRIVILEGES])],
        )
        .await?;

        Ok(())
    }

    /// Environment, cluster, service account with its keys and the provider integration
    pub(super) async fn streaming_foundation(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        const OPERATION: &str = "streaming_foundation";
        let p = self.prefix().to_string();

        let environment = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::Environment,
                &self
                    .spec(ResourceKind::Environment, format!("{}-ccloud-env-oracle-cdc-demo", p))
                    .property("stream_governance", "ADVANCED"),
            )
            .await?;

        let cluster = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::KafkaCluster,
                &self
                    .spec(ResourceKind::KafkaCluster, format!("{}-ccloud-cluster-oracle-cdc-demo", p))
                    .property("environment_id", environment.id.as_str())
                    .property("availability", "SINGLE_ZONE")
                    .property("cloud", "AWS")
                    .property("region", self.config.region.as_str())
                    .property("cluster_type", "Standard"),
            )
            .await?;

        let account = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::ServiceAccount,
                &self
                    .spec(ResourceKind::ServiceAccount, format!("{}-xstream-sa", p))
                    .property("description", "Oracle XStream CDC connector"),
            )
            .await?;

        let crn = ctx
            .registry
            .require_attr(OPERATION, &ResourceKey::Environment, attr::RESOURCE_NAME)?
            .to_string();
        self.apply(
            ctx,
            OPERATION,
            ResourceKey::EnvironmentAdmin,
            &self
                .spec(ResourceKind::RoleBinding, format!("{}-env-admin", account.name))
                .property("principal", format!("User:{}", account.id))
                .property("role_name", "EnvironmentAdmin")
                .property("crn_pattern", crn),
        )
        .await?;

        let kafka_key = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::KafkaApiKey,
                &self
                    .spec(ResourceKind::ApiKey, format!("{}-kafka-api-key", account.name))
                    .property("owner_id", account.id.as_str())
                    .property("resource_id", cluster.id.as_str())
                    .property("environment_id", environment.id.as_str())
                    .property("description", "Kafka API key for the XStream service account"),
            )
            .await?;
        ctx.export(keys::KAFKA_API_KEY, kafka_key.id.as_str());
        self.keep_secret(ctx, OPERATION, &kafka_key, keys::KAFKA_API_SECRET)?;

        let tableflow_key = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::TableflowApiKey,
                &self
                    .spec(ResourceKind::ApiKey, format!("{}-tableflow-api-key", account.name))
                    .property("owner_id", account.id.as_str())
                    .property("resource_id", "tableflow")
                    .property("description", "Tableflow API key for the XStream service account"),
            )
            .await?;
        ctx.export(keys::TABLEFLOW_API_KEY, tableflow_key.id.as_str());
        self.keep_secret(ctx, OPERATION, &tableflow_key, keys::TABLEFLOW_API_SECRET)?;

        let role_arn = ctx
            .registry
            .require_arn(OPERATION, &ResourceKey::Role(LinkingRole::StreamingAccess))?
            .to_string();
        let integration = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::ProviderIntegration,
                &self.provider_integration_spec(&environment.id, &role_arn),
            )
            .await?;

        ctx.export(keys::CONFLUENT_ENVIRONMENT_ID, environment.id);
        ctx.export(keys::CONFLUENT_CLUSTER_ID, cluster.id);
        ctx.export(keys::PROVIDER_INTEGRATION_ID, integration.id);
        Ok(())
    }

    fn provider_integration_spec(&self, environment_id: &str, role_arn: &str) -> ResourceSpec {
        self.spec(
            ResourceKind::ProviderIntegration,
            format!("{}-tableflow-s3-integration", self.prefix()),
        )
        .property("environment_id", environment_id)
        .property("customer_role_arn", role_arn)
    }

    /// Replace the streaming role's deny-all trust with one scoped to the
    /// provider integration's principal and external id.
    ///
    /// The pair is read back from the streaming platform rather than from the
    /// apply result, and both halves must be non-empty before any policy is
    /// sent.
    pub(super) async fn patch_streaming_trust(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        const OPERATION: &str = "patch_streaming_trust";
        let key = ResourceKey::ProviderIntegration;

        let identity = self.identity(LinkingRole::StreamingAccess);
        let registered = ctx.registry.require(OPERATION, &key)?;
        let role_arn = match registered.attr(attr::CUSTOMER_ROLE_ARN).filter(|arn| !arn.is_empty()) {
            Some(arn) => arn.to_string(),
            None => self.require_output(ctx, OPERATION, &identity.name)?,
        };
        let environment_id = ctx.registry.require(OPERATION, &ResourceKey::Environment)?.id.clone();

        let spec = self.provider_integration_spec(&environment_id, &role_arn);
        let integration = self
            .lookup(OPERATION, &spec)
            .await?
            .ok_or_else(|| ConvergeError::missing(OPERATION, &key))?;

        let principal = non_empty(OPERATION, &key, &integration, attr::IAM_ROLE_ARN)?;
        let external_id = non_empty(OPERATION, &key, &integration, attr::EXTERNAL_ID)?;
        debug!(principal = %principal, "Provider integration trust pair resolved");

        let trust = PolicyDocument::provider_trust(principal, external_id);
        let role = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::Trust(LinkingRole::StreamingAccess),
                &self.role_spec(&identity, &trust),
            )
            .await?;

        self.attach_access_policy(ctx, OPERATION, LinkingRole::StreamingAccess, &role)
            .await
    }

    /// Kafka topic and Tableflow topic per dataset. Datasets are independent
    /// so their applies run concurrently; registration stays sequential.
    pub(super) async fn replicate_datasets(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        const OPERATION: &str = "replicate_datasets";

        let environment_id = ctx.registry.require(OPERATION, &ResourceKey::Environment)?.id.clone();
        let cluster = ctx.registry.require(OPERATION, &ResourceKey::KafkaCluster)?.clone();
        let rest_endpoint = ctx
            .registry
            .require_attr(OPERATION, &ResourceKey::KafkaCluster, attr::REST_ENDPOINT)?
            .to_string();
        let bucket = ctx.registry.require(OPERATION, &ResourceKey::Bucket)?.name.clone();
        let integration_id = ctx
            .registry
            .require(OPERATION, &ResourceKey::ProviderIntegration)?
            .id
            .clone();
        let kafka_key = ctx.registry.require(OPERATION, &ResourceKey::KafkaApiKey)?.id.clone();
        let tableflow_key = ctx.registry.require(OPERATION, &ResourceKey::TableflowApiKey)?.id.clone();
        let kafka_secret = self.require_output(ctx, OPERATION, keys::KAFKA_API_SECRET)?;
        let tableflow_secret = self.require_output(ctx, OPERATION, keys::TABLEFLOW_API_SECRET)?;

        let topics: Vec<ResourceSpec> = self
            .config
            .datasets
            .iter()
            .map(|dataset| {
                self.spec(ResourceKind::KafkaTopic, dataset)
                    .property("rest_endpoint", rest_endpoint.as_str())
                    .property("cluster_id", cluster.id.as_str())
                    .property("partitions", 1)
                    .property("config", json!({ "cleanup.policy": "compact" }))
                    .sensitive("api_key", kafka_key.as_str())
                    .sensitive("api_secret", kafka_secret.as_str())
            })
            .collect();
        let applied = self.apply_concurrently(OPERATION, &topics).await?;
        for (dataset, applied) in self.config.datasets.iter().zip(applied) {
            self.record(ctx, ResourceKey::Topic(dataset.clone()), applied.resource, applied.action)?;
        }

        let tableflow_topics: Vec<ResourceSpec> = self
            .config
            .datasets
            .iter()
            .map(|dataset| {
                self.spec(ResourceKind::TableflowTopic, dataset)
                    .property("environment_id", environment_id.as_str())
                    .property("cluster_id", cluster.id.as_str())
                    .property("table_formats", TABLE_FORMATS.to_vec())
                    .property("bucket_name", bucket.as_str())
                    .property("provider_integration_id", integration_id.as_str())
                    .sensitive("api_key", tableflow_key.as_str())
                    .sensitive("api_secret", tableflow_secret.as_str())
            })
            .collect();
        let applied = self.apply_concurrently(OPERATION, &tableflow_topics).await?;
        for (dataset, applied) in self.config.datasets.iter().zip(applied) {
            self.record(
                ctx,
                ResourceKey::TableflowTopic(dataset.clone()),
                applied.resource,
                applied.action,
            )?;
        }

        info!(datasets = self.config.datasets.len(), "Datasets replicated");
        Ok(())
    }

    async fn apply_concurrently(
        &self,
        operation: &'static str,
        specs: &[ResourceSpec],
    ) -> Result<Vec<Applied>, ConvergeError> {
        try_join_all(specs.iter().map(|spec| async move {
            let applied = self
                .platforms
                .for_kind(spec.kind)
                .apply(spec)
                .await
                .map_err(|source| ConvergeError::Platform {
                    operation,
                    kind: spec.kind,
                    name: spec.name.clone(),
                    source,
                })?;
            info!(operation, kind = %spec.kind, name = %spec.name, action = %applied.action, "Converged resource");
            Ok::<_, ConvergeError>(applied)
        }))
        .await
    }

    /// Oracle XStream source connector
    pub(super) async fn cdc_connector(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        const OPERATION: &str = "cdc_connector";
        let rds = &self.config.rds;

        let password = rds
            .cflt_user_password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConvergeError::Config("rds.cfltUserPassword must be set to create the CDC connector".to_string()))?;

        let environment_id = ctx.registry.require(OPERATION, &ResourceKey::Environment)?.id.clone();
        let cluster_id = ctx.registry.require(OPERATION, &ResourceKey::KafkaCluster)?.id.clone();
        let account_id = ctx.registry.require(OPERATION, &ResourceKey::ServiceAccount)?.id.clone();
        // Admin binding must exist before the connector authenticates as the account
        ctx.registry.require(OPERATION, &ResourceKey::EnvironmentAdmin)?;
        let endpoint = ctx
            .registry
            .require_attr(OPERATION, &ResourceKey::Database, attr::ENDPOINT)?;
        let host = endpoint.split(':').next().unwrap_or(endpoint).to_string();

        let name = format!("{}-oracle-cdc-connector-xout", self.prefix());
        let mut config = self.config.connector_defaults()?;
        let overrides = [
            ("name", name.clone()),
            ("topic.prefix", self.config.connector.topic_prefix.clone()),
            ("kafka.auth.mode", "SERVICE_ACCOUNT".to_string()),
            ("kafka.service.account.id", account_id),
            ("auto.restart.on.user.error", "false".to_string()),
            ("database.hostname", host),
            ("database.port", "1521".to_string()),
            ("database.user", rds.cflt_user_name.clone()),
            ("database.dbname", rds.db_name.clone()),
            ("database.service.name", rds.db_name.clone()),
            ("database.out.server.name", rds.xout_server_name.clone()),
            ("database.tls.mode", "disable".to_string()),
            ("database.processor.licenses", "1".to_string()),
            ("table.include.list", self.config.connector.table_include_list.clone()),
            // Flatten change events and keep the operation metadata
            ("transforms", "transform_0".to_string()),
            ("transforms.transform_0.type", "io.debezium.transforms.ExtractNewRecordState".to_string()),
            ("transforms.transform_0.delete.handling.mode", "rewrite".to_string()),
            ("transforms.transform_0.delete.tombstone.handling.mode", "tombstone".to_string()),
            (
                "transforms.transform_0.add.fields",
                "op:operation_type,source.ts_us:operation_time,ts_ns:sortable_sequence".to_string(),
            ),
            ("transforms.transform_0.add.fields.prefix", "db_".to_string()),
        ];
        for (key, value) in overrides {
            config.insert(key.to_string(), Value::String(value));
        }

        self.apply(
            ctx,
            OPERATION,
            ResourceKey::Connector,
            &self
                .spec(ResourceKind::Connector, name)
                .property("environment_id", environment_id)
                .property("cluster_id", cluster_id)
                .property("config", Value::Object(config))
                .sensitive("database.password", password),
        )
        .await?;
        Ok(())
    }

    /// Trust the Unity Catalog master role and the role itself, gated on the
    /// storage credential's external id (or the configured override)
    pub(super) async fn patch_lakehouse_trust(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        const OPERATION: &str = "patch_lakehouse_trust";
        let key = ResourceKey::StorageCredential;

        let registered = ctx.registry.require(OPERATION, &key)?.clone();
        let role = ctx
            .registry
            .require(OPERATION, &ResourceKey::Role(LinkingRole::LakehouseAccess))?
            .clone();
        let self_arn = role.arn.clone().filter(|a| !a.is_empty()).ok_or_else(|| {
            ConvergeError::InvalidPrerequisite {
                operation: OPERATION,
                prerequisite: ResourceKey::Role(LinkingRole::LakehouseAccess).to_string(),
                reason: "role has no ARN".to_string(),
            }
        })?;

        let external_id = match self.config.dbx.external_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let spec = self
                    .spec(ResourceKind::StorageCredential, &registered.name)
                    .property("role_arn", self_arn.as_str());
                let credential = self
                    .lookup(OPERATION, &spec)
                    .await?
                    .ok_or_else(|| ConvergeError::missing(OPERATION, &key))?;
                non_empty(OPERATION, &key, &credential, attr::EXTERNAL_ID)?.to_string()
            }
        };

        let identity = self.identity(LinkingRole::LakehouseAccess);
        let trust = PolicyDocument::lakehouse_trust(
            &self.config.dbx.unity_master_role_arn,
            &self_arn,
            &external_id,
        );
        let patched = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::Trust(LinkingRole::LakehouseAccess),
                &self.role_spec(&identity, &trust),
            )
            .await?;

        self.attach_access_policy(ctx, OPERATION, LinkingRole::LakehouseAccess, &patched)
            .await
    }

    async fn attach_access_policy(
        &self,
        ctx: &mut RunContext<'_>,
        operation: &'static str,
        role: LinkingRole,
        patched: &ResourceRef,
    ) -> Result<(), ConvergeError> {
        let policy_arn = ctx
            .registry
            .require_arn(operation, &ResourceKey::AccessPolicy)?
            .to_string();

        self.apply(
            ctx,
            operation,
            ResourceKey::PolicyAttachment(role),
            &self
                .spec(ResourceKind::RolePolicyAttachment, format!("{}-policy-attach", patched.name))
                .property("role_name", patched.name.as_str())
                .property("policy_arn", policy_arn),
        )
        .await?;
        info!(role = %patched.name, trusted = %role.trusted_platform(), "Linking role handed over");
        Ok(())
    }

    /// Catalog, external location and their grants
    pub(super) async fn catalog(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        const OPERATION: &str = "catalog";
        let p = self.prefix().to_string();

        let application_id = ctx
            .registry
            .require_attr(OPERATION, &ResourceKey::ServicePrincipal, attr::APPLICATION_ID)?
            .to_string();
        let bucket = ctx.registry.require(OPERATION, &ResourceKey::Bucket)?.name.clone();
        let credential = ctx
            .registry
            .require(OPERATION, &ResourceKey::StorageCredential)?
            .name
            .clone();
        // Unity Catalog rejects the credential until the role trusts it
        ctx.registry
            .require(OPERATION, &ResourceKey::Trust(LinkingRole::LakehouseAccess))?;

        let mut catalog_properties: serde_json::Map<String, Value> = self
            .config
            .default_tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        catalog_properties.insert("purpose".to_string(), json!("RDS Oracle CDC Demo"));

        let catalog = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::Catalog,
                &self
                    .spec(ResourceKind::Catalog, format!("{}-rds-cdc-demo", p))
                    .property("comment", format!("{} CDC demo", p))
                    .property("properties", catalog_properties),
            )
            .await?;
        ctx.export(keys::CATALOG_NAME, catalog.name.as_str());

        self.grant(
            ctx,
            OPERATION,
            ResourceKind::Catalog,
            &catalog.name,
            vec![
                (application_id.clone(), vec![ALL_PRIVILEGES]),
                (ACCOUNT_USERS.to_string(), READER_PRIVILEGES.to_vec()),
            ],
        )
        .await?;

        let location = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::ExternalLocation,
                &self
                    .spec(ResourceKind::ExternalLocation, format!("{}-dbx-external-location", p))
                    .property("url", format!("s3://{}/", bucket))
                    .property("credential_name", credential)
                    .property("comment", "Tableflow bucket"),
            )
            .await?;

        self.grant(
            ctx,
            OPERATION,
            ResourceKind::ExternalLocation,
            &location.name,
            vec![(application_id, vec![ALL_PRIVILEGES])],
        )
        .await
    }

    /// Cross-platform catalog integration through the external command triple
    pub(super) async fn catalog_integration(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        const OPERATION: &str = "catalog_integration";

        let workspace_endpoint = self
            .config
            .dbx
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConvergeError::Config("dbx.host or DATABRICKS_HOST must be set".to_string()))?;

        let catalog_name = ctx.registry.require(OPERATION, &ResourceKey::Catalog)?.name.clone();
        let environment_id = ctx.registry.require(OPERATION, &ResourceKey::Environment)?.id.clone();
        let cluster_id = ctx.registry.require(OPERATION, &ResourceKey::KafkaCluster)?.id.clone();
        let client_id = ctx
            .registry
            .require_attr(OPERATION, &ResourceKey::ServicePrincipal, attr::APPLICATION_ID)?
            .to_string();
        let tableflow_key = ctx.registry.require(OPERATION, &ResourceKey::TableflowApiKey)?.id.clone();
        let tableflow_secret = self.require_output(ctx, OPERATION, keys::TABLEFLOW_API_SECRET)?;
        let client_secret = self.require_output(ctx, OPERATION, keys::SERVICE_PRINCIPAL_SECRET)?;

        let op = if ctx.outputs.value(keys::UNITY_INTEGRATION_CATALOG_ID).is_some() {
            CommandOp::Update
        } else {
            CommandOp::Create
        };

        let display_name = format!("{}-create-unity-integration", self.prefix());
        let data = json!({
            "spec": {
                "display_name": display_name.as_str(),
                "suspended": false,
                "config": {
                    "kind": "Unity",
                    "workspace_endpoint": workspace_endpoint,
                    "catalog_name": catalog_name,
                    "client_id": client_id,
                    "client_secret": client_secret,
                },
                "environment": { "id": environment_id },
                "kafka_cluster": { "id": cluster_id },
            }
        });

        let env = BTreeMap::from([
            (
                "INTEGRATION_ID".to_string(),
                ctx.outputs
                    .value(keys::UNITY_INTEGRATION_CATALOG_ID)
                    .unwrap_or_default()
                    .to_string(),
            ),
            ("KAFKA_ID".to_string(), cluster_id),
            ("ENV_ID".to_string(), environment_id),
            ("TABLEFLOW_KEY".to_string(), tableflow_key),
            ("TABLEFLOW_SECRET".to_string(), tableflow_secret),
            ("DATA".to_string(), data.to_string()),
        ]);

        let output = self
            .scripts
            .invoke(&self.config.catalog_integration, op, &env)
            .await
            .map_err(|source| ConvergeError::Script {
                operation: OPERATION,
                source,
            })?;

        info!(op = %op, integration = %output.id, catalog = %catalog_name, "Catalog integration converged");

        ctx.export(keys::UNITY_INTEGRATION_ID, output.id.as_str());
        ctx.export_secret(keys::UNITY_INTEGRATION_OUTPUT, output.raw.as_str());
        // Later updates and the detach address the integration by this id
        ctx.export(keys::UNITY_INTEGRATION_CATALOG_ID, output.id.as_str());

        let action = match op {
            CommandOp::Create => ApplyAction::Created,
            _ => ApplyAction::Updated,
        };
        self.record(
            ctx,
            ResourceKey::CatalogIntegration,
            ResourceRef::new(ResourceKind::CatalogIntegration, display_name, output.id),
            action,
        )?;
        Ok(())
    }

    /// Grant privileges on a Unity Catalog securable
    async fn grant(
        &self,
        ctx: &mut RunContext<'_>,
        operation: &'static str,
        securable: ResourceKind,
        full_name: &str,
        grants: Vec<(String, Vec<&str>)>,
    ) -> Result<(), ConvergeError> {
        let grants: Vec<Value> = grants
            .into_iter()
            .map(|(principal, privileges)| json!({ "principal": principal, "privileges": privileges }))
            .collect();

        self.apply(
            ctx,
            operation,
            ResourceKey::Grants(securable),
            &self
                .spec(ResourceKind::Grants, format!("{}/{}", securable, full_name))
                .property("securable_type", securable.as_str())
                .property("full_name", full_name)
                .property("grants", grants),
        )
        .await?;
        Ok(())
    }

    /// Export a one-time secret on creation; on later runs it must already be
    /// in the outputs because the platform will not hand it out again.
    fn keep_secret(
        &self,
        ctx: &mut RunContext<'_>,
        operation: &'static str,
        resource: &ResourceRef,
        output_key: &str,
    ) -> Result<(), ConvergeError> {
        match resource.attr(attr::SECRET) {
            Some(secret) if !secret.is_empty() => {
                ctx.export_secret(output_key, secret);
                Ok(())
            }
            _ => self.require_output(ctx, operation, output_key).map(|_| ()),
        }
    }

    fn require_output(
        &self,
        ctx: &RunContext<'_>,
        operation: &'static str,
        key: &str,
    ) -> Result<String, ConvergeError> {
        ctx.outputs
            .value(key)
            .map(str::to_string)
            .ok_or_else(|| ConvergeError::missing(operation, key))
    }
}

fn non_empty<'r>(
    operation: &'static str,
    key: &ResourceKey,
    resource: &'r ResourceRef,
    attribute: &str,
) -> Result<&'r str, ConvergeError> {
    match resource.attr(attribute) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConvergeError::InvalidPrerequisite {
            operation,
            prerequisite: key.to_string(),
            reason: format!("'{}' is missing or empty", attribute),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::convergence::config::StackConfig;
    use crate::agents::convergence::outputs::{MemoryOutputs, OutputStore};
    use crate::agents::convergence::testing::Harness;

    fn linkable() -> StackConfig {
        let mut config = StackConfig::default();
        config.enable_link = true;
        config.dbx.host = Some("https://dbc-1.cloud.databricks.com".to_string());
        config.rds.cflt_user_password = Some("cdc-password".to_string());
        config
    }

    #[tokio::test]
    async fn test_streaming_patch_fails_fast_without_integration() {
        let h = Harness::new(linkable());
        let mut outputs = MemoryOutputs::new();
        let mut ctx = RunContext::new("demo", &mut outputs);

        let err = h.coordinator.patch_streaming_trust(&mut ctx).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "patch_streaming_trust: missing prerequisite provider_integration"
        );
        assert!(h.aws.all(ResourceKind::IamRole).is_empty());
    }

    #[tokio::test]
    async fn test_streaming_patch_rejects_empty_external_id() {
        let h = Harness::new(linkable());
        h.seed_role(LinkingRole::StreamingAccess);
        let mut outputs = MemoryOutputs::new();
        let mut ctx = RunContext::new("demo", &mut outputs);

        // An integration that has not been handed its trust pair yet
        let environment = ResourceRef::new(ResourceKind::Environment, "demo-env", "env-1");
        let integration = ResourceRef::new(
            ResourceKind::ProviderIntegration,
            "demo-tableflow-s3-integration",
            "cspi-1",
        )
        .with_attr(attr::IAM_ROLE_ARN, "arn:aws:iam::210987654321:role/tableflow")
        .with_attr(attr::EXTERNAL_ID, "");
        h.streaming.insert(integration.clone(), json!({}));
        ctx.export(
            "demo-tableflow-access-role",
            "arn:aws:iam::123456789012:role/demo-tableflow-access-role",
        );
        ctx.registry.register(ResourceKey::Environment, environment).unwrap();
        ctx.registry.register(ResourceKey::ProviderIntegration, integration).unwrap();

        let err = h.coordinator.patch_streaming_trust(&mut ctx).await.unwrap_err();

        assert!(matches!(err, ConvergeError::InvalidPrerequisite { .. }));
        assert!(err.to_string().contains("external_id"));
        assert!(h.role_policy("demo-tableflow-access-role").is_deny_all());
    }

    #[tokio::test]
    async fn test_streaming_patch_requires_role_arn() {
        let h = Harness::new(linkable());
        let mut outputs = MemoryOutputs::new();
        let mut ctx = RunContext::new("demo", &mut outputs);

        // Integration registered without the role it was created for
        let integration = ResourceRef::new(
            ResourceKind::ProviderIntegration,
            "demo-tableflow-s3-integration",
            "cspi-1",
        );
        ctx.registry.register(ResourceKey::ProviderIntegration, integration).unwrap();

        let err = h.coordinator.patch_streaming_trust(&mut ctx).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "patch_streaming_trust: missing prerequisite demo-tableflow-access-role"
        );
        assert!(h.aws.all(ResourceKind::IamRole).is_empty());
    }

    #[tokio::test]
    async fn test_each_dataset_gets_independent_topics() {
        let mut config = linkable();
        config.datasets = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let h = Harness::new(config);
        let mut outputs = MemoryOutputs::new();

        h.coordinator.converge(&mut outputs).await.unwrap();
        let report = h.coordinator.converge(&mut outputs).await.unwrap();

        let tableflow = h.streaming.all(ResourceKind::TableflowTopic);
        assert_eq!(tableflow.len(), 3);
        let integration = outputs.value(keys::PROVIDER_INTEGRATION_ID).unwrap();
        for topic in &tableflow {
            assert_eq!(topic.properties["bucket_name"], "demo-tableflow-bucket");
            assert_eq!(topic.properties["provider_integration_id"], integration);
            assert_eq!(topic.properties["table_formats"], json!(["ICEBERG", "DELTA"]));
        }
        assert_eq!(h.streaming.all(ResourceKind::KafkaTopic).len(), 3);
        assert!(report.changes.iter().any(|c| c.key == "tableflow_topic[b]"));
    }

    #[tokio::test]
    async fn test_connector_strips_port_and_hides_password() {
        let h = Harness::new(linkable());
        let mut outputs = MemoryOutputs::new();

        h.coordinator.converge(&mut outputs).await.unwrap();
        h.coordinator.converge(&mut outputs).await.unwrap();

        let connector = h
            .streaming
            .stored(ResourceKind::Connector, "demo-oracle-cdc-connector-xout")
            .unwrap();
        let config = &connector.properties["config"];
        assert_eq!(
            config["database.hostname"],
            "demo-rds-oracle-tde.simulated.eu-central-1.rds.amazonaws.com"
        );
        assert_eq!(config["table.include.list"], "ADMIN.*");
        assert!(config.get("database.password").is_none());
    }

    #[tokio::test]
    async fn test_connector_requires_password() {
        let mut config = linkable();
        config.rds.cflt_user_password = None;
        let h = Harness::new(config);
        let mut outputs = MemoryOutputs::new();

        h.coordinator.converge(&mut outputs).await.unwrap();
        let err = h.coordinator.converge(&mut outputs).await.unwrap_err();

        assert!(matches!(err, ConvergeError::Config(_)));
        assert!(h.streaming.all(ResourceKind::Connector).is_empty());
    }

    #[tokio::test]
    async fn test_external_id_override_wins() {
        let mut config = linkable();
        config.dbx.external_id = Some("operator-ext-id".to_string());
        let h = Harness::new(config);
        let mut outputs = MemoryOutputs::new();

        h.coordinator.converge(&mut outputs).await.unwrap();
        h.coordinator.converge(&mut outputs).await.unwrap();

        let policy = h.role_policy("demo-dbx-access-role");
        assert_eq!(policy.external_id().as_deref(), Some("operator-ext-id"));
    }

    #[tokio::test]
    async fn test_lost_secret_is_a_missing_prerequisite() {
        let h = Harness::new(linkable());
        let mut outputs = MemoryOutputs::new();
        h.coordinator.converge(&mut outputs).await.unwrap();
        h.coordinator.converge(&mut outputs).await.unwrap();

        outputs.remove(keys::KAFKA_API_SECRET);
        let err = h.coordinator.converge(&mut outputs).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "streaming_foundation: missing prerequisite confluent_kafka_api_secret"
        );
    }

    #[tokio::test]
    async fn test_catalog_carries_tags_and_purpose() {
        let mut config = linkable();
        config.default_tags.insert("owner".to_string(), "data-platform".to_string());
        let h = Harness::new(config);
        let mut outputs = MemoryOutputs::new();
        h.coordinator.converge(&mut outputs).await.unwrap();
        h.coordinator.converge(&mut outputs).await.unwrap();

        let catalog = h.lakehouse.stored(ResourceKind::Catalog, "demo-rds-cdc-demo").unwrap();
        assert_eq!(catalog.properties["comment"], "demo CDC demo");
        assert_eq!(catalog.properties["properties"]["purpose"], "RDS Oracle CDC Demo");
        assert_eq!(catalog.properties["properties"]["owner"], "data-platform");
    }

    #[tokio::test]
    async fn test_catalog_grants() {
        let h = Harness::new(linkable());
        let mut outputs = MemoryOutputs::new();
        h.coordinator.converge(&mut outputs).await.unwrap();
        h.coordinator.converge(&mut outputs).await.unwrap();

        let grants = h.lakehouse.stored(ResourceKind::Grants, "catalog/demo-rds-cdc-demo").unwrap();
        let assignments = grants.properties["grants"].as_array().unwrap();
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[1]["principal"], ACCOUNT_USERS);
        assert_eq!(assignments[1]["privileges"].as_array().unwrap().len(), 6);

        let location = h
            .lakehouse
            .stored(ResourceKind::ExternalLocation, "demo-dbx-external-location")
            .unwrap();
        assert_eq!(location.properties["url"], "s3://demo-tableflow-bucket/");
        assert_eq!(outputs.value(keys::CATALOG_NAME), Some("demo-rds-cdc-demo"));
    }
}
