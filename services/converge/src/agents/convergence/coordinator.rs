//! Stage Coordinator
//!
//! Decides once per run whether the stack is in `Bootstrap` or `Linked`
//! state and drives the matching sequence:
//!
//! ```text
//! foundation ──► determine_stage ──┬─ Bootstrap ─► deny-all placeholder roles
//!                                  └─ Linked ────► run_link (opt-in)
//! ```
//!
//! The stage is never stored; it is recomputed from what the platforms
//! report each time.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::config::StackConfig;
use super::outputs::{keys, OutputStore, OutputValue};
use super::policy::PolicyDocument;
use super::registry::ResourceRegistry;
use super::types::{ConvergeError, LinkingRole, NamedIdentity, ResourceKey, RunReport, Stage};
use crate::agents::lifecycle::{CommandOp, CommandOutput, ScriptInvoker};
use crate::agents::platforms::{
    attr, ApplyAction, PlatformKind, Platforms, ResourceKind, ResourceRef, ResourceSpec,
};

/// Mutable state of one convergence run
pub struct RunContext<'a> {
    pub registry: ResourceRegistry,
    pub outputs: &'a mut dyn OutputStore,
    pub report: RunReport,
}

impl<'a> RunContext<'a> {
    pub fn new(prefix: &str, outputs: &'a mut dyn OutputStore) -> Self {
        Self {
            registry: ResourceRegistry::new(),
            outputs,
            report: RunReport::new(prefix),
        }
    }

    pub fn export(&mut self, key: &str, value: impl Into<String>) {
        self.outputs.set(key, OutputValue::plain(value));
    }

    pub fn export_secret(&mut self, key: &str, value: impl Into<String>) {
        self.outputs.set(key, OutputValue::secret(value));
    }
}

pub struct StageCoordinator {
    pub(super) config: StackConfig,
    pub(super) platforms: Platforms,
    pub(super) scripts: Arc<dyn ScriptInvoker>,
}

impl StageCoordinator {
    pub fn new(config: StackConfig, platforms: Platforms, scripts: Arc<dyn ScriptInvoker>) -> Self {
        Self {
            config,
            platforms,
            scripts,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub(super) fn prefix(&self) -> &str {
        &self.config.resource_prefix
    }

    pub fn identity(&self, role: LinkingRole) -> NamedIdentity {
        NamedIdentity::new(self.prefix(), role)
    }

    /// Both linking-role identities
    pub fn identities(&self) -> [NamedIdentity; 2] {
        LinkingRole::ALL.map(|role| self.identity(role))
    }

    /// Base spec with the stack's tags and protection applied
    pub(super) fn spec(&self, kind: ResourceKind, name: impl Into<String>) -> ResourceSpec {
        let spec = ResourceSpec::new(kind, name);
        if kind.platform() == PlatformKind::Aws {
            spec.tags(&self.config.default_tags)
                .protect(self.config.protect_resources)
        } else {
            spec
        }
    }

    /// Linking role declaration with the given trust policy
    pub(super) fn role_spec(&self, identity: &NamedIdentity, trust: &PolicyDocument) -> ResourceSpec {
        self.spec(ResourceKind::IamRole, &identity.name)
            .property(attr::ASSUME_ROLE_POLICY, trust.to_value())
            .property("description", format!("{} role", identity.role.purpose()))
            .tag("Purpose", identity.role.purpose())
    }

    /// Converge `spec`, record the outcome and register the result under `key`
    pub(super) async fn apply(
        &self,
        ctx: &mut RunContext<'_>,
        operation: &'static str,
        key: ResourceKey,
        spec: &ResourceSpec,
    ) -> Result<ResourceRef, ConvergeError> {
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

        info!(
            operation,
            key = %key,
            kind = %spec.kind,
            name = %spec.name,
            id = %applied.resource.id,
            action = %applied.action,
            "Converged resource"
        );

        self.record(ctx, key, applied.resource, applied.action)
    }

    /// Record an already converged object
    pub(super) fn record(
        &self,
        ctx: &mut RunContext<'_>,
        key: ResourceKey,
        resource: ResourceRef,
        action: ApplyAction,
    ) -> Result<ResourceRef, ConvergeError> {
        ctx.report
            .record(&key, resource.kind, &resource.name, &resource.id, action);
        ctx.registry.register(key, resource).cloned()
    }

    /// Read-only lookup; a "not found" answer is `None`
    pub(super) async fn lookup(
        &self,
        operation: &'static str,
        spec: &ResourceSpec,
    ) -> Result<Option<ResourceRef>, ConvergeError> {
        match self.platforms.for_kind(spec.kind).lookup(spec).await {
            Ok(found) => Ok(found),
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(ConvergeError::Platform {
                operation,
                kind: spec.kind,
                name: spec.name.clone(),
                source,
            }),
        }
    }

    /// Does the linking role exist? Only "not found" counts as `false`.
    pub async fn probe_role_exists(&self, identity: &NamedIdentity) -> Result<bool, ConvergeError> {
        let spec = ResourceSpec::new(ResourceKind::IamRole, &identity.name);

        match self.platforms.aws.lookup(&spec).await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => {
                info!(role = %identity, "Role does not exist yet");
                Ok(false)
            }
            Err(e) if e.is_not_found() => {
                info!(role = %identity, "Role does not exist yet");
                Ok(false)
            }
            Err(source) => Err(ConvergeError::Platform {
                operation: "probe_role_exists",
                kind: ResourceKind::IamRole,
                name: identity.name.clone(),
                source,
            }),
        }
    }

    /// `Linked` only when both linking roles exist
    pub async fn determine_stage(&self) -> Result<Stage, ConvergeError> {
        let mut present = 0;
        for identity in self.identities() {
            if self.probe_role_exists(&identity).await? {
                present += 1;
            }
        }

        let stage = if present == LinkingRole::ALL.len() {
            Stage::Linked
        } else {
            Stage::Bootstrap
        };
        info!(stage = %stage, roles_present = present, "Determined stage");
        Ok(stage)
    }

    /// Reserve both role ARNs with deny-all placeholders.
    ///
    /// A role that already exists is left exactly as it is.
    pub async fn run_bootstrap(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        let placeholder = PolicyDocument::deny_all_trust();

        for identity in self.identities() {
            let spec = self.role_spec(&identity, &placeholder);
            let key = ResourceKey::Role(identity.role);

            let role = match self.lookup("run_bootstrap", &spec).await? {
                Some(existing) => {
                    info!(role = %identity, "Placeholder role already exists, leaving it untouched");
                    self.record(ctx, key, existing, ApplyAction::Unchanged)?
                }
                None => self.apply(ctx, "run_bootstrap", key, &spec).await?,
            };

            self.export_role_arn(ctx, &identity, &role)?;
        }

        Ok(())
    }

    /// Register both existing linking roles for the stage-two steps
    pub(super) async fn adopt_roles(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        for identity in self.identities() {
            let spec = ResourceSpec::new(ResourceKind::IamRole, &identity.name);
            let role = self
                .lookup("adopt_roles", &spec)
                .await?
                .ok_or_else(|| ConvergeError::missing("adopt_roles", &identity))?;
            let role = self.record(ctx, ResourceKey::Role(identity.role), role, ApplyAction::Unchanged)?;
            self.export_role_arn(ctx, &identity, &role)?;
        }
        Ok(())
    }

    fn export_role_arn(
        &self,
        ctx: &mut RunContext<'_>,
        identity: &NamedIdentity,
        role: &ResourceRef,
    ) -> Result<(), ConvergeError> {
        let arn = role.arn.as_deref().filter(|a| !a.is_empty()).ok_or_else(|| {
            ConvergeError::InvalidPrerequisite {
                operation: "export_role_arn",
                prerequisite: identity.name.clone(),
                reason: "role has no ARN".to_string(),
            }
        })?;
        ctx.export(&identity.name, arn);
        Ok(())
    }

    /// Run one full convergence pass. Outputs are persisted even when the
    /// run fails so secrets handed out once are never lost.
    pub async fn converge(&self, outputs: &mut dyn OutputStore) -> Result<RunReport, ConvergeError> {
        self.config.validate()?;

        let mut ctx = RunContext::new(self.prefix(), outputs);
        let result = self.converge_in(&mut ctx).await;
        ctx.outputs.persist()?;
        result?;

        ctx.report.finish();
        info!(
            run_id = %ctx.report.run_id,
            created = ctx.report.count(ApplyAction::Created),
            updated = ctx.report.count(ApplyAction::Updated),
            unchanged = ctx.report.count(ApplyAction::Unchanged),
            "Convergence run complete"
        );
        Ok(ctx.report)
    }

    async fn converge_in(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        self.run_foundation(ctx).await?;

        let stage = self.determine_stage().await?;
        ctx.report.stage = Some(stage);

        match stage {
            Stage::Bootstrap => self.run_bootstrap(ctx).await,
            Stage::Linked if self.config.enable_link => {
                self.adopt_roles(ctx).await?;
                self.run_link(ctx).await?;
                ctx.report.linked = true;
                Ok(())
            }
            Stage::Linked => {
                info!("Both linking roles exist; stage two runs only with enableLink");
                self.adopt_roles(ctx).await
            }
        }
    }

    /// Remove the catalog integration through the delete command
    pub async fn detach_catalog(&self, outputs: &mut dyn OutputStore) -> Result<CommandOutput, ConvergeError> {
        const OPERATION: &str = "detach_catalog";

        let required = |key: &str| -> Result<String, ConvergeError> {
            outputs
                .value(key)
                .map(str::to_string)
                .ok_or_else(|| ConvergeError::missing(OPERATION, key))
        };

        let integration_id = required(keys::UNITY_INTEGRATION_CATALOG_ID)?;
        let env = BTreeMap::from([
            ("INTEGRATION_ID".to_string(), integration_id.clone()),
            ("ENV_ID".to_string(), required(keys::CONFLUENT_ENVIRONMENT_ID)?),
            ("KAFKA_ID".to_string(), required(keys::CONFLUENT_CLUSTER_ID)?),
            ("TABLEFLOW_KEY".to_string(), required(keys::TABLEFLOW_API_KEY)?),
            ("TABLEFLOW_SECRET".to_string(), required(keys::TABLEFLOW_API_SECRET)?),
        ]);

        let output = self
            .scripts
            .invoke(&self.config.catalog_integration, CommandOp::Delete, &env)
            .await
            .map_err(|source| ConvergeError::Script {
                operation: OPERATION,
                source,
            })?;

        for key in [
            keys::UNITY_INTEGRATION_ID,
            keys::UNITY_INTEGRATION_OUTPUT,
            keys::UNITY_INTEGRATION_CATALOG_ID,
        ] {
            outputs.remove(key);
        }
        outputs.persist()?;

        warn!(integration = %integration_id, "Catalog integration removed");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::convergence::outputs::MemoryOutputs;
    use crate::agents::convergence::testing::Harness;
    use crate::agents::lifecycle::CommandOp;

    #[tokio::test]
    async fn test_stage_bootstrap_when_no_role_exists() {
        let h = Harness::new(StackConfig::default());
        assert_eq!(h.coordinator.determine_stage().await.unwrap(), Stage::Bootstrap);
    }

    #[tokio::test]
    async fn test_stage_bootstrap_when_one_role_exists() {
        let h = Harness::new(StackConfig::default());
        h.seed_role(LinkingRole::StreamingAccess);
        assert_eq!(h.coordinator.determine_stage().await.unwrap(), Stage::Bootstrap);

        let h = Harness::new(StackConfig::default());
        h.seed_role(LinkingRole::LakehouseAccess);
        assert_eq!(h.coordinator.determine_stage().await.unwrap(), Stage::Bootstrap);
    }

    #[tokio::test]
    async fn test_stage_linked_when_both_roles_exist() {
        let h = Harness::new(StackConfig::default());
        h.seed_role(LinkingRole::StreamingAccess);
        h.seed_role(LinkingRole::LakehouseAccess);
        assert_eq!(h.coordinator.determine_stage().await.unwrap(), Stage::Linked);
    }

    #[tokio::test]
    async fn test_not_found_errors_are_negative_probes() {
        let h = Harness::with_not_found_errors(StackConfig::default());
        let identity = h.coordinator.identity(LinkingRole::StreamingAccess);

        assert!(!h.coordinator.probe_role_exists(&identity).await.unwrap());
        assert_eq!(h.coordinator.determine_stage().await.unwrap(), Stage::Bootstrap);
    }

    #[tokio::test]
    async fn test_other_probe_failures_propagate() {
        let h = Harness::new(StackConfig::default());
        h.aws.fail_lookups("AccessDenied");

        let err = h.coordinator.determine_stage().await.unwrap_err();
        match err {
            ConvergeError::Platform { operation, .. } => assert_eq!(operation, "probe_role_exists"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_twice_keeps_one_role_per_identity() {
        let h = Harness::new(StackConfig::default());
        let mut outputs = MemoryOutputs::new();

        for _ in 0..2 {
            let mut ctx = RunContext::new("demo", &mut outputs);
            h.coordinator.run_bootstrap(&mut ctx).await.unwrap();
        }

        assert_eq!(h.aws.created(ResourceKind::IamRole), 2);
        assert_eq!(h.aws.all(ResourceKind::IamRole).len(), 2);
        assert!(outputs.value("demo-tableflow-access-role").is_some());
        assert!(outputs.value("demo-dbx-access-role").is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_leaves_existing_role_untouched() {
        let h = Harness::new(StackConfig::default());
        h.seed_role(LinkingRole::StreamingAccess);
        let mut outputs = MemoryOutputs::new();
        let mut ctx = RunContext::new("demo", &mut outputs);

        h.coordinator.run_bootstrap(&mut ctx).await.unwrap();

        let seeded = h.aws.stored(ResourceKind::IamRole, "demo-tableflow-access-role").unwrap();
        assert_eq!(seeded.revision, 0);
        assert_eq!(h.aws.created(ResourceKind::IamRole), 1);
        assert_eq!(ctx.report.count(ApplyAction::Unchanged), 1);
    }

    #[tokio::test]
    async fn test_placeholders_deny_everyone() {
        let h = Harness::new(StackConfig::default());
        let mut outputs = MemoryOutputs::new();

        let report = h.coordinator.converge(&mut outputs).await.unwrap();

        assert_eq!(report.stage, Some(Stage::Bootstrap));
        assert!(!report.linked);
        for identity in h.coordinator.identities() {
            let policy = h.role_policy(&identity.name);
            assert!(policy.is_deny_all());
        }
        assert_eq!(outputs.persist_count(), 1);
        assert!(outputs.value(keys::VPC_ID).is_some());
    }

    #[tokio::test]
    async fn test_linked_without_opt_in_does_not_link() {
        let h = Harness::new(StackConfig::default());
        let mut outputs = MemoryOutputs::new();

        h.coordinator.converge(&mut outputs).await.unwrap();
        let second = h.coordinator.converge(&mut outputs).await.unwrap();

        assert_eq!(second.stage, Some(Stage::Linked));
        assert!(!second.linked);
        assert!(h.streaming.all(ResourceKind::Environment).is_empty());
        assert_eq!(h.aws.created(ResourceKind::IamRole), 2);
    }

    #[tokio::test]
    async fn test_two_stage_handshake_closes() {
        let mut config = StackConfig::default();
        config.enable_link = true;
        config.dbx.host = Some("https://dbc-1.cloud.databricks.com".to_string());
        config.rds.cflt_user_password = Some("cdc-password".to_string());
        let h = Harness::new(config);
        let mut outputs = MemoryOutputs::new();

        let first = h.coordinator.converge(&mut outputs).await.unwrap();
        let second = h.coordinator.converge(&mut outputs).await.unwrap();

        assert_eq!(first.stage, Some(Stage::Bootstrap));
        assert_eq!(second.stage, Some(Stage::Linked));
        assert!(second.linked);

        // Streaming role trusts exactly what the provider integration hands out
        let integration = h
            .streaming
            .stored(ResourceKind::ProviderIntegration, "demo-tableflow-s3-integration")
            .unwrap()
            .reference;
        let streaming_policy = h.role_policy("demo-tableflow-access-role");
        assert_eq!(
            streaming_policy.trusted_principals(),
            vec![integration.attr(attr::IAM_ROLE_ARN).unwrap().to_string()]
        );
        assert_eq!(
            streaming_policy.external_id().as_deref(),
            integration.attr(attr::EXTERNAL_ID)
        );

        // Lakehouse role trusts the master role and itself, gated on the credential's external id
        let credential = h
            .lakehouse
            .stored(ResourceKind::StorageCredential, "demo-dbx-storage-creds")
            .unwrap()
            .reference;
        let lakehouse_policy = h.role_policy("demo-dbx-access-role");
        let lakehouse_role = h.aws.stored(ResourceKind::IamRole, "demo-dbx-access-role").unwrap();
        assert!(lakehouse_policy
            .trusted_principals()
            .contains(&h.coordinator.config().dbx.unity_master_role_arn));
        assert!(lakehouse_policy
            .trusted_principals()
            .contains(&lakehouse_role.reference.arn.clone().unwrap()));
        assert_eq!(
            lakehouse_policy.external_id().as_deref(),
            credential.attr(attr::EXTERNAL_ID)
        );

        // Placeholders were patched, never recreated
        assert_eq!(h.aws.created(ResourceKind::IamRole), 2);
        assert_eq!(h.aws.created(ResourceKind::RolePolicyAttachment), 2);

        // Catalog integration created through the script boundary
        let calls = h.scripts.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, CommandOp::Create);
        assert!(outputs.value(keys::UNITY_INTEGRATION_ID).is_some());
    }

    #[tokio::test]
    async fn test_third_run_updates_catalog_integration() {
        let mut config = StackConfig::default();
        config.enable_link = true;
        config.dbx.host = Some("https://dbc-1.cloud.databricks.com".to_string());
        config.rds.cflt_user_password = Some("cdc-password".to_string());
        let h = Harness::new(config);
        let mut outputs = MemoryOutputs::new();

        for _ in 0..3 {
            h.coordinator.converge(&mut outputs).await.unwrap();
        }

        let calls = h.scripts.calls();
        let ops: Vec<CommandOp> = calls.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![CommandOp::Create, CommandOp::Update]);

        // Create starts without an id; update targets the id create printed
        assert_eq!(calls[0].env["INTEGRATION_ID"], "");
        assert_eq!(calls[1].env["INTEGRATION_ID"], "tci-sim0001");
        assert_eq!(outputs.value(keys::UNITY_INTEGRATION_CATALOG_ID), Some("tci-sim0001"));
        let data: serde_json::Value = serde_json::from_str(&calls[1].env["DATA"]).unwrap();
        assert_eq!(data["spec"]["display_name"], "demo-create-unity-integration");
        assert_eq!(data["spec"]["config"]["catalog_name"], "demo-rds-cdc-demo");
        assert_eq!(h.streaming.created(ResourceKind::ApiKey), 2);
        assert_eq!(h.lakehouse.created(ResourceKind::Catalog), 1);
    }

    #[tokio::test]
    async fn test_platform_failure_aborts_but_keeps_outputs() {
        let mut config = StackConfig::default();
        config.enable_link = true;
        config.dbx.host = Some("https://dbc-1.cloud.databricks.com".to_string());
        config.rds.cflt_user_password = Some("cdc-password".to_string());
        let h = Harness::new(config);
        let mut outputs = MemoryOutputs::new();
        h.coordinator.converge(&mut outputs).await.unwrap();

        h.lakehouse.fail_on(ResourceKind::Catalog, "PERMISSION_DENIED: not a metastore admin");
        let err = h.coordinator.converge(&mut outputs).await.unwrap_err();

        assert!(err.to_string().contains("PERMISSION_DENIED"));
        assert!(err.to_string().contains("demo-rds-cdc-demo"));
        // Secrets handed out before the failure were still persisted
        assert!(outputs.value(keys::KAFKA_API_SECRET).is_some());
        assert_eq!(outputs.persist_count(), 2);
        assert!(h.scripts.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_script_output_fails_the_run() {
        let mut config = StackConfig::default();
        config.enable_link = true;
        config.dbx.host = Some("https://dbc-1.cloud.databricks.com".to_string());
        config.rds.cflt_user_password = Some("cdc-password".to_string());
        let h = Harness::new(config);
        h.scripts.respond(CommandOp::Create, r#"{"status":"ok"}"#);
        let mut outputs = MemoryOutputs::new();

        h.coordinator.converge(&mut outputs).await.unwrap();
        let err = h.coordinator.converge(&mut outputs).await.unwrap_err();

        assert!(matches!(err, ConvergeError::Script { .. }));
        assert!(outputs.value(keys::UNITY_INTEGRATION_ID).is_none());
    }

    #[tokio::test]
    async fn test_detach_catalog() {
        let mut config = StackConfig::default();
        config.enable_link = true;
        config.dbx.host = Some("https://dbc-1.cloud.databricks.com".to_string());
        config.rds.cflt_user_password = Some("cdc-password".to_string());
        let h = Harness::new(config);
        let mut outputs = MemoryOutputs::new();

        let err = h.coordinator.detach_catalog(&mut outputs).await.unwrap_err();
        assert!(matches!(err, ConvergeError::MissingPrerequisite { .. }));

        h.coordinator.converge(&mut outputs).await.unwrap();
        h.coordinator.converge(&mut outputs).await.unwrap();
        let integration_id = outputs.value(keys::UNITY_INTEGRATION_CATALOG_ID).unwrap().to_string();

        h.coordinator.detach_catalog(&mut outputs).await.unwrap();

        let delete = h.scripts.calls().pop().unwrap();
        assert_eq!(delete.op, CommandOp::Delete);
        assert_eq!(delete.env["INTEGRATION_ID"], integration_id);
        assert!(outputs.value(keys::UNITY_INTEGRATION_CATALOG_ID).is_none());
        assert!(outputs.value(keys::UNITY_INTEGRATION_ID).is_none());
    }
}
