//! Foundation pass
//!
//! AWS resources that exist in both stages: networking, the Oracle source
//! database with TDE, the Tableflow bucket and the bucket access policy the
//! linking roles are later attached to. Every step is lookup-or-create, so
//! re-running it against an unchanged account changes nothing.

use serde_json::json;

use super::coordinator::{RunContext, StageCoordinator};
use super::outputs::keys;
use super::policy::PolicyDocument;
use super::types::{ConvergeError, ResourceKey};
use crate::agents::platforms::{attr, ApplyAction, ResourceKind};

const OPERATION: &str = "foundation";

const VPC_CIDR: &str = "172.31.0.0/16";
const SUBNETS: [(&str, char); 2] = [("172.31.60.0/24", 'a'), ("172.31.61.0/24", 'b')];
const ORACLE_PORT: u16 = 1521;

impl StageCoordinator {
    pub(super) async fn run_foundation(&self, ctx: &mut RunContext<'_>) -> Result<(), ConvergeError> {
        let p = self.prefix().to_string();

        // Caller identity is read-only
        let caller_spec = self.spec(ResourceKind::CallerIdentity, "caller");
        let caller = self
            .lookup(OPERATION, &caller_spec)
            .await?
            .ok_or_else(|| ConvergeError::missing(OPERATION, ResourceKey::CallerIdentity))?;
        let caller = self.record(ctx, ResourceKey::CallerIdentity, caller, ApplyAction::Unchanged)?;
        let account_id = caller.attr(attr::ACCOUNT_ID).unwrap_or(caller.id.as_str()).to_string();

        let vpc_id = self.network(ctx, &p).await?;
        let security_group_id = self.security_group(ctx, &p, &vpc_id).await?;
        let kms_key_id = self.database(ctx, &p, &account_id, &security_group_id).await?;

        let bucket = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::Bucket,
                &self.spec(ResourceKind::S3Bucket, format!("{}-tableflow-bucket", p)),
            )
            .await?;

        let policy = PolicyDocument::bucket_access(&bucket.name);
        self.apply(
            ctx,
            OPERATION,
            ResourceKey::AccessPolicy,
            &self
                .spec(ResourceKind::IamPolicy, format!("{}-tableflow-role-policy", p))
                .property("document", policy.to_value())
                .property("description", "Read/write access to the Tableflow bucket"),
        )
        .await?;

        let endpoint = ctx
            .registry
            .require_attr(OPERATION, &ResourceKey::Database, attr::ENDPOINT)?
            .to_string();

        ctx.export(keys::VPC_ID, vpc_id);
        ctx.export(keys::SECURITY_GROUP_ID, security_group_id);
        ctx.export(keys::TDE_KMS_KEY_ID, kms_key_id);
        ctx.export(keys::RDS_ENDPOINT, endpoint);
        ctx.export(keys::TABLEFLOW_BUCKET, bucket.name);

        Ok(())
    }

    /// VPC, gateway, subnets and routes; returns the VPC id
    async fn network(&self, ctx: &mut RunContext<'_>, p: &str) -> Result<String, ConvergeError> {
        let vpc_spec = match self.config.existing_vpc() {
            Some(vpc_id) => self.spec(ResourceKind::Vpc, format!("{}-vpc", p)).property("vpc_id", vpc_id),
            None => self
                .spec(ResourceKind::Vpc, format!("{}-vpc", p))
                .property("cidr_block", VPC_CIDR)
                .property("enable_dns_hostnames", true)
                .property("enable_dns_support", true),
        };
        let vpc = self.apply(ctx, OPERATION, ResourceKey::Vpc, &vpc_spec).await?;

        let gateway = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::InternetGateway,
                &self
                    .spec(ResourceKind::InternetGateway, format!("{}-igw", p))
                    .property("vpc_id", vpc.id.as_str()),
            )
            .await?;

        let mut subnet_ids = Vec::with_capacity(SUBNETS.len());
        for (index, (cidr, zone)) in SUBNETS.iter().enumerate() {
            let number = index as u8 + 1;
            let subnet = self
                .apply(
                    ctx,
                    OPERATION,
                    ResourceKey::Subnet(number),
                    &self
                        .spec(ResourceKind::Subnet, format!("{}-rds-subnet-{}", p, number))
                        .property("vpc_id", vpc.id.as_str())
                        .property("cidr_block", *cidr)
                        .property("availability_zone", format!("{}{}", self.config.region, zone)),
                )
                .await?;
            subnet_ids.push(subnet.id);
        }

        self.apply(
            ctx,
            OPERATION,
            ResourceKey::RouteTable,
            &self
                .spec(ResourceKind::RouteTable, format!("{}-rds-route-table", p))
                .property("vpc_id", vpc.id.as_str())
                .property("gateway_id", gateway.id.as_str())
                .property("subnet_ids", subnet_ids.clone()),
        )
        .await?;

        self.apply(
            ctx,
            OPERATION,
            ResourceKey::DbSubnetGroup,
            &self
                .spec(ResourceKind::DbSubnetGroup, format!("{}-rds-subnet-group", p))
                .property("description", "Subnets for the CDC source database")
                .property("subnet_ids", subnet_ids),
        )
        .await?;

        Ok(vpc.id)
    }

    async fn security_group(
        &self,
        ctx: &mut RunContext<'_>,
        p: &str,
        vpc_id: &str,
    ) -> Result<String, ConvergeError> {
        let group = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::SecurityGroup,
                &self
                    .spec(ResourceKind::SecurityGroup, format!("{}-rds-sg", p))
                    .property("vpc_id", vpc_id)
                    .property("description", "Oracle listener access for the CDC connector")
                    .property(
                        "ingress",
                        json!([{ "protocol": "tcp", "port": ORACLE_PORT, "cidr": "0.0.0.0/0" }]),
                    ),
            )
            .await?;
        Ok(group.id)
    }

    /// TDE key, parameter and option groups and the instance; returns the key id
    async fn database(
        &self,
        ctx: &mut RunContext<'_>,
        p: &str,
        account_id: &str,
        security_group_id: &str,
    ) -> Result<String, ConvergeError> {
        let rds = &self.config.rds;

        let key = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::KmsKey,
                &self
                    .spec(ResourceKind::KmsKey, format!("{}-tde-kms-key", p))
                    .property("description", "Oracle TDE key")
                    .property("policy", PolicyDocument::kms_key_policy(account_id).to_value()),
            )
            .await?;
        let kms_key_id = key.arn.clone().unwrap_or_else(|| key.id.clone());

        let parameter_group = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::DbParameterGroup,
                &self
                    .spec(ResourceKind::DbParameterGroup, format!("{}-rds-parameter-group", p))
                    .property("family", "oracle-ee-19")
                    .property("description", "GoldenGate replication for XStream")
                    .property("parameters", json!({ "enable_goldengate_replication": "TRUE" })),
            )
            .await?;

        let option_group = self
            .apply(
                ctx,
                OPERATION,
                ResourceKey::DbOptionGroup,
                &self
                    .spec(ResourceKind::DbOptionGroup, format!("{}-rds-option-group", p))
                    .property("engine", "oracle-ee")
                    .property("major_engine_version", "19")
                    .property("description", "Transparent data encryption")
                    .property("options", vec!["TDE"]),
            )
            .await?;

        let subnet_group = ctx
            .registry
            .require(OPERATION, &ResourceKey::DbSubnetGroup)?
            .name
            .clone();

        self.apply(
            ctx,
            OPERATION,
            ResourceKey::Database,
            &self
                .spec(ResourceKind::DbInstance, format!("{}-rds-oracle-tde", p))
                .property("engine", "oracle-ee")
                .property("engine_version", rds.engine_version.as_str())
                .property("license_model", "bring-your-own-license")
                .property("instance_class", rds.instance_class.as_str())
                .property("allocated_storage", rds.allocated_storage)
                .property("port", ORACLE_PORT)
                .property("db_name", rds.db_name.as_str())
                .property("master_username", rds.db_username.as_str())
                .property("db_subnet_group", subnet_group)
                .property("parameter_group", parameter_group.name)
                .property("option_group", option_group.name)
                .property("security_group_id", security_group_id)
                .property("kms_key_id", kms_key_id.as_str()),
        )
        .await?;

        Ok(kms_key_id)
    }
}
