//! AWS Platform
//!
//! Drives IAM, EC2 networking, KMS, RDS and S3 through the `aws` CLI so the
//! standard credential chain (env vars, profiles, SSO, instance roles) applies
//! without any credential handling here. Every call runs with
//! `--output json` and the configured region.
//!
//! Networking objects are found by their `Name` tag, IAM and RDS objects by
//! name, KMS keys by `alias/{name}`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::types::{
    attr, Applied, PlatformError, PlatformKind, ResourceKind, ResourceRef, ResourceSpec,
};
use super::Platform;

/// AWS adapter backed by the `aws` CLI
pub struct AwsCliPlatform {
    region: String,
    profile: Option<String>,
    binary: String,
    account_id: OnceCell<String>,
}

impl AwsCliPlatform {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            profile: None,
            binary: "aws".to_string(),
            account_id: OnceCell::new(),
        }
    }

    /// Use a named CLI profile instead of the default chain
    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile.filter(|p| !p.is_empty());
        self
    }

    /// Use a specific `aws` executable instead of the one on `PATH`
    pub fn with_binary(mut self, binary: Option<String>) -> Self {
        if let Some(binary) = binary.filter(|b| !b.is_empty()) {
            self.binary = binary;
        }
        self
    }

    /// Run one CLI call and decode its JSON output
    async fn run(&self, kind: ResourceKind, name: &str, args: &[&str]) -> Result<Value, PlatformError> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .args(["--region", self.region.as_str(), "--output", "json"]);
        if let Some(profile) = &self.profile {
            command.args(["--profile", profile.as_str()]);
        }

        debug!(service = args.first().copied().unwrap_or_default(), operation = args.get(1).copied().unwrap_or_default(), "aws cli call");

        let output = command
            .output()
            .await
            .map_err(|e| PlatformError::Transport(format!("failed to run aws CLI: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_error(kind, name, stderr.trim()));
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| PlatformError::Decode(format!("aws {}: {}", args.join(" "), e)))
    }

    /// Like `run`, but a missing object yields `None`
    async fn probe(&self, kind: ResourceKind, name: &str, args: &[&str]) -> Result<Option<Value>, PlatformError> {
        match self.run(kind, name, args).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn account_id(&self) -> Result<&str, PlatformError> {
        self.account_id
            .get_or_try_init(|| async {
                let identity = self
                    .run(ResourceKind::CallerIdentity, "self", &["sts", "get-caller-identity"])
                    .await?;
                str_at(&identity, "/Account")
                    .map(str::to_string)
                    .ok_or_else(|| PlatformError::Decode("caller identity without Account".to_string()))
            })
            .await
            .map(String::as_str)
    }

    async fn find(&self, spec: &ResourceSpec) -> Result<Option<ResourceRef>, PlatformError> {
        let kind = spec.kind;
        let name = spec.name.as_str();

        match kind {
            ResourceKind::CallerIdentity => {
                let account = self.account_id().await?;
                Ok(Some(
                    ResourceRef::new(kind, name, account).with_attr(attr::ACCOUNT_ID, account),
                ))
            }
            ResourceKind::Vpc => {
                let found = match spec.str_prop("vpc_id") {
                    Some(vpc_id) => self.probe(kind, name, &["ec2", "describe-vpcs", "--vpc-ids", vpc_id]).await?,
                    None => {
                        let filter = name_filter(name);
                        self.probe(kind, name, &["ec2", "describe-vpcs", "--filters", &filter]).await?
                    }
                };
                Ok(found
                    .as_ref()
                    .and_then(|v| str_at(v, "/Vpcs/0/VpcId"))
                    .map(|id| ResourceRef::new(kind, name, id)))
            }
            ResourceKind::InternetGateway => {
                let filter = match spec.str_prop("vpc_id") {
                    Some(vpc_id) => format!("Name=attachment.vpc-id,Values={}", vpc_id),
                    None => name_filter(name),
                };
                let found = self
                    .run(kind, name, &["ec2", "describe-internet-gateways", "--filters", &filter])
                    .await?;
                Ok(str_at(&found, "/InternetGateways/0/InternetGatewayId")
                    .map(|id| ResourceRef::new(kind, name, id)))
            }
            ResourceKind::Subnet => {
                let filter = name_filter(name);
                let found = self
                    .run(kind, name, &["ec2", "describe-subnets", "--filters", &filter])
                    .await?;
                Ok(str_at(&found, "/Subnets/0/SubnetId").map(|id| ResourceRef::new(kind, name, id)))
            }
            ResourceKind::RouteTable => {
                let filter = name_filter(name);
                let found = self
                    .run(kind, name, &["ec2", "describe-route-tables", "--filters", &filter])
                    .await?;
                Ok(str_at(&found, "/RouteTables/0/RouteTableId")
                    .map(|id| ResourceRef::new(kind, name, id)))
            }
            ResourceKind::SecurityGroup => {
                let filter = format!("Name=group-name,Values={}", name);
                let found = self
                    .run(kind, name, &["ec2", "describe-security-groups", "--filters", &filter])
                    .await?;
                Ok(str_at(&found, "/SecurityGroups/0/GroupId")
                    .map(|id| ResourceRef::new(kind, name, id)))
            }
            ResourceKind::DbSubnetGroup => {
                let found = self
                    .probe(kind, name, &["rds", "describe-db-subnet-groups", "--db-subnet-group-name", name])
                    .await?;
                Ok(found.as_ref().and_then(|v| {
                    arn_ref(kind, name, name, str_at(v, "/DBSubnetGroups/0/DBSubnetGroupArn"))
                }))
            }
            ResourceKind::DbParameterGroup => {
                let found = self
                    .probe(kind, name, &["rds", "describe-db-parameter-groups", "--db-parameter-group-name", name])
                    .await?;
                Ok(found.as_ref().and_then(|v| {
                    arn_ref(kind, name, name, str_at(v, "/DBParameterGroups/0/DBParameterGroupArn"))
                }))
            }
            ResourceKind::DbOptionGroup => {
                let found = self
                    .probe(kind, name, &["rds", "describe-option-groups", "--option-group-name", name])
                    .await?;
                Ok(found.as_ref().and_then(|v| {
                    arn_ref(kind, name, name, str_at(v, "/OptionGroupsList/0/OptionGroupArn"))
                }))
            }
            ResourceKind::DbInstance => {
                let found = self
                    .probe(kind, name, &["rds", "describe-db-instances", "--db-instance-identifier", name])
                    .await?;
                Ok(found.as_ref().and_then(|v| db_instance_ref(name, v)))
            }
            ResourceKind::KmsKey => {
                let alias = format!("alias/{}", name);
                let found = self.probe(kind, name, &["kms", "describe-key", "--key-id", &alias]).await?;
                Ok(found.as_ref().and_then(|v| {
                    str_at(v, "/KeyMetadata/KeyId").map(|id| {
                        let mut r = ResourceRef::new(kind, name, id);
                        r.arn = str_at(v, "/KeyMetadata/Arn").map(str::to_string);
                        r
                    })
                }))
            }
            ResourceKind::S3Bucket => {
                let found = self.probe(kind, name, &["s3api", "head-bucket", "--bucket", name]).await?;
                Ok(found.map(|_| ResourceRef::new(kind, name, name).with_arn(format!("arn:aws:s3:::{}", name))))
            }
            ResourceKind::IamPolicy => {
                let arn = format!("arn:aws:iam::{}:policy/{}", self.account_id().await?, name);
                let found = self.probe(kind, name, &["iam", "get-policy", "--policy-arn", &arn]).await?;
                Ok(found.as_ref().and_then(|v| {
                    str_at(v, "/Policy/PolicyId").map(|id| {
                        let mut r = ResourceRef::new(kind, name, id).with_arn(&arn);
                        if let Some(version) = str_at(v, "/Policy/DefaultVersionId") {
                            r = r.with_attr("default_version_id", version);
                        }
                        r
                    })
                }))
            }
            ResourceKind::IamRole => {
                let found = self.probe(kind, name, &["iam", "get-role", "--role-name", name]).await?;
                Ok(found.as_ref().and_then(|v| {
                    str_at(v, "/Role/RoleId").map(|id| {
                        let mut r = ResourceRef::new(kind, name, id);
                        r.arn = str_at(v, "/Role/Arn").map(str::to_string);
                        if let Some(policy) = v.pointer("/Role/AssumeRolePolicyDocument") {
                            r = r.with_attr(attr::ASSUME_ROLE_POLICY, policy.to_string());
                        }
                        r
                    })
                }))
            }
            ResourceKind::RolePolicyAttachment => {
                let role = spec.require_str("role_name")?;
                let policy_arn = spec.require_str("policy_arn")?;
                let found = self
                    .run(kind, name, &["iam", "list-attached-role-policies", "--role-name", role])
                    .await?;
                let attached = found
                    .pointer("/AttachedPolicies")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().any(|p| str_at(p, "/PolicyArn") == Some(policy_arn)))
                    .unwrap_or(false);
                Ok(attached.then(|| ResourceRef::new(kind, name, format!("{}/{}", role, policy_arn))))
            }
            other => Err(PlatformError::Unsupported {
                platform: PlatformKind::Aws,
                kind: other,
            }),
        }
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef, PlatformError> {
        let kind = spec.kind;
        let name = spec.name.as_str();

        match kind {
            ResourceKind::Vpc => {
                if let Some(vpc_id) = spec.str_prop("vpc_id") {
                    // An explicitly referenced VPC is never created on our behalf
                    return Err(PlatformError::NotFound {
                        kind,
                        name: vpc_id.to_string(),
                    });
                }
                let cidr = spec.require_str("cidr_block")?;
                let tags = tag_specification("vpc", spec);
                let created = self
                    .run(kind, name, &["ec2", "create-vpc", "--cidr-block", cidr, "--tag-specifications", &tags])
                    .await?;
                let id = required_at(&created, "/Vpc/VpcId")?;
                // EC2 accepts one attribute per modify call
                for flag in vpc_dns_flags(spec) {
                    self.run(kind, name, &["ec2", "modify-vpc-attribute", "--vpc-id", id, flag, r#"{"Value":true}"#])
                        .await?;
                }
                Ok(ResourceRef::new(kind, name, id))
            }
            ResourceKind::InternetGateway => {
                let vpc_id = spec.require_str("vpc_id")?;
                let tags = tag_specification("internet-gateway", spec);
                let created = self
                    .run(kind, name, &["ec2", "create-internet-gateway", "--tag-specifications", &tags])
                    .await?;
                let id = required_at(&created, "/InternetGateway/InternetGatewayId")?;
                self.run(kind, name, &["ec2", "attach-internet-gateway", "--internet-gateway-id", id, "--vpc-id", vpc_id])
                    .await?;
                Ok(ResourceRef::new(kind, name, id))
            }
            ResourceKind::Subnet => {
                let tags = tag_specification("subnet", spec);
                let created = self
                    .run(kind, name, &[
                        "ec2", "create-subnet",
                        "--vpc-id", spec.require_str("vpc_id")?,
                        "--cidr-block", spec.require_str("cidr_block")?,
                        "--availability-zone", spec.require_str("availability_zone")?,
                        "--tag-specifications", &tags,
                    ])
                    .await?;
                let id = required_at(&created, "/Subnet/SubnetId")?;
                Ok(ResourceRef::new(kind, name, id))
            }
            ResourceKind::RouteTable => {
                let tags = tag_specification("route-table", spec);
                let created = self
                    .run(kind, name, &["ec2", "create-route-table", "--vpc-id", spec.require_str("vpc_id")?, "--tag-specifications", &tags])
                    .await?;
                let id = required_at(&created, "/RouteTable/RouteTableId")?;
                self.run(kind, name, &[
                    "ec2", "create-route",
                    "--route-table-id", id,
                    "--destination-cidr-block", "0.0.0.0/0",
                    "--gateway-id", spec.require_str("gateway_id")?,
                ])
                .await?;
                for subnet in spec.str_list("subnet_ids") {
                    self.run(kind, name, &["ec2", "associate-route-table", "--route-table-id", id, "--subnet-id", &subnet])
                        .await?;
                }
                Ok(ResourceRef::new(kind, name, id))
            }
            ResourceKind::SecurityGroup => {
                let tags = tag_specification("security-group", spec);
                let description = spec.str_prop("description").unwrap_or(name);
                let created = self
                    .run(kind, name, &[
                        "ec2", "create-security-group",
                        "--group-name", name,
                        "--description", description,
                        "--vpc-id", spec.require_str("vpc_id")?,
                        "--tag-specifications", &tags,
                    ])
                    .await?;
                let id = required_at(&created, "/GroupId")?;
                let permissions = ingress_permissions(spec);
                if permissions != json!([]) {
                    self.run(kind, name, &[
                        "ec2", "authorize-security-group-ingress",
                        "--group-id", id,
                        "--ip-permissions", &permissions.to_string(),
                    ])
                    .await?;
                }
                Ok(ResourceRef::new(kind, name, id))
            }
            ResourceKind::DbSubnetGroup => {
                let description = spec.str_prop("description").unwrap_or(name);
                let subnets = spec.str_list("subnet_ids");
                let tags = key_value_tags(&spec.tags);
                let mut args = vec![
                    "rds", "create-db-subnet-group",
                    "--db-subnet-group-name", name,
                    "--db-subnet-group-description", description,
                    "--tags", tags.as_str(),
                    "--subnet-ids",
                ];
                args.extend(subnets.iter().map(String::as_str));
                let created = self.run(kind, name, &args).await?;
                arn_ref(kind, name, name, str_at(&created, "/DBSubnetGroup/DBSubnetGroupArn"))
                    .ok_or_else(|| missing_field("DBSubnetGroupArn"))
            }
            ResourceKind::KmsKey => {
                let policy = spec
                    .get("policy")
                    .map(Value::to_string)
                    .ok_or_else(|| invalid(spec, "missing property 'policy'"))?;
                let description = spec.str_prop("description").unwrap_or(name);
                let tags = kms_tags(&spec.tags);
                let created = self
                    .run(kind, name, &["kms", "create-key", "--description", description, "--policy", &policy, "--tags", &tags])
                    .await?;
                let id = required_at(&created, "/KeyMetadata/KeyId")?;
                let alias = format!("alias/{}", name);
                if let Err(e) = self
                    .run(kind, name, &["kms", "create-alias", "--alias-name", &alias, "--target-key-id", id])
                    .await
                {
                    // Without its alias the key is invisible to the next lookup
                    warn!(key_id = %id, alias = %alias, "Alias creation failed, scheduling key deletion");
                    self.run(kind, name, &["kms", "schedule-key-deletion", "--key-id", id, "--pending-window-in-days", "7"])
                        .await?;
                    return Err(e);
                }
                let mut r = ResourceRef::new(kind, name, id);
                r.arn = str_at(&created, "/KeyMetadata/Arn").map(str::to_string);
                Ok(r)
            }
            ResourceKind::DbParameterGroup => {
                let tags = key_value_tags(&spec.tags);
                let created = self
                    .run(kind, name, &[
                        "rds", "create-db-parameter-group",
                        "--db-parameter-group-name", name,
                        "--db-parameter-group-family", spec.require_str("family")?,
                        "--description", spec.str_prop("description").unwrap_or(name),
                        "--tags", &tags,
                    ])
                    .await?;
                if let Some(parameters) = spec.get("parameters").and_then(Value::as_object) {
                    let parameters: Vec<Value> = parameters
                        .iter()
                        .map(|(key, value)| {
                            json!({
                                "ParameterName": key,
                                "ParameterValue": value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()),
                                "ApplyMethod": "pending-reboot",
                            })
                        })
                        .collect();
                    self.run(kind, name, &[
                        "rds", "modify-db-parameter-group",
                        "--db-parameter-group-name", name,
                        "--parameters", &Value::Array(parameters).to_string(),
                    ])
                    .await?;
                }
                arn_ref(kind, name, name, str_at(&created, "/DBParameterGroup/DBParameterGroupArn"))
                    .ok_or_else(|| missing_field("DBParameterGroupArn"))
            }
            ResourceKind::DbOptionGroup => {
                let tags = key_value_tags(&spec.tags);
                let created = self
                    .run(kind, name, &[
                        "rds", "create-option-group",
                        "--option-group-name", name,
                        "--engine-name", spec.require_str("engine")?,
                        "--major-engine-version", spec.require_str("major_engine_version")?,
                        "--option-group-description", spec.str_prop("description").unwrap_or(name),
                        "--tags", &tags,
                    ])
                    .await?;
                let options: Vec<Value> = spec
                    .str_list("options")
                    .into_iter()
                    .map(|option| json!({ "OptionName": option }))
                    .collect();
                if !options.is_empty() {
                    self.run(kind, name, &[
                        "rds", "modify-option-group",
                        "--option-group-name", name,
                        "--options-to-include", &Value::Array(options).to_string(),
                        "--apply-immediately",
                    ])
                    .await?;
                }
                arn_ref(kind, name, name, str_at(&created, "/OptionGroup/OptionGroupArn"))
                    .ok_or_else(|| missing_field("OptionGroupArn"))
            }
            ResourceKind::DbInstance => {
                let storage = spec
                    .get("allocated_storage")
                    .and_then(Value::as_u64)
                    .unwrap_or(20)
                    .to_string();
                let port = spec.get("port").and_then(Value::as_u64).unwrap_or(1521).to_string();
                let tags = key_value_tags(&spec.tags);
                let security_group = spec.require_str("security_group_id")?;
                let mut args = vec![
                    "rds", "create-db-instance",
                    "--db-instance-identifier", name,
                    "--engine", spec.require_str("engine")?,
                    "--engine-version", spec.require_str("engine_version")?,
                    "--license-model", spec.str_prop("license_model").unwrap_or("bring-your-own-license"),
                    "--db-instance-class", spec.require_str("instance_class")?,
                    "--allocated-storage", storage.as_str(),
                    "--port", port.as_str(),
                    "--db-name", spec.require_str("db_name")?,
                    "--master-username", spec.require_str("master_username")?,
                    "--db-subnet-group-name", spec.require_str("db_subnet_group")?,
                    "--db-parameter-group-name", spec.require_str("parameter_group")?,
                    "--option-group-name", spec.require_str("option_group")?,
                    "--vpc-security-group-ids", security_group,
                    "--kms-key-id", spec.require_str("kms_key_id")?,
                    "--storage-type", "gp3",
                    "--storage-encrypted",
                    "--publicly-accessible",
                    "--tags", tags.as_str(),
                ];
                match spec.sensitive.get("master_password") {
                    Some(password) => args.extend(["--master-user-password", password.as_str()]),
                    None => args.push("--manage-master-user-password"),
                }
                args.push(if spec.protect { "--deletion-protection" } else { "--no-deletion-protection" });
                self.run(kind, name, &args).await?;

                info!(instance = %name, "Waiting for database instance to become available");
                self.run(kind, name, &["rds", "wait", "db-instance-available", "--db-instance-identifier", name])
                    .await?;

                let described = self
                    .run(kind, name, &["rds", "describe-db-instances", "--db-instance-identifier", name])
                    .await?;
                db_instance_ref(name, &described).ok_or_else(|| missing_field("DBInstanceArn"))
            }
            ResourceKind::S3Bucket => {
                let mut args = vec!["s3api", "create-bucket", "--bucket", name];
                let constraint = format!("LocationConstraint={}", self.region);
                if self.region != "us-east-1" {
                    args.extend(["--create-bucket-configuration", constraint.as_str()]);
                }
                self.run(kind, name, &args).await?;
                self.tag_bucket(spec).await?;
                Ok(ResourceRef::new(kind, name, name).with_arn(format!("arn:aws:s3:::{}", name)))
            }
            ResourceKind::IamPolicy => {
                let document = spec
                    .get("document")
                    .map(Value::to_string)
                    .ok_or_else(|| invalid(spec, "missing property 'document'"))?;
                let tags = key_value_tags(&spec.tags);
                let created = self
                    .run(kind, name, &["iam", "create-policy", "--policy-name", name, "--policy-document", &document, "--tags", &tags])
                    .await?;
                let id = required_at(&created, "/Policy/PolicyId")?;
                let mut r = ResourceRef::new(kind, name, id);
                r.arn = str_at(&created, "/Policy/Arn").map(str::to_string);
                Ok(r)
            }
            ResourceKind::IamRole => {
                let document = spec
                    .get(attr::ASSUME_ROLE_POLICY)
                    .map(Value::to_string)
                    .ok_or_else(|| invalid(spec, "missing property 'assume_role_policy'"))?;
                let description = spec.str_prop("description").unwrap_or(name);
                let tags = key_value_tags(&spec.tags);
                let created = self
                    .run(kind, name, &[
                        "iam", "create-role",
                        "--role-name", name,
                        "--description", description,
                        "--assume-role-policy-document", &document,
                        "--tags", &tags,
                    ])
                    .await?;
                let id = required_at(&created, "/Role/RoleId")?;
                let mut r = ResourceRef::new(kind, name, id).with_attr(attr::ASSUME_ROLE_POLICY, &document);
                r.arn = str_at(&created, "/Role/Arn").map(str::to_string);
                Ok(r)
            }
            ResourceKind::RolePolicyAttachment => {
                let role = spec.require_str("role_name")?;
                let policy_arn = spec.require_str("policy_arn")?;
                self.run(kind, name, &["iam", "attach-role-policy", "--role-name", role, "--policy-arn", policy_arn])
                    .await?;
                Ok(ResourceRef::new(kind, name, format!("{}/{}", role, policy_arn)))
            }
            other => Err(PlatformError::Unsupported {
                platform: PlatformKind::Aws,
                kind: other,
            }),
        }
    }

    /// Bring an existing object in line with `spec` where AWS allows in-place changes
    async fn update(&self, spec: &ResourceSpec, existing: ResourceRef) -> Result<Applied, PlatformError> {
        let kind = spec.kind;
        let name = spec.name.as_str();

        match kind {
            ResourceKind::IamRole => {
                let desired = spec
                    .get(attr::ASSUME_ROLE_POLICY)
                    .ok_or_else(|| invalid(spec, "missing property 'assume_role_policy'"))?;
                let current: Option<Value> = existing
                    .attr(attr::ASSUME_ROLE_POLICY)
                    .and_then(|raw| serde_json::from_str(raw).ok());

                if !spec.tags.is_empty() {
                    let tags = key_value_tags(&spec.tags);
                    self.run(kind, name, &["iam", "tag-role", "--role-name", name, "--tags", &tags]).await?;
                }

                if current.as_ref() == Some(desired) {
                    return Ok(Applied::unchanged(existing));
                }

                let document = desired.to_string();
                self.run(kind, name, &["iam", "update-assume-role-policy", "--role-name", name, "--policy-document", &document])
                    .await?;
                info!(role = %name, "Updated trust policy");
                Ok(Applied::updated(existing.with_attr(attr::ASSUME_ROLE_POLICY, document)))
            }
            ResourceKind::IamPolicy => {
                let desired = spec
                    .get("document")
                    .ok_or_else(|| invalid(spec, "missing property 'document'"))?;
                let arn = existing
                    .arn
                    .clone()
                    .ok_or_else(|| missing_field("Policy.Arn"))?;
                let version = existing.attr("default_version_id").unwrap_or("v1").to_string();
                let current = self
                    .run(kind, name, &["iam", "get-policy-version", "--policy-arn", &arn, "--version-id", &version])
                    .await?;
                if current.pointer("/PolicyVersion/Document") == Some(desired) {
                    return Ok(Applied::unchanged(existing));
                }
                let document = desired.to_string();
                self.run(kind, name, &[
                    "iam", "create-policy-version",
                    "--policy-arn", &arn,
                    "--policy-document", &document,
                    "--set-as-default",
                ])
                .await?;
                Ok(Applied::updated(existing))
            }
            ResourceKind::S3Bucket => {
                self.tag_bucket(spec).await?;
                Ok(Applied::unchanged(existing))
            }
            _ => Ok(Applied::unchanged(existing)),
        }
    }

    async fn tag_bucket(&self, spec: &ResourceSpec) -> Result<(), PlatformError> {
        if spec.tags.is_empty() {
            return Ok(());
        }
        let tagging = json!({ "TagSet": tag_pairs(&spec.tags, "Key", "Value") }).to_string();
        self.run(spec.kind, &spec.name, &["s3api", "put-bucket-tagging", "--bucket", &spec.name, "--tagging", &tagging])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Platform for AwsCliPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Aws
    }

    async fn lookup(&self, spec: &ResourceSpec) -> Result<Option<ResourceRef>, PlatformError> {
        self.find(spec).await
    }

    async fn apply(&self, spec: &ResourceSpec) -> Result<Applied, PlatformError> {
        match self.find(spec).await? {
            Some(existing) => self.update(spec, existing).await,
            None => {
                let created = self.create(spec).await?;
                info!(kind = %spec.kind, name = %spec.name, id = %created.id, "Created AWS resource");
                Ok(Applied::created(created))
            }
        }
    }
}

/// Map CLI stderr (`An error occurred (Code) when calling ...`) to a platform error
fn classify_error(kind: ResourceKind, name: &str, stderr: &str) -> PlatformError {
    let code = error_code(stderr).unwrap_or_default();
    if code == "404" || code == "NoSuchEntity" || code == "NoSuchBucket" || code.contains("NotFound") {
        PlatformError::NotFound {
            kind,
            name: name.to_string(),
        }
    } else if code == "EntityAlreadyExists"
        || code == "BucketAlreadyOwnedByYou"
        || code.contains("AlreadyExists")
    {
        PlatformError::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    } else {
        PlatformError::Api {
            platform: PlatformKind::Aws,
            status: None,
            message: stderr.to_string(),
        }
    }
}

fn error_code(stderr: &str) -> Option<&str> {
    let start = stderr.find("An error occurred (")? + "An error occurred (".len();
    let end = stderr[start..].find(')')?;
    Some(&stderr[start..start + end])
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn required_at<'a>(value: &'a Value, pointer: &str) -> Result<&'a str, PlatformError> {
    str_at(value, pointer).ok_or_else(|| missing_field(pointer))
}

fn missing_field(field: &str) -> PlatformError {
    PlatformError::Decode(format!("aws response missing {}", field))
}

fn invalid(spec: &ResourceSpec, reason: &str) -> PlatformError {
    PlatformError::InvalidSpec {
        kind: spec.kind,
        name: spec.name.clone(),
        reason: reason.to_string(),
    }
}

fn arn_ref(kind: ResourceKind, name: &str, id: &str, arn: Option<&str>) -> Option<ResourceRef> {
    arn.map(|arn| ResourceRef::new(kind, name, id).with_arn(arn))
}

fn db_instance_ref(name: &str, described: &Value) -> Option<ResourceRef> {
    let arn = str_at(described, "/DBInstances/0/DBInstanceArn")?;
    let mut r = ResourceRef::new(ResourceKind::DbInstance, name, name).with_arn(arn);
    if let Some(host) = str_at(described, "/DBInstances/0/Endpoint/Address") {
        let port = described
            .pointer("/DBInstances/0/Endpoint/Port")
            .and_then(Value::as_u64)
            .unwrap_or(1521);
        r = r.with_attr(attr::ENDPOINT, format!("{}:{}", host, port));
    }
    Some(r)
}

fn name_filter(name: &str) -> String {
    format!("Name=tag:Name,Values={}", name)
}

fn tag_pairs(tags: &BTreeMap<String, String>, key: &str, value: &str) -> Vec<Value> {
    tags.iter()
        .map(|(k, v)| json!({ key: k, value: v }))
        .collect()
}

fn key_value_tags(tags: &BTreeMap<String, String>) -> String {
    Value::Array(tag_pairs(tags, "Key", "Value")).to_string()
}

fn kms_tags(tags: &BTreeMap<String, String>) -> String {
    Value::Array(tag_pairs(tags, "TagKey", "TagValue")).to_string()
}

/// EC2 `--tag-specifications` with the `Name` tag set to the spec name
fn tag_specification(resource_type: &str, spec: &ResourceSpec) -> String {
    let mut tags = spec.tags.clone();
    tags.insert("Name".to_string(), spec.name.clone());
    json!([{ "ResourceType": resource_type, "Tags": tag_pairs(&tags, "Key", "Value") }]).to_string()
}

/// `ingress` entries (`{protocol, port, cidr}`) as EC2 IP permissions
fn ingress_permissions(spec: &ResourceSpec) -> Value {
    let rules = spec
        .get("ingress")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Value::Array(
        rules
            .iter()
            .map(|rule| {
                let port = rule.get("port").and_then(Value::as_u64).unwrap_or(0);
                json!({
                    "IpProtocol": rule.get("protocol").and_then(Value::as_str).unwrap_or("tcp"),
                    "FromPort": port,
                    "ToPort": port,
                    "IpRanges": [{ "CidrIp": rule.get("cidr").and_then(Value::as_str).unwrap_or("0.0.0.0/0") }],
                })
            })
            .collect(),
    )
}

/// `modify-vpc-attribute` flags for the DNS attributes the spec enables
///
/// A publicly accessible RDS instance is rejected in a VPC without DNS
/// hostnames, so both are switched on right after `create-vpc`.
fn vpc_dns_flags(spec: &ResourceSpec) -> Vec<&'static str> {
    [
        ("enable_dns_support", "--enable-dns-support"),
        ("enable_dns_hostnames", "--enable-dns-hostnames"),
    ]
    .into_iter()
    .filter(|(key, _)| spec.get(key).and_then(Value::as_bool).unwrap_or(false))
    .map(|(_, flag)| flag)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpc_dns_flags() {
        let spec = ResourceSpec::new(ResourceKind::Vpc, "demo-vpc")
            .property("cidr_block", "172.31.0.0/16")
            .property("enable_dns_hostnames", true)
            .property("enable_dns_support", true);
        assert_eq!(vpc_dns_flags(&spec), vec!["--enable-dns-support", "--enable-dns-hostnames"]);

        let bare = ResourceSpec::new(ResourceKind::Vpc, "demo-vpc").property("cidr_block", "10.0.0.0/16");
        assert!(vpc_dns_flags(&bare).is_empty());
    }

    /// Stub `aws` executable that logs its arguments and answers a few calls
    #[cfg(unix)]
    fn stub_cli(dir: &std::path::Path) -> (AwsCliPlatform, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("aws");
        let body = format!(
            r#"#!/bin/sh
echo "$@" >> "{log}"
case "$1 $2" in
  "ec2 create-vpc") echo '{{"Vpc":{{"VpcId":"vpc-0stub"}}}}' ;;
  "kms create-key") echo '{{"KeyMetadata":{{"KeyId":"key-0stub","Arn":"arn:aws:kms:eu-central-1:123456789012:key/key-0stub"}}}}' ;;
  "kms create-alias") echo "An error occurred (AccessDeniedException) when calling the CreateAlias operation" >&2; exit 254 ;;
esac
"#,
            log = log.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let platform = AwsCliPlatform::new("eu-central-1").with_binary(Some(script.display().to_string()));
        (platform, log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_new_vpc_gets_dns_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, log) = stub_cli(dir.path());
        let spec = ResourceSpec::new(ResourceKind::Vpc, "demo-vpc")
            .property("cidr_block", "172.31.0.0/16")
            .property("enable_dns_hostnames", true)
            .property("enable_dns_support", true);

        let vpc = platform.create(&spec).await.unwrap();

        assert_eq!(vpc.id, "vpc-0stub");
        let calls = std::fs::read_to_string(log).unwrap();
        assert!(calls.contains("ec2 modify-vpc-attribute --vpc-id vpc-0stub --enable-dns-support"));
        assert!(calls.contains("ec2 modify-vpc-attribute --vpc-id vpc-0stub --enable-dns-hostnames"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kms_key_without_alias_is_scheduled_for_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, log) = stub_cli(dir.path());
        let spec = ResourceSpec::new(ResourceKind::KmsKey, "demo-tde-kms-key")
            .property("policy", json!({ "Version": "2012-10-17", "Statement": [] }));

        let err = platform.create(&spec).await.unwrap_err();

        assert!(err.to_string().contains("AccessDeniedException"));
        let calls = std::fs::read_to_string(log).unwrap();
        assert!(calls.contains("kms schedule-key-deletion --key-id key-0stub --pending-window-in-days 7"));
    }

    #[test]
    fn test_error_classification() {
        let missing = classify_error(
            ResourceKind::IamRole,
            "demo-role",
            "An error occurred (NoSuchEntity) when calling the GetRole operation: The role with name demo-role cannot be found.",
        );
        assert!(missing.is_not_found());

        let head = classify_error(
            ResourceKind::S3Bucket,
            "demo-bucket",
            "An error occurred (404) when calling the HeadBucket operation: Not Found",
        );
        assert!(head.is_not_found());

        let kms = classify_error(
            ResourceKind::KmsKey,
            "demo-key",
            "An error occurred (NotFoundException) when calling the DescribeKey operation: Alias not found",
        );
        assert!(kms.is_not_found());

        let exists = classify_error(
            ResourceKind::IamRole,
            "demo-role",
            "An error occurred (EntityAlreadyExists) when calling the CreateRole operation",
        );
        assert!(matches!(exists, PlatformError::AlreadyExists { .. }));

        let denied = classify_error(
            ResourceKind::IamRole,
            "demo-role",
            "An error occurred (AccessDenied) when calling the GetRole operation",
        );
        assert!(matches!(denied, PlatformError::Api { .. }));
    }

    #[test]
    fn test_error_code_without_marker() {
        assert_eq!(error_code("Unable to locate credentials"), None);
        let err = classify_error(ResourceKind::Vpc, "demo-vpc", "Unable to locate credentials");
        assert!(err.to_string().contains("Unable to locate credentials"));
    }

    #[test]
    fn test_tag_specification_carries_name() {
        let spec = ResourceSpec::new(ResourceKind::Subnet, "demo-rds-subnet-1").tag("team", "data");
        let parsed: Value = serde_json::from_str(&tag_specification("subnet", &spec)).unwrap();

        assert_eq!(parsed[0]["ResourceType"], "subnet");
        let tags = parsed[0]["Tags"].as_array().unwrap();
        assert!(tags.iter().any(|t| t["Key"] == "Name" && t["Value"] == "demo-rds-subnet-1"));
        assert!(tags.iter().any(|t| t["Key"] == "team"));
    }

    #[test]
    fn test_ingress_permissions() {
        let spec = ResourceSpec::new(ResourceKind::SecurityGroup, "demo-rds-sg")
            .property("ingress", json!([{ "protocol": "tcp", "port": 1521, "cidr": "0.0.0.0/0" }]));
        let permissions = ingress_permissions(&spec);

        assert_eq!(permissions[0]["FromPort"], 1521);
        assert_eq!(permissions[0]["IpRanges"][0]["CidrIp"], "0.0.0.0/0");
    }

    #[test]
    fn test_db_instance_endpoint() {
        let described = json!({
            "DBInstances": [{
                "DBInstanceArn": "arn:aws:rds:eu-central-1:123456789012:db:demo",
                "Endpoint": { "Address": "demo.abc.eu-central-1.rds.amazonaws.com", "Port": 1521 }
            }]
        });
        let r = db_instance_ref("demo", &described).unwrap();
        assert_eq!(r.attr(attr::ENDPOINT), Some("demo.abc.eu-central-1.rds.amazonaws.com:1521"));
    }
}
