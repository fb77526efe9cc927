//! IAM Policy Documents
//!
//! Typed trust and access policies for the linking roles. Trust policies go
//! through three shapes over the life of a stack: a deny-all placeholder,
//! then a policy trusting the reciprocal platform's principal/external-id
//! pair once that pair is known.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const POLICY_VERSION: &str = "2012-10-17";
const EXTERNAL_ID_KEY: &str = "sts:ExternalId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    pub action: OneOrMany,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<OneOrMany>,
    /// Operator -> condition key -> values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<BTreeMap<String, BTreeMap<String, OneOrMany>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "AWS")]
    pub aws: OneOrMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn values(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(value) => vec![value.as_str()],
            OneOrMany::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }

    fn from_vec(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            OneOrMany::One(values.remove(0))
        } else {
            OneOrMany::Many(values)
        }
    }
}

fn strings(values: &[&str]) -> OneOrMany {
    OneOrMany::from_vec(values.iter().map(|v| v.to_string()).collect())
}

impl PolicyDocument {
    pub fn new(statement: Vec<Statement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement,
        }
    }

    /// Trust policy that lets nobody assume the role
    pub fn deny_all_trust() -> Self {
        Self::new(vec![Statement {
            sid: Some("DenyAll".to_string()),
            effect: Effect::Deny,
            principal: Some(Principal { aws: strings(&["*"]) }),
            action: strings(&["sts:AssumeRole"]),
            resource: None,
            condition: None,
        }])
    }

    /// Trust policy for a provider integration's principal and external id
    pub fn provider_trust(principal_arn: &str, external_id: &str) -> Self {
        Self::new(vec![
            Statement {
                sid: Some("AllowProviderAssumeRole".to_string()),
                effect: Effect::Allow,
                principal: Some(Principal { aws: strings(&[principal_arn]) }),
                action: strings(&["sts:AssumeRole"]),
                resource: None,
                condition: Some(external_id_condition(external_id)),
            },
            Statement {
                sid: Some("AllowProviderTagSession".to_string()),
                effect: Effect::Allow,
                principal: Some(Principal { aws: strings(&[principal_arn]) }),
                action: strings(&["sts:TagSession"]),
                resource: None,
                condition: None,
            },
        ])
    }

    /// Trust policy for the lakehouse: its master role plus the role itself
    /// (self-assumption is required by Unity Catalog), gated on the external id
    pub fn lakehouse_trust(master_role_arn: &str, self_role_arn: &str, external_id: &str) -> Self {
        Self::new(vec![Statement {
            sid: Some("AllowUnityCatalogAssumeRole".to_string()),
            effect: Effect::Allow,
            principal: Some(Principal {
                aws: strings(&[master_role_arn, self_role_arn]),
            }),
            action: strings(&["sts:AssumeRole"]),
            resource: None,
            condition: Some(external_id_condition(external_id)),
        }])
    }

    /// Least-privilege read/write access to one bucket
    pub fn bucket_access(bucket: &str) -> Self {
        let bucket_arn = format!("arn:aws:s3:::{}", bucket);
        let objects_arn = format!("{}/*", bucket_arn);
        Self::new(vec![
            Statement {
                sid: Some("BucketLevel".to_string()),
                effect: Effect::Allow,
                principal: None,
                action: strings(&[
                    "s3:GetBucketLocation",
                    "s3:ListBucketMultipartUploads",
                    "s3:ListBucket",
                ]),
                resource: Some(strings(&[bucket_arn.as_str()])),
                condition: None,
            },
            Statement {
                sid: Some("ObjectLevel".to_string()),
                effect: Effect::Allow,
                principal: None,
                action: strings(&[
                    "s3:PutObject",
                    "s3:PutObjectTagging",
                    "s3:GetObject",
                    "s3:DeleteObject",
                    "s3:AbortMultipartUpload",
                    "s3:ListMultipartUploadParts",
                ]),
                resource: Some(strings(&[objects_arn.as_str()])),
                condition: None,
            },
        ])
    }

    /// Key policy giving the account root full control
    pub fn kms_key_policy(account_id: &str) -> Self {
        Self::new(vec![Statement {
            sid: Some("EnableRootAccountPermissions".to_string()),
            effect: Effect::Allow,
            principal: Some(Principal {
                aws: strings(&[format!("arn:aws:iam::{}:root", account_id).as_str()]),
            }),
            action: strings(&["kms:*"]),
            resource: Some(strings(&["*"])),
            condition: None,
        }])
    }

    /// Principals allowed to assume the role
    pub fn trusted_principals(&self) -> Vec<String> {
        self.statement
            .iter()
            .filter(|s| s.effect == Effect::Allow && s.action.values().contains(&"sts:AssumeRole"))
            .filter_map(|s| s.principal.as_ref())
            .flat_map(|p| p.aws.values())
            .map(str::to_string)
            .collect()
    }

    /// External id required for `sts:AssumeRole`
    pub fn external_id(&self) -> Option<String> {
        self.statement
            .iter()
            .filter_map(|s| s.condition.as_ref())
            .filter_map(|c| c.get("StringEquals"))
            .filter_map(|c| c.get(EXTERNAL_ID_KEY))
            .flat_map(|v| v.values())
            .map(str::to_string)
            .next()
    }

    /// True when no statement allows anything
    pub fn is_deny_all(&self) -> bool {
        self.statement.iter().all(|s| s.effect == Effect::Deny)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

fn external_id_condition(external_id: &str) -> BTreeMap<String, BTreeMap<String, OneOrMany>> {
    BTreeMap::from([(
        "StringEquals".to_string(),
        BTreeMap::from([(EXTERNAL_ID_KEY.to_string(), strings(&[external_id]))]),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_all_has_no_trusted_principals() {
        let policy = PolicyDocument::deny_all_trust();
        assert!(policy.is_deny_all());
        assert!(policy.trusted_principals().is_empty());
        assert_eq!(policy.external_id(), None);
    }

    #[test]
    fn test_provider_trust_shape() {
        let policy = PolicyDocument::provider_trust("arn:aws:iam::000000000000:role/cflt", "ext-123");
        let json = policy.to_value();

        assert_eq!(json["Version"], "2012-10-17");
        assert_eq!(json["Statement"][0]["Principal"]["AWS"], "arn:aws:iam::000000000000:role/cflt");
        assert_eq!(json["Statement"][0]["Condition"]["StringEquals"]["sts:ExternalId"], "ext-123");
        assert_eq!(json["Statement"][1]["Action"], "sts:TagSession");
        assert_eq!(policy.trusted_principals(), vec!["arn:aws:iam::000000000000:role/cflt"]);
        assert_eq!(policy.external_id().as_deref(), Some("ext-123"));
    }

    #[test]
    fn test_lakehouse_trust_includes_self() {
        let policy = PolicyDocument::lakehouse_trust(
            "arn:aws:iam::414351767826:role/master",
            "arn:aws:iam::123456789012:role/demo-dbx-access-role",
            "dbx-ext",
        );
        assert_eq!(policy.trusted_principals().len(), 2);
        assert_eq!(policy.external_id().as_deref(), Some("dbx-ext"));
    }

    #[test]
    fn test_round_trip_through_aws_json() {
        let raw = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "AWS": ["arn:a", "arn:b"] },
                "Action": "sts:AssumeRole",
                "Condition": { "StringEquals": { "sts:ExternalId": "x" } }
            }]
        });
        let policy = PolicyDocument::from_value(&raw).unwrap();
        assert_eq!(policy.trusted_principals(), vec!["arn:a", "arn:b"]);
        assert_eq!(policy.to_value(), raw);
    }

    #[test]
    fn test_bucket_access_scopes_resources() {
        let json = PolicyDocument::bucket_access("demo-tableflow-bucket").to_value();
        assert_eq!(json["Statement"][0]["Resource"], "arn:aws:s3:::demo-tableflow-bucket");
        assert_eq!(json["Statement"][1]["Resource"], "arn:aws:s3:::demo-tableflow-bucket/*");
    }
}
