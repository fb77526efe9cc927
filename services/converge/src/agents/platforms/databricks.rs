//! Databricks Platform
//!
//! Lakehouse resources over the workspace REST API: SCIM service principals
//! and their OAuth secrets, plus Unity Catalog storage credentials, catalogs,
//! external locations and grants.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::time::Duration;
use tracing::{debug, info};

use super::types::{
    attr, Applied, PlatformError, PlatformKind, ResourceKind, ResourceRef, ResourceSpec,
};
use super::Platform;

const SCIM_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:2.0:ServicePrincipal";

/// Databricks workspace adapter
pub struct DatabricksPlatform {
    http_client: Client,
    host: String,
    token: String,
}

impl DatabricksPlatform {
    pub fn new(host: &str, token: &str) -> Result<Self, PlatformError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PlatformError::Transport(format!("failed to create HTTP client: {}", e)))?;

        let host = if host.starts_with("http") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };

        Ok(Self {
            http_client,
            host,
            token: token.to_string(),
        })
    }

    /// Build from `DATABRICKS_HOST` (unless overridden) and `DATABRICKS_TOKEN`
    pub fn from_env(host: Option<&str>) -> Result<Self, PlatformError> {
        let host = match host.filter(|h| !h.is_empty()) {
            Some(host) => host.to_string(),
            None => env::var("DATABRICKS_HOST")
                .map_err(|_| PlatformError::Transport("DATABRICKS_HOST must be set".to_string()))?,
        };
        let token = env::var("DATABRICKS_TOKEN")
            .map_err(|_| PlatformError::Transport("DATABRICKS_TOKEN must be set".to_string()))?;
        info!(host = %host, "Databricks platform initialized");
        Self::new(&host, &token)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Option<Value>, PlatformError> {
        let url = format!("{}{}", self.host, path);
        debug!(method = %method, path = %path, "databricks request");

        let mut request = self.http_client.request(method, &url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::Transport(format!("databricks request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PlatformError::Transport(format!("failed to read databricks response: {}", e)))?;

        if status == StatusCode::NOT_FOUND
            || (!status.is_success() && text.contains("RESOURCE_DOES_NOT_EXIST"))
        {
            return Ok(None);
        }

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(text);
            return Err(PlatformError::Api {
                platform: PlatformKind::Databricks,
                status: Some(status.as_u16()),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(Some(json!({})));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| PlatformError::Decode(format!("databricks {}: {}", path, e)))
    }

    async fn send_expect(&self, method: Method, path: &str, body: Option<&Value>, spec: &ResourceSpec) -> Result<Value, PlatformError> {
        self.send(method, path, body).await?.ok_or_else(|| PlatformError::NotFound {
            kind: spec.kind,
            name: spec.name.clone(),
        })
    }

    async fn find(&self, spec: &ResourceSpec) -> Result<Option<ResourceRef>, PlatformError> {
        let name = spec.name.as_str();

        match spec.kind {
            ResourceKind::ServicePrincipal => {
                let filter = format!("displayName eq \"{}\"", name);
                let path = format!(
                    "/api/2.0/preview/scim/v2/ServicePrincipals?filter={}",
                    urlencoding::encode(&filter)
                );
                let found = self.send(Method::GET, &path, None).await?;
                Ok(found
                    .as_ref()
                    .and_then(|v| v.pointer("/Resources/0"))
                    .map(|sp| service_principal_ref(name, sp)))
            }
            ResourceKind::ServicePrincipalSecret => {
                let path = secrets_path(spec)?;
                let found = self.send(Method::GET, &path, None).await?;
                Ok(found
                    .as_ref()
                    .and_then(|v| v.pointer("/secrets/0/id"))
                    .and_then(Value::as_str)
                    .map(|id| ResourceRef::new(spec.kind, name, id)))
            }
            ResourceKind::StorageCredential => {
                let path = format!("/api/2.1/unity-catalog/storage-credentials/{}", name);
                Ok(self
                    .send(Method::GET, &path, None)
                    .await?
                    .map(|v| storage_credential_ref(name, &v)))
            }
            ResourceKind::Catalog => {
                let path = format!("/api/2.1/unity-catalog/catalogs/{}", name);
                Ok(self.send(Method::GET, &path, None).await?.map(|v| {
                    let id = v.get("id").and_then(Value::as_str).unwrap_or(name);
                    ResourceRef::new(spec.kind, name, id)
                }))
            }
            ResourceKind::ExternalLocation => {
                let path = format!("/api/2.1/unity-catalog/external-locations/{}", name);
                Ok(self.send(Method::GET, &path, None).await?.map(|v| {
                    let mut r = ResourceRef::new(spec.kind, name, name);
                    if let Some(url) = v.get("url").and_then(Value::as_str) {
                        r = r.with_attr("url", url);
                    }
                    r
                }))
            }
            ResourceKind::Grants => {
                let (securable, full_name) = grants_target(spec)?;
                let path = format!(
                    "/api/2.1/unity-catalog/permissions/{}/{}",
                    securable,
                    urlencoding::encode(full_name)
                );
                Ok(self
                    .send(Method::GET, &path, None)
                    .await?
                    .map(|_| ResourceRef::new(spec.kind, name, name)))
            }
            other => Err(PlatformError::Unsupported {
                platform: PlatformKind::Databricks,
                kind: other,
            }),
        }
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef, PlatformError> {
        let name = spec.name.as_str();

        match spec.kind {
            ResourceKind::ServicePrincipal => {
                let entitlements: Vec<Value> = [
                    ("workspace_access", "workspace-access"),
                    ("databricks_sql_access", "databricks-sql-access"),
                ]
                .into_iter()
                .filter(|(property, _)| spec.get(property).and_then(Value::as_bool).unwrap_or(false))
                .map(|(_, entitlement)| json!({ "value": entitlement }))
                .collect();
                let body = json!({
                    "schemas": [SCIM_SCHEMA],
                    "displayName": name,
                    "active": true,
                    "entitlements": entitlements,
                });
                let created = self
                    .send_expect(Method::POST, "/api/2.0/preview/scim/v2/ServicePrincipals", Some(&body), spec)
                    .await?;
                Ok(service_principal_ref(name, &created))
            }
            ResourceKind::ServicePrincipalSecret => {
                let created = self
                    .send_expect(Method::POST, &secrets_path(spec)?, Some(&json!({})), spec)
                    .await?;
                let id = created.get("id").and_then(Value::as_str).unwrap_or(name);
                let mut r = ResourceRef::new(spec.kind, name, id);
                if let Some(secret) = created.get("secret").and_then(Value::as_str) {
                    r = r.with_attr(attr::SECRET, secret);
                }
                Ok(r)
            }
            ResourceKind::StorageCredential => {
                let body = json!({
                    "name": name,
                    "aws_iam_role": { "role_arn": spec.require_str("role_arn")? },
                    "comment": spec.str_prop("comment").unwrap_or_default(),
                });
                let created = self
                    .send_expect(Method::POST, "/api/2.1/unity-catalog/storage-credentials", Some(&body), spec)
                    .await?;
                Ok(storage_credential_ref(name, &created))
            }
            ResourceKind::Catalog => {
                let body = catalog_body(spec);
                let created = self
                    .send_expect(Method::POST, "/api/2.1/unity-catalog/catalogs", Some(&body), spec)
                    .await?;
                let id = created.get("id").and_then(Value::as_str).unwrap_or(name);
                Ok(ResourceRef::new(spec.kind, name, id))
            }
            ResourceKind::ExternalLocation => {
                let url = spec.require_str("url")?;
                let body = json!({
                    "name": name,
                    "url": url,
                    "credential_name": spec.require_str("credential_name")?,
                    "comment": spec.str_prop("comment").unwrap_or_default(),
                });
                self.send_expect(Method::POST, "/api/2.1/unity-catalog/external-locations", Some(&body), spec)
                    .await?;
                Ok(ResourceRef::new(spec.kind, name, name).with_attr("url", url))
            }
            ResourceKind::Grants => {
                // Grants always exist on an existing securable, so this is only
                // reached when the securable itself is missing
                Err(PlatformError::NotFound {
                    kind: spec.kind,
                    name: name.to_string(),
                })
            }
            other => Err(PlatformError::Unsupported {
                platform: PlatformKind::Databricks,
                kind: other,
            }),
        }
    }

    async fn update(&self, spec: &ResourceSpec, existing: ResourceRef) -> Result<Applied, PlatformError> {
        match spec.kind {
            ResourceKind::StorageCredential => {
                let desired = spec.require_str("role_arn")?;
                if existing.attr(attr::CUSTOMER_ROLE_ARN) == Some(desired) {
                    return Ok(Applied::unchanged(existing));
                }
                let path = format!("/api/2.1/unity-catalog/storage-credentials/{}", spec.name);
                let body = json!({ "aws_iam_role": { "role_arn": desired } });
                let updated = self.send_expect(Method::PATCH, &path, Some(&body), spec).await?;
                Ok(Applied::updated(storage_credential_ref(&spec.name, &updated)))
            }
            ResourceKind::Grants => {
                let (securable, full_name) = grants_target(spec)?;
                let path = format!(
                    "/api/2.1/unity-catalog/permissions/{}/{}",
                    securable,
                    urlencoding::encode(full_name)
                );
                let current = self.send_expect(Method::GET, &path, None, spec).await?;
                let changes = grant_changes(&desired_grants(spec), &current_grants(&current));
                if changes.is_empty() {
                    return Ok(Applied::unchanged(existing));
                }
                let body = json!({ "changes": changes });
                self.send_expect(Method::PATCH, &path, Some(&body), spec).await?;
                Ok(Applied::updated(existing))
            }
            _ => Ok(Applied::unchanged(existing)),
        }
    }
}

#[async_trait]
impl Platform for DatabricksPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Databricks
    }

    async fn lookup(&self, spec: &ResourceSpec) -> Result<Option<ResourceRef>, PlatformError> {
        self.find(spec).await
    }

    async fn apply(&self, spec: &ResourceSpec) -> Result<Applied, PlatformError> {
        match self.find(spec).await? {
            Some(existing) => self.update(spec, existing).await,
            None => {
                let created = self.create(spec).await?;
                info!(kind = %spec.kind, name = %spec.name, id = %created.id, "Created Databricks resource");
                Ok(Applied::created(created))
            }
        }
    }
}

fn secrets_path(spec: &ResourceSpec) -> Result<String, PlatformError> {
    Ok(format!(
        "/api/2.0/accounts/servicePrincipals/{}/credentials/secrets",
        spec.require_str("service_principal_id")?
    ))
}

/// `Grants` names are `{securable_type}/{full_name}`
fn grants_target(spec: &ResourceSpec) -> Result<(&str, &str), PlatformError> {
    let securable = spec.require_str("securable_type")?;
    let full_name = spec.require_str("full_name")?;
    Ok((securable, full_name))
}

fn service_principal_ref(name: &str, body: &Value) -> ResourceRef {
    let id = body.get("id").and_then(Value::as_str).unwrap_or_default();
    let mut r = ResourceRef::new(ResourceKind::ServicePrincipal, name, id);
    if let Some(app) = body.get("applicationId").and_then(Value::as_str) {
        r = r.with_attr(attr::APPLICATION_ID, app);
    }
    r
}

fn storage_credential_ref(name: &str, body: &Value) -> ResourceRef {
    let id = body.get("id").and_then(Value::as_str).unwrap_or(name);
    let mut r = ResourceRef::new(ResourceKind::StorageCredential, name, id);
    if let Some(role) = body.pointer("/aws_iam_role/role_arn").and_then(Value::as_str) {
        r = r.with_attr(attr::CUSTOMER_ROLE_ARN, role);
    }
    if let Some(external_id) = body.pointer("/aws_iam_role/external_id").and_then(Value::as_str) {
        r = r.with_attr(attr::EXTERNAL_ID, external_id);
    }
    if let Some(uc_arn) = body.pointer("/aws_iam_role/unity_catalog_iam_arn").and_then(Value::as_str) {
        r = r.with_attr(attr::IAM_ROLE_ARN, uc_arn);
    }
    r
}

type GrantMap = BTreeMap<String, BTreeSet<String>>;

/// `grants` property: `[{principal, privileges: [..]}]`
fn desired_grants(spec: &ResourceSpec) -> GrantMap {
    collect_grants(spec.get("grants"))
}

fn current_grants(body: &Value) -> GrantMap {
    collect_grants(body.get("privilege_assignments"))
}

fn collect_grants(list: Option<&Value>) -> GrantMap {
    let mut grants = GrantMap::new();
    for entry in list.and_then(Value::as_array).into_iter().flatten() {
        let Some(principal) = entry.get("principal").and_then(Value::as_str) else {
            continue;
        };
        let privileges = entry
            .get("privileges")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string);
        grants.entry(principal.to_string()).or_default().extend(privileges);
    }
    grants
}

/// Additive changes that bring `current` up to `desired`
fn grant_changes(desired: &GrantMap, current: &GrantMap) -> Vec<Value> {
    desired
        .iter()
        .filter_map(|(principal, privileges)| {
            let held = current.get(principal);
            let missing: Vec<&String> = privileges
                .iter()
                .filter(|p| held.map_or(true, |h| !h.contains(*p)))
                .collect();
            (!missing.is_empty()).then(|| json!({ "principal": principal, "add": missing }))
        })
        .collect()
}

/// Create-catalog request; `properties` are the catalog's key/value tags
fn catalog_body(spec: &ResourceSpec) -> Value {
    let mut body = json!({
        "name": spec.name,
        "comment": spec.str_prop("comment").unwrap_or_default(),
    });
    if let Some(root) = spec.str_prop("storage_root") {
        body["storage_root"] = json!(root);
    }
    if let Some(properties) = spec.get("properties").filter(|p| p.is_object()) {
        body["properties"] = properties.clone();
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_body_carries_properties() {
        let spec = ResourceSpec::new(ResourceKind::Catalog, "demo-rds-cdc-demo")
            .property("comment", "demo CDC demo")
            .property("properties", json!({ "purpose": "RDS Oracle CDC Demo", "owner": "data" }));
        let body = catalog_body(&spec);

        assert_eq!(body["name"], "demo-rds-cdc-demo");
        assert_eq!(body["properties"]["purpose"], "RDS Oracle CDC Demo");
        assert!(body.get("storage_root").is_none());
    }

    #[test]
    fn test_host_normalisation() {
        let with_scheme = DatabricksPlatform::new("https://dbc-1.cloud.databricks.com/", "t").unwrap();
        let bare = DatabricksPlatform::new("dbc-1.cloud.databricks.com", "t").unwrap();
        assert_eq!(with_scheme.host, "https://dbc-1.cloud.databricks.com");
        assert_eq!(bare.host, "https://dbc-1.cloud.databricks.com");
    }

    #[test]
    fn test_storage_credential_ref() {
        let body = json!({
            "id": "9a1c",
            "name": "demo-dbx-storage-creds",
            "aws_iam_role": {
                "role_arn": "arn:aws:iam::123456789012:role/demo-dbx-access-role",
                "external_id": "b2f4-77",
                "unity_catalog_iam_arn": "arn:aws:iam::414351767826:role/unity-catalog-prod-UCMasterRole-14S5ZJVKOTYTL"
            }
        });
        let r = storage_credential_ref("demo-dbx-storage-creds", &body);
        assert_eq!(r.attr(attr::EXTERNAL_ID), Some("b2f4-77"));
        assert_eq!(
            r.attr(attr::CUSTOMER_ROLE_ARN),
            Some("arn:aws:iam::123456789012:role/demo-dbx-access-role")
        );
    }

    #[test]
    fn test_grant_changes_only_add_missing() {
        let spec = ResourceSpec::new(ResourceKind::Grants, "catalog/demo").property(
            "grants",
            json!([
                { "principal": "account users", "privileges": ["USE_CATALOG", "SELECT"] },
                { "principal": "app-1", "privileges": ["ALL_PRIVILEGES"] }
            ]),
        );
        let current = json!({
            "privilege_assignments": [
                { "principal": "account users", "privileges": ["USE_CATALOG"] }
            ]
        });

        let changes = grant_changes(&desired_grants(&spec), &current_grants(&current));

        assert_eq!(changes.len(), 2);
        let users = changes.iter().find(|c| c["principal"] == "account users").unwrap();
        assert_eq!(users["add"], json!(["SELECT"]));
    }

    #[test]
    fn test_grant_changes_empty_when_converged() {
        let spec = ResourceSpec::new(ResourceKind::Grants, "catalog/demo").property(
            "grants",
            json!([{ "principal": "account users", "privileges": ["SELECT"] }]),
        );
        let current = json!({
            "privilege_assignments": [{ "principal": "account users", "privileges": ["SELECT", "USE_SCHEMA"] }]
        });
        assert!(grant_changes(&desired_grants(&spec), &current_grants(&current)).is_empty());
    }
}
