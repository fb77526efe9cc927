//! Confluent Cloud Platform
//!
//! Streaming resources over the Confluent Cloud REST APIs:
//!
//! - `/org/v2` environments, `/cmk/v2` Kafka clusters
//! - `/iam/v2` service accounts, role bindings and API keys
//! - `/pim/v1` provider integrations (the AWS role handshake)
//! - `/tableflow/v1` Tableflow topics, `/connect/v1` managed connectors
//! - the cluster's own Kafka REST endpoint for topics
//!
//! Objects are located by display name within their scope. Cloud API
//! credentials come from the environment and never leave this adapter.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Map, Value};
use std::env;
use std::time::Duration;
use tracing::{debug, info};

use super::types::{
    attr, Applied, PlatformError, PlatformKind, ResourceKind, ResourceRef, ResourceSpec,
};
use super::Platform;

const DEFAULT_BASE_URL: &str = "https://api.confluent.cloud";

/// Confluent Cloud adapter
pub struct ConfluentPlatform {
    http_client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

/// Basic-auth credentials for one request
struct Credentials<'a> {
    key: &'a str,
    secret: &'a str,
}

impl ConfluentPlatform {
    pub fn new(api_key: &str, api_secret: &str) -> Result<Self, PlatformError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PlatformError::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    /// Build from `CONFLUENT_CLOUD_API_KEY` / `CONFLUENT_CLOUD_API_SECRET`
    pub fn from_env() -> Result<Self, PlatformError> {
        let key = env::var("CONFLUENT_CLOUD_API_KEY").map_err(|_| {
            PlatformError::Transport("CONFLUENT_CLOUD_API_KEY must be set".to_string())
        })?;
        let secret = env::var("CONFLUENT_CLOUD_API_SECRET").map_err(|_| {
            PlatformError::Transport("CONFLUENT_CLOUD_API_SECRET must be set".to_string())
        })?;
        let mut platform = Self::new(&key, &secret)?;
        // Same override the catalog-integration scripts honor
        if let Ok(base_url) = env::var("CONFLUENT_API_URL") {
            if !base_url.is_empty() {
                platform.base_url = base_url.trim_end_matches('/').to_string();
            }
        }
        info!(base_url = %platform.base_url, "Confluent Cloud platform initialized from environment");
        Ok(platform)
    }

    fn cloud_credentials(&self) -> Credentials<'_> {
        Credentials {
            key: &self.api_key,
            secret: &self.api_secret,
        }
    }

    /// Resource-scoped credentials carried in the spec, else the cloud key
    fn scoped_credentials<'a>(&'a self, spec: &'a ResourceSpec) -> Credentials<'a> {
        match (spec.sensitive.get("api_key"), spec.sensitive.get("api_secret")) {
            (Some(key), Some(secret)) if !key.is_empty() => Credentials { key, secret },
            _ => self.cloud_credentials(),
        }
    }

    /// Send a request; 404 yields `None`
    async fn send(
        &self,
        method: Method,
        url: &str,
        credentials: &Credentials<'_>,
        body: Option<&Value>,
    ) -> Result<Option<Value>, PlatformError> {
        debug!(method = %method, url = %url, "confluent request");

        let mut request = self
            .http_client
            .request(method, url)
            .basic_auth(credentials.key, Some(credentials.secret));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::Transport(format!("confluent request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let text = response
            .text()
            .await
            .map_err(|e| PlatformError::Transport(format!("failed to read confluent response: {}", e)))?;

        if !status.is_success() {
            return Err(PlatformError::Api {
                platform: PlatformKind::Confluent,
                status: Some(status.as_u16()),
                message: error_message(&text),
            });
        }

        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| PlatformError::Decode(format!("confluent {}: {}", url, e)))
    }

    /// Like `send`, but the object must come back
    async fn send_expect(
        &self,
        method: Method,
        url: &str,
        credentials: &Credentials<'_>,
        body: Option<&Value>,
        spec: &ResourceSpec,
    ) -> Result<Value, PlatformError> {
        self.send(method, url, credentials, body)
            .await?
            .ok_or_else(|| PlatformError::NotFound {
                kind: spec.kind,
                name: spec.name.clone(),
            })
    }

    /// Walk a paginated list endpoint and return the first item matching `matches`
    async fn find_in_list(
        &self,
        url: String,
        matches: impl Fn(&Value) -> bool,
    ) -> Result<Option<Value>, PlatformError> {
        let credentials = self.cloud_credentials();
        let mut next = Some(url);

        while let Some(url) = next.take() {
            let Some(page) = self.send(Method::GET, &url, &credentials, None).await? else {
                return Ok(None);
            };
            if let Some(found) = page
                .get("data")
                .and_then(Value::as_array)
                .and_then(|items| items.iter().find(|item| matches(item)))
            {
                return Ok(Some(found.clone()));
            }
            next = page
                .pointer("/metadata/next")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .map(str::to_string);
        }

        Ok(None)
    }

    async fn find(&self, spec: &ResourceSpec) -> Result<Option<ResourceRef>, PlatformError> {
        let name = spec.name.as_str();
        let base = &self.base_url;

        let found = match spec.kind {
            ResourceKind::Environment => {
                self.find_in_list(format!("{}/org/v2/environments", base), |item| {
                    item.get("display_name").and_then(Value::as_str) == Some(name)
                })
                .await?
            }
            ResourceKind::KafkaCluster => {
                let environment = spec.require_str("environment_id")?;
                self.find_in_list(
                    with_query(format!("{}/cmk/v2/clusters", base), &[("environment", environment)]),
                    |item| str_at(item, "/spec/display_name") == Some(name),
                )
                .await?
            }
            ResourceKind::ServiceAccount => {
                self.find_in_list(format!("{}/iam/v2/service-accounts", base), |item| {
                    item.get("display_name").and_then(Value::as_str) == Some(name)
                })
                .await?
            }
            ResourceKind::RoleBinding => {
                let principal = spec.require_str("principal")?;
                let role = spec.require_str("role_name")?;
                let crn = spec.require_str("crn_pattern")?;
                self.find_in_list(
                    with_query(
                        format!("{}/iam/v2/role-bindings", base),
                        &[("principal", principal), ("role_name", role)],
                    ),
                    |item| item.get("crn_pattern").and_then(Value::as_str) == Some(crn),
                )
                .await?
            }
            ResourceKind::ApiKey => {
                let owner = spec.require_str("owner_id")?;
                self.find_in_list(
                    with_query(format!("{}/iam/v2/api-keys", base), &[("spec.owner", owner)]),
                    |item| str_at(item, "/spec/display_name") == Some(name),
                )
                .await?
            }
            ResourceKind::ProviderIntegration => {
                let environment = spec.require_str("environment_id")?;
                self.find_in_list(
                    with_query(format!("{}/pim/v1/integrations", base), &[("environment", environment)]),
                    |item| item.get("display_name").and_then(Value::as_str) == Some(name),
                )
                .await?
            }
            ResourceKind::KafkaTopic => {
                let url = topic_url(spec)?;
                self.send(Method::GET, &format!("{}/{}", url, name), &self.scoped_credentials(spec), None)
                    .await?
            }
            ResourceKind::TableflowTopic => {
                let url = with_query(
                    format!("{}/tableflow/v1/tableflow-topics/{}", base, urlencoding::encode(name)),
                    &[
                        ("environment", spec.require_str("environment_id")?),
                        ("spec.kafka_cluster", spec.require_str("cluster_id")?),
                    ],
                );
                self.send(Method::GET, &url, &self.scoped_credentials(spec), None).await?
            }
            ResourceKind::Connector => {
                let url = format!("{}/{}", connectors_url(base, spec)?, name);
                self.send(Method::GET, &url, &self.cloud_credentials(), None).await?
            }
            other => {
                return Err(PlatformError::Unsupported {
                    platform: PlatformKind::Confluent,
                    kind: other,
                })
            }
        };

        Ok(found.map(|body| to_ref(spec, &body)))
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef, PlatformError> {
        let name = spec.name.as_str();
        let base = &self.base_url;
        let cloud = self.cloud_credentials();

        let (url, body, credentials) = match spec.kind {
            ResourceKind::Environment => (
                format!("{}/org/v2/environments", base),
                json!({
                    "display_name": name,
                    "stream_governance_config": {
                        "package": spec.str_prop("stream_governance").unwrap_or("ESSENTIALS"),
                    },
                }),
                cloud,
            ),
            ResourceKind::KafkaCluster => (
                format!("{}/cmk/v2/clusters", base),
                json!({
                    "spec": {
                        "display_name": name,
                        "availability": spec.str_prop("availability").unwrap_or("SINGLE_ZONE"),
                        "cloud": spec.str_prop("cloud").unwrap_or("AWS"),
                        "region": spec.require_str("region")?,
                        "config": { "kind": spec.str_prop("cluster_type").unwrap_or("Standard") },
                        "environment": { "id": spec.require_str("environment_id")? },
                    },
                }),
                cloud,
            ),
            ResourceKind::ServiceAccount => (
                format!("{}/iam/v2/service-accounts", base),
                json!({
                    "display_name": name,
                    "description": spec.str_prop("description").unwrap_or_default(),
                }),
                cloud,
            ),
            ResourceKind::RoleBinding => (
                format!("{}/iam/v2/role-bindings", base),
                json!({
                    "principal": spec.require_str("principal")?,
                    "role_name": spec.require_str("role_name")?,
                    "crn_pattern": spec.require_str("crn_pattern")?,
                }),
                cloud,
            ),
            ResourceKind::ApiKey => {
                let mut resource = json!({ "id": spec.require_str("resource_id")? });
                if let Some(environment) = spec.str_prop("environment_id") {
                    resource["environment"] = json!({ "id": environment });
                }
                (
                    format!("{}/iam/v2/api-keys", base),
                    json!({
                        "spec": {
                            "display_name": name,
                            "description": spec.str_prop("description").unwrap_or_default(),
                            "owner": { "id": spec.require_str("owner_id")? },
                            "resource": resource,
                        },
                    }),
                    cloud,
                )
            }
            ResourceKind::ProviderIntegration => (
                format!("{}/pim/v1/integrations", base),
                json!({
                    "display_name": name,
                    "provider": "aws",
                    "config": {
                        "kind": "AwsIntegrationConfig",
                        "customer_iam_role_arn": spec.require_str("customer_role_arn")?,
                    },
                    "environment": { "id": spec.require_str("environment_id")? },
                }),
                cloud,
            ),
            ResourceKind::KafkaTopic => {
                let configs: Vec<Value> = spec
                    .get("config")
                    .and_then(Value::as_object)
                    .map(|config| {
                        config
                            .iter()
                            .map(|(k, v)| json!({ "name": k, "value": v }))
                            .collect()
                    })
                    .unwrap_or_default();
                (
                    topic_url(spec)?,
                    json!({
                        "topic_name": name,
                        "partitions_count": spec.get("partitions").and_then(Value::as_u64).unwrap_or(1),
                        "configs": configs,
                    }),
                    self.scoped_credentials(spec),
                )
            }
            ResourceKind::TableflowTopic => (
                format!("{}/tableflow/v1/tableflow-topics", base),
                json!({
                    "spec": {
                        "display_name": name,
                        "table_formats": spec.str_list("table_formats"),
                        "environment": { "id": spec.require_str("environment_id")? },
                        "kafka_cluster": { "id": spec.require_str("cluster_id")? },
                        "storage": {
                            "kind": "ByobAws",
                            "bucket_name": spec.require_str("bucket_name")?,
                            "provider_integration_id": spec.require_str("provider_integration_id")?,
                        },
                    },
                }),
                self.scoped_credentials(spec),
            ),
            ResourceKind::Connector => (
                connectors_url(base, spec)?,
                json!({ "name": name, "config": connector_config(spec) }),
                cloud,
            ),
            other => {
                return Err(PlatformError::Unsupported {
                    platform: PlatformKind::Confluent,
                    kind: other,
                })
            }
        };

        let created = self
            .send_expect(Method::POST, &url, &credentials, Some(&body), spec)
            .await?;
        Ok(to_ref(spec, &created))
    }

    async fn update(&self, spec: &ResourceSpec, existing: ResourceRef) -> Result<Applied, PlatformError> {
        match spec.kind {
            ResourceKind::ProviderIntegration => {
                let desired = spec.require_str("customer_role_arn")?;
                if existing.attr(attr::CUSTOMER_ROLE_ARN) == Some(desired) {
                    return Ok(Applied::unchanged(existing));
                }
                let url = format!("{}/pim/v1/integrations/{}", self.base_url, existing.id);
                let body = json!({
                    "config": { "kind": "AwsIntegrationConfig", "customer_iam_role_arn": desired },
                    "environment": { "id": spec.require_str("environment_id")? },
                });
                let updated = self
                    .send_expect(Method::PATCH, &url, &self.cloud_credentials(), Some(&body), spec)
                    .await?;
                Ok(Applied::updated(to_ref(spec, &updated)))
            }
            ResourceKind::Connector => {
                let url = format!("{}/{}/config", connectors_url(&self.base_url, spec)?, spec.name);
                let current = self
                    .send(Method::GET, &url, &self.cloud_credentials(), None)
                    .await?
                    .unwrap_or(Value::Null);
                let drifted = spec
                    .get("config")
                    .and_then(Value::as_object)
                    .map(|desired| desired.iter().any(|(k, v)| current.get(k) != Some(v)))
                    .unwrap_or(false);
                if !drifted {
                    return Ok(Applied::unchanged(existing));
                }
                let body = connector_config(spec);
                self.send_expect(Method::PUT, &url, &self.cloud_credentials(), Some(&body), spec)
                    .await?;
                Ok(Applied::updated(existing))
            }
            _ => Ok(Applied::unchanged(existing)),
        }
    }
}

#[async_trait]
impl Platform for ConfluentPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Confluent
    }

    async fn lookup(&self, spec: &ResourceSpec) -> Result<Option<ResourceRef>, PlatformError> {
        self.find(spec).await
    }

    async fn apply(&self, spec: &ResourceSpec) -> Result<Applied, PlatformError> {
        match self.find(spec).await? {
            Some(existing) => self.update(spec, existing).await,
            None => {
                let created = self.create(spec).await?;
                info!(kind = %spec.kind, name = %spec.name, id = %created.id, "Created Confluent resource");
                Ok(Applied::created(created))
            }
        }
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn topic_url(spec: &ResourceSpec) -> Result<String, PlatformError> {
    Ok(format!(
        "{}/kafka/v3/clusters/{}/topics",
        spec.require_str("rest_endpoint")?.trim_end_matches('/'),
        spec.require_str("cluster_id")?
    ))
}

/// Append `params` as an encoded query string
fn with_query(url: String, params: &[(&str, &str)]) -> String {
    let query: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect();
    format!("{}?{}", url, query.join("&"))
}

fn connectors_url(base: &str, spec: &ResourceSpec) -> Result<String, PlatformError> {
    Ok(format!(
        "{}/connect/v1/environments/{}/clusters/{}/connectors",
        base,
        spec.require_str("environment_id")?,
        spec.require_str("cluster_id")?
    ))
}

/// Connector config with sensitive values merged in
fn connector_config(spec: &ResourceSpec) -> Value {
    let mut config = spec
        .get("config")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    for (key, value) in &spec.sensitive {
        config.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(config)
}

/// Pull the most useful message out of an error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            str_at(&v, "/errors/0/detail")
                .or_else(|| str_at(&v, "/message"))
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

/// Translate an API object into a reference with the attributes callers rely on
fn to_ref(spec: &ResourceSpec, body: &Value) -> ResourceRef {
    let id = match spec.kind {
        ResourceKind::KafkaTopic => str_at(body, "/topic_name").unwrap_or(&spec.name),
        ResourceKind::TableflowTopic => str_at(body, "/spec/display_name").unwrap_or(&spec.name),
        ResourceKind::Connector => str_at(body, "/name").unwrap_or(&spec.name),
        _ => str_at(body, "/id").unwrap_or_default(),
    };
    let mut r = ResourceRef::new(spec.kind, &spec.name, id);

    if let Some(crn) = str_at(body, "/metadata/resource_name") {
        r = r.with_attr(attr::RESOURCE_NAME, crn);
    }

    match spec.kind {
        ResourceKind::KafkaCluster => {
            if let Some(rest) = str_at(body, "/spec/http_endpoint") {
                r = r.with_attr(attr::REST_ENDPOINT, rest);
            }
            if let Some(bootstrap) = str_at(body, "/spec/kafka_bootstrap_endpoint") {
                r = r.with_attr(attr::BOOTSTRAP_ENDPOINT, bootstrap);
            }
        }
        ResourceKind::ApiKey => {
            if let Some(secret) = str_at(body, "/spec/secret").filter(|s| !s.is_empty()) {
                r = r.with_attr(attr::SECRET, secret);
            }
        }
        ResourceKind::ProviderIntegration => {
            for (pointer, key) in [
                ("/config/iam_role_arn", attr::IAM_ROLE_ARN),
                ("/config/external_id", attr::EXTERNAL_ID),
                ("/config/customer_iam_role_arn", attr::CUSTOMER_ROLE_ARN),
            ] {
                if let Some(value) = str_at(body, pointer) {
                    r = r.with_attr(key, value);
                }
            }
        }
        _ => {}
    }

    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_values_are_encoded() {
        let url = with_query(
            "https://api.confluent.cloud/iam/v2/role-bindings".to_string(),
            &[
                ("principal", "User:sa-abc123"),
                ("role_name", "EnvironmentAdmin"),
                ("crn", "crn://confluent.cloud/organization=1/environment=env-1"),
            ],
        );
        assert_eq!(
            url,
            "https://api.confluent.cloud/iam/v2/role-bindings?principal=User%3Asa-abc123&role_name=EnvironmentAdmin\
             &crn=crn%3A%2F%2Fconfluent.cloud%2Forganization%3D1%2Fenvironment%3Denv-1"
        );
    }

    #[test]
    fn test_provider_integration_ref() {
        let spec = ResourceSpec::new(ResourceKind::ProviderIntegration, "demo-tableflow-s3-integration");
        let body = json!({
            "id": "cspi-4xg0q",
            "display_name": "demo-tableflow-s3-integration",
            "provider": "aws",
            "config": {
                "kind": "AwsIntegrationConfig",
                "iam_role_arn": "arn:aws:iam::000000000000:role/confluent-tableflow",
                "external_id": "f6c1b2a3",
                "customer_iam_role_arn": "arn:aws:iam::123456789012:role/demo-tableflow-access-role"
            }
        });

        let r = to_ref(&spec, &body);
        assert_eq!(r.id, "cspi-4xg0q");
        assert_eq!(r.attr(attr::IAM_ROLE_ARN), Some("arn:aws:iam::000000000000:role/confluent-tableflow"));
        assert_eq!(r.attr(attr::EXTERNAL_ID), Some("f6c1b2a3"));
    }

    #[test]
    fn test_cluster_ref_endpoints() {
        let spec = ResourceSpec::new(ResourceKind::KafkaCluster, "demo-cluster");
        let body = json!({
            "id": "lkc-abc12",
            "spec": {
                "http_endpoint": "https://pkc-1.eu-central-1.aws.confluent.cloud:443",
                "kafka_bootstrap_endpoint": "SASL_SSL://pkc-1.eu-central-1.aws.confluent.cloud:9092"
            },
            "metadata": { "resource_name": "crn://confluent.cloud/kafka=lkc-abc12" }
        });

        let r = to_ref(&spec, &body);
        assert_eq!(r.attr(attr::REST_ENDPOINT), Some("https://pkc-1.eu-central-1.aws.confluent.cloud:443"));
        assert!(r.attr(attr::RESOURCE_NAME).is_some());
    }

    #[test]
    fn test_connector_config_merges_sensitive() {
        let spec = ResourceSpec::new(ResourceKind::Connector, "cdc")
            .property("config", json!({ "connector.class": "OracleXStreamSource" }))
            .sensitive("database.password", "hunter2");

        let config = connector_config(&spec);
        assert_eq!(config["connector.class"], "OracleXStreamSource");
        assert_eq!(config["database.password"], "hunter2");
    }

    #[test]
    fn test_error_message_prefers_detail() {
        let body = r#"{"errors":[{"status":"409","detail":"Service name is already in use."}]}"#;
        assert_eq!(error_message(body), "Service name is already in use.");
        assert_eq!(error_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn test_topic_url_requires_endpoint() {
        let spec = ResourceSpec::new(ResourceKind::KafkaTopic, "rds1.ADMIN.PHARMA_EVENT")
            .property("cluster_id", "lkc-abc12");
        assert!(topic_url(&spec).is_err());

        let spec = spec.property("rest_endpoint", "https://pkc-1.aws.confluent.cloud:443/");
        assert_eq!(
            topic_url(&spec).unwrap(),
            "https://pkc-1.aws.confluent.cloud:443/kafka/v3/clusters/lkc-abc12/topics"
        );
    }
}
