//! Stack Configuration
//!
//! Read-only inputs of a convergence run. Loaded from an optional JSON file
//! (camelCase keys) and then overridden from the command line.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::types::ConvergeError;
use crate::agents::lifecycle::CommandTriple;

/// Databricks' own Unity Catalog master role, trusted by the lakehouse role
pub const UNITY_MASTER_ROLE_ARN: &str =
    "arn:aws:iam::414351767826:role/unity-catalog-prod-UCMasterRole-14S5ZJVKOTYTL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    #[serde(default = "default_prefix")]
    pub resource_prefix: String,
    #[serde(default)]
    pub protect_resources: bool,
    #[serde(default)]
    pub default_tags: BTreeMap<String, String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Reuse this VPC instead of creating one
    #[serde(default)]
    pub vpc_id: Option<String>,
    /// CDC topics replicated through Tableflow
    #[serde(default = "default_datasets")]
    pub datasets: Vec<String>,
    /// Operator opt-in for the stage-two link pass
    #[serde(default)]
    pub enable_link: bool,
    #[serde(default)]
    pub rds: DatabaseConfig,
    #[serde(default)]
    pub dbx: LakehouseConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default = "default_catalog_commands")]
    pub catalog_integration: CommandTriple,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub instance_class: String,
    pub allocated_storage: u32,
    pub engine_version: String,
    pub db_name: String,
    pub db_username: String,
    /// CDC capture user
    pub cflt_user_name: String,
    #[serde(skip_serializing)]
    pub cflt_user_password: Option<String>,
    /// XStream outbound server
    pub xout_server_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            instance_class: "db.t3.small".to_string(),
            allocated_storage: 20,
            engine_version: "19.0.0.0.ru-2025-07.rur-2025-07.r1".to_string(),
            db_name: "ORCL".to_string(),
            db_username: "admin".to_string(),
            cflt_user_name: "c##cfltuser".to_string(),
            cflt_user_password: None,
            xout_server_name: "XOUT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LakehouseConfig {
    /// Workspace host; `DATABRICKS_HOST` wins when set
    pub host: Option<String>,
    /// Overrides the storage credential's external id in the role trust policy
    pub external_id: Option<String>,
    pub unity_master_role_arn: String,
}

impl Default for LakehouseConfig {
    fn default() -> Self {
        Self {
            host: None,
            external_id: None,
            unity_master_role_arn: UNITY_MASTER_ROLE_ARN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorConfig {
    /// JSON file with a `config` object of connector defaults
    pub defaults_path: Option<PathBuf>,
    pub topic_prefix: String,
    pub table_include_list: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            defaults_path: None,
            topic_prefix: "rds1".to_string(),
            table_include_list: "ADMIN.*".to_string(),
        }
    }
}

fn default_prefix() -> String {
    "demo".to_string()
}

fn default_region() -> String {
    "eu-central-1".to_string()
}

fn default_datasets() -> Vec<String> {
    vec![
        "rds1.ADMIN.PHARMA_DOSE_REGIMENS".to_string(),
        "rds1.ADMIN.PHARMA_EVENT".to_string(),
        "rds1.ADMIN.PHARMA_NOTES_ATTACH".to_string(),
    ]
}

fn default_catalog_commands() -> CommandTriple {
    CommandTriple {
        create_command: "./scripts/create_unity_integration.sh".to_string(),
        update_command: "./scripts/update_unity_integration.sh".to_string(),
        delete_command: "./scripts/delete_unity_integration.sh".to_string(),
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            resource_prefix: default_prefix(),
            protect_resources: false,
            default_tags: BTreeMap::new(),
            region: default_region(),
            vpc_id: None,
            datasets: default_datasets(),
            enable_link: false,
            rds: DatabaseConfig::default(),
            dbx: LakehouseConfig::default(),
            connector: ConnectorConfig::default(),
            catalog_integration: default_catalog_commands(),
        }
    }
}

impl StackConfig {
    /// Load a JSON config file
    pub fn from_file(path: &Path) -> Result<Self, ConvergeError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ConvergeError::Config(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConvergeError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConvergeError> {
        let prefix = &self.resource_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ConvergeError::Config(format!(
                "resourcePrefix '{}' must be non-empty lowercase letters, digits or '-'",
                prefix
            )));
        }

        if self.region.is_empty() {
            return Err(ConvergeError::Config("region must be set".to_string()));
        }

        let mut seen = BTreeSet::new();
        for dataset in &self.datasets {
            if dataset.is_empty() {
                return Err(ConvergeError::Config("dataset names must not be empty".to_string()));
            }
            if !seen.insert(dataset) {
                return Err(ConvergeError::Config(format!("dataset '{}' listed twice", dataset)));
            }
        }

        Ok(())
    }

    /// Configured VPC id, ignoring blank values
    pub fn existing_vpc(&self) -> Option<&str> {
        self.vpc_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Connector defaults from `connector.defaultsPath`, empty when unset
    pub fn connector_defaults(&self) -> Result<Map<String, Value>, ConvergeError> {
        let Some(path) = &self.connector.defaults_path else {
            return Ok(Map::new());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
            ConvergeError::Config(format!("invalid connector defaults {}: {}", path.display(), e))
        })?;
        Ok(parsed
            .get("config")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default())
    }
}
