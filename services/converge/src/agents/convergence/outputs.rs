//! Exported Outputs
//!
//! Durable key/value exports that outlive a run. Stage one writes the
//! linking role ARNs here and stage two reads them back, which is how the
//! two passes hand identifiers to each other without re-deriving them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use super::types::ConvergeError;

/// Standard export keys
pub mod keys {
    pub const VPC_ID: &str = "aws_vpc_id";
    pub const SECURITY_GROUP_ID: &str = "aws_security_group_id";
    pub const TDE_KMS_KEY_ID: &str = "aws_tde_kms_key_id";
    pub const RDS_ENDPOINT: &str = "aws_rds_instance_endpoint";
    pub const TABLEFLOW_BUCKET: &str = "aws_tableflow_bucket_name";
    pub const CONFLUENT_ENVIRONMENT_ID: &str = "confluent_environment_id";
    pub const CONFLUENT_CLUSTER_ID: &str = "confluent_kafka_cluster_id";
    pub const PROVIDER_INTEGRATION_ID: &str = "confluent_provider_integration_id";
    pub const KAFKA_API_KEY: &str = "confluent_kafka_api_key";
    pub const KAFKA_API_SECRET: &str = "confluent_kafka_api_secret";
    pub const TABLEFLOW_API_KEY: &str = "confluent_tableflow_api_key";
    pub const TABLEFLOW_API_SECRET: &str = "confluent_tableflow_api_secret";
    pub const SERVICE_PRINCIPAL_SECRET: &str = "databricks_service_principal_secret";
    pub const CATALOG_NAME: &str = "databricks_catalog_name";
    pub const UNITY_INTEGRATION_ID: &str = "unity_integration_id";
    pub const UNITY_INTEGRATION_OUTPUT: &str = "unity_integration_output";
    pub const UNITY_INTEGRATION_CATALOG_ID: &str = "unity_integration_catalog_id";
}

/// An exported value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secret: bool,
}

impl OutputValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: true,
        }
    }

    /// Value safe to print
    pub fn display(&self) -> &str {
        if self.secret {
            "[secret]"
        } else {
            &self.value
        }
    }
}

/// Durable export set
pub trait OutputStore: Send {
    fn get(&self, key: &str) -> Option<&OutputValue>;

    fn set(&mut self, key: &str, value: OutputValue);

    fn remove(&mut self, key: &str) -> Option<OutputValue>;

    fn keys(&self) -> Vec<String>;

    /// Flush to durable storage
    fn persist(&mut self) -> Result<(), ConvergeError>;

    /// Plain value of `key`, if present and non-empty
    fn value(&self, key: &str) -> Option<&str> {
        self.get(key)
            .map(|v| v.value.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// Outputs held in memory only
#[derive(Debug, Default, Clone)]
pub struct MemoryOutputs {
    values: BTreeMap<String, OutputValue>,
    persisted: usize,
}

impl MemoryOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `persist` calls
    pub fn persist_count(&self) -> usize {
        self.persisted
    }
}

impl OutputStore for MemoryOutputs {
    fn get(&self, key: &str) -> Option<&OutputValue> {
        self.values.get(key)
    }

    fn set(&mut self, key: &str, value: OutputValue) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) -> Option<OutputValue> {
        self.values.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn persist(&mut self) -> Result<(), ConvergeError> {
        self.persisted += 1;
        Ok(())
    }
}

/// Outputs stored as a JSON object on disk
#[derive(Debug)]
pub struct JsonFileOutputs {
    path: PathBuf,
    values: BTreeMap<String, OutputValue>,
}

impl JsonFileOutputs {
    /// Open the store at `path`; a missing file is an empty store
    pub fn load(path: &Path) -> Result<Self, ConvergeError> {
        let values = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                ConvergeError::Outputs(format!("failed to read {}: {}", path.display(), e))
            })?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).map_err(|e| {
                    ConvergeError::Outputs(format!("invalid outputs file {}: {}", path.display(), e))
                })?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputStore for JsonFileOutputs {
    fn get(&self, key: &str) -> Option<&OutputValue> {
        self.values.get(key)
    }

    fn set(&mut self, key: &str, value: OutputValue) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) -> Option<OutputValue> {
        self.values.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn persist(&mut self) -> Result<(), ConvergeError> {
        let io_err = |e: std::io::Error| {
            ConvergeError::Outputs(format!("failed to write {}: {}", self.path.display(), e))
        };

        let parent = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                std::fs::create_dir_all(parent).map_err(io_err)?;
                parent
            }
            None => Path::new("."),
        };

        let body = serde_json::to_vec_pretty(&self.values)
            .map_err(|e| ConvergeError::Outputs(format!("failed to encode outputs: {}", e)))?;

        // Owner-only staging file beside the target, renamed over it
        let mut staging = NamedTempFile::new_in(parent).map_err(io_err)?;
        staging.write_all(&body).map_err(io_err)?;
        staging.as_file().sync_all().map_err(io_err)?;
        staging.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!(path = %self.path.display(), entries = self.values.len(), "Persisted outputs");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_json_outputs_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("outputs.json");

        let mut outputs = JsonFileOutputs::load(&path).unwrap();
        outputs.set("demo-tableflow-access-role", OutputValue::plain("arn:aws:iam::1:role/a"));
        outputs.set(keys::KAFKA_API_SECRET, OutputValue::secret("s3cr3t"));
        outputs.persist().unwrap();

        let reloaded = JsonFileOutputs::load(&path).unwrap();
        assert_eq!(reloaded.value("demo-tableflow-access-role"), Some("arn:aws:iam::1:role/a"));
        assert!(reloaded.get(keys::KAFKA_API_SECRET).unwrap().secret);

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_outputs_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("outputs.json");

        let mut outputs = JsonFileOutputs::load(&path).unwrap();
        outputs.set(keys::TABLEFLOW_API_SECRET, OutputValue::secret("s3cr3t"));
        outputs.persist().unwrap();
        outputs.set(keys::KAFKA_API_SECRET, OutputValue::secret("again"));
        outputs.persist().unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let outputs = JsonFileOutputs::load(&dir.path().join("absent.json")).unwrap();
        assert!(outputs.keys().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outputs.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(JsonFileOutputs::load(&path), Err(ConvergeError::Outputs(_))));
    }

    #[test]
    fn test_secret_values_are_masked() {
        let mut outputs = MemoryOutputs::new();
        outputs.set("k", OutputValue::secret("hunter2"));
        outputs.set("e", OutputValue::plain(""));

        assert_eq!(outputs.get("k").unwrap().display(), "[secret]");
        assert_eq!(outputs.value("e"), None);
    }
}
