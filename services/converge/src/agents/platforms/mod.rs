//! Platform Adapters
//!
//! Trait-based abstractions over the three external platforms the stack
//! spans. Every adapter speaks the same declarative vocabulary:
//!
//! - `lookup` is a read-only probe for the object a spec describes
//! - `apply` is lookup-or-create (or update in place) and never duplicates
//!
//! ## Adapters
//!
//! - [`AwsCliPlatform`]: IAM, networking, KMS, RDS and S3 through the `aws` CLI
//! - [`ConfluentPlatform`]: Confluent Cloud REST APIs (CMK, IAM, PIM, Tableflow, Connect)
//! - [`DatabricksPlatform`]: Databricks workspace SCIM and Unity Catalog REST APIs
//! - [`InMemoryPlatform`]: simulated platform for dry runs and tests

mod aws;
mod confluent;
mod databricks;
mod memory;
mod types;

pub use aws::AwsCliPlatform;
pub use confluent::ConfluentPlatform;
pub use databricks::DatabricksPlatform;
pub use memory::{InMemoryPlatform, StoredResource};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Trait for a platform that can probe and converge resources
#[async_trait]
pub trait Platform: Send + Sync {
    /// Get the platform type
    fn kind(&self) -> PlatformKind;

    /// Look up the object described by `spec` (by kind, name and any scoping
    /// properties such as an environment id).
    ///
    /// Returns `Ok(None)` when it does not exist. Adapters may instead
    /// surface `PlatformError::NotFound`; callers treat both the same way.
    async fn lookup(&self, spec: &ResourceSpec) -> Result<Option<ResourceRef>, PlatformError>;

    /// Converge the object described by `spec`
    async fn apply(&self, spec: &ResourceSpec) -> Result<Applied, PlatformError>;
}

/// The three platforms a convergence run talks to
#[derive(Clone)]
pub struct Platforms {
    /// Cloud account holding networking, storage and both linking roles
    pub aws: Arc<dyn Platform>,
    /// Streaming platform (Confluent Cloud)
    pub streaming: Arc<dyn Platform>,
    /// Lakehouse platform (Databricks)
    pub lakehouse: Arc<dyn Platform>,
}

impl Platforms {
    pub fn new(
        aws: Arc<dyn Platform>,
        streaming: Arc<dyn Platform>,
        lakehouse: Arc<dyn Platform>,
    ) -> Self {
        Self {
            aws,
            streaming,
            lakehouse,
        }
    }

    /// Simulated platforms - no external calls are made
    pub fn simulated(region: &str) -> Self {
        Self::new(
            Arc::new(InMemoryPlatform::new(PlatformKind::Aws, region)),
            Arc::new(InMemoryPlatform::new(PlatformKind::Confluent, region)),
            Arc::new(InMemoryPlatform::new(PlatformKind::Databricks, region)),
        )
    }

    /// Adapter owning resources of `kind`
    pub fn for_kind(&self, kind: ResourceKind) -> &Arc<dyn Platform> {
        match kind.platform() {
            PlatformKind::Aws => &self.aws,
            PlatformKind::Confluent => &self.streaming,
            PlatformKind::Databricks => &self.lakehouse,
        }
    }
}
