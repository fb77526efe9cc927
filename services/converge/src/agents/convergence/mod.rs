//! Convergence Core
//!
//! Staged convergence of the two linking roles that connect the cloud
//! account to the streaming and lakehouse platforms.
//!
//! Each platform's trust object must reference the other's identity, so a
//! single pass cannot create both. The [`StageCoordinator`] breaks the cycle:
//!
//! - **Bootstrap**: create both roles with a deny-all trust policy, which
//!   reserves their ARNs without granting access
//! - **Linked**: create the platform objects that reference those ARNs, then
//!   patch each role to trust exactly the principal/external-id pair the other
//!   platform hands out
//!
//! The stage is recomputed every run from what exists, and every run builds
//! its own [`ResourceRegistry`].

pub mod config;
pub mod coordinator;
mod foundation;
mod link;
pub mod outputs;
pub mod policy;
pub mod registry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{StackConfig, UNITY_MASTER_ROLE_ARN};
pub use coordinator::{RunContext, StageCoordinator};
pub use outputs::{JsonFileOutputs, MemoryOutputs, OutputStore, OutputValue};
pub use policy::PolicyDocument;
pub use registry::ResourceRegistry;
pub use types::{ConvergeError, LinkingRole, NamedIdentity, ResourceKey, RunReport, Stage};
