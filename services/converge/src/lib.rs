//! Lakehouse Converge
//!
//! Staged convergence of the Oracle CDC -> Tableflow -> Unity Catalog stack
//! across AWS, Confluent Cloud and Databricks.

pub mod agents;
