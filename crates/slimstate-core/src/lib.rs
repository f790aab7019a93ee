//! slimstate core
//!
//! Project configuration, target profiles, deferral flags and the stable
//! run-results schema.
//! Field names in `report` are part of the artifact format - add, never rename.

pub mod config;
pub mod policy;
pub mod relation;
pub mod report;

pub use config::{Config, ConfigError, TargetConfig, WarehouseConfig};
pub use policy::{DeferralPolicy, PolicyError};
pub use relation::Relation;
pub use report::{InvocationInfo, NodeResult, NodeStatus, ReportVersion, RunReport, RunSummary};
