//! Build-graph artifacts
//!
//! This crate handles:
//! - Parsing and writing manifest.json (current graph and prior state)
//! - Applying a target profile to produce the current graph
//! - Building dependency graphs (DAG)
//! - Node selection (`-m view_model+`)

pub mod manifest;
pub mod dag;
pub mod graph;
pub mod selector;

pub use manifest::{
    DependsOn, Manifest, ManifestError, ManifestMetadata, ManifestNode, ManifestSource, NodeConfig, NodeKind,
};
pub use dag::{DependencyGraph, NodeId};
pub use graph::{CurrentGraph, DanglingDependency, StateManifest};
pub use selector::{GraphSelector, Selection, SelectorError};
