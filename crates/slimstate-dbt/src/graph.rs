//! The two graphs deferral reconciles
//!
//! `StateManifest` is the frozen snapshot loaded from `--state`.
//! `CurrentGraph` is this invocation's graph with the active target applied.

use crate::dag::{DependencyGraph, NodeId};
use crate::manifest::{Manifest, ManifestError, ManifestNode, ManifestSource};
use slimstate_core::TargetConfig;
use std::path::{Path, PathBuf};

/// File name of the manifest inside a state directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Read-only snapshot of a prior build graph
#[derive(Debug, Clone, PartialEq)]
pub struct StateManifest {
    manifest: Manifest,
    path: Option<PathBuf>,
}

impl StateManifest {
    /// Load `<state_dir>/manifest.json`
    pub fn load(state_dir: &Path) -> Result<Self, ManifestError> {
        let path = state_dir.join(MANIFEST_FILE);
        let manifest = Manifest::from_file(&path)?;

        tracing::debug!(path = %path.display(), nodes = manifest.nodes.len(), "loaded state manifest");

        Ok(Self {
            manifest,
            path: Some(path),
        })
    }

    /// Wrap an in-memory manifest
    pub fn from_manifest(manifest: Manifest) -> Self {
        Self { manifest, path: None }
    }

    pub fn get(&self, unique_id: &str) -> Option<&ManifestNode> {
        self.manifest.get_node(unique_id)
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.manifest.nodes.contains_key(unique_id)
    }

    pub fn len(&self) -> usize {
        self.manifest.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.nodes.is_empty()
    }

    /// Where the snapshot was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

/// A `depends_on` edge whose target is not defined in the current graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DanglingDependency {
    /// Node declaring the dependency
    pub child: NodeId,

    /// Missing upstream id
    pub missing: NodeId,
}

/// The graph being built in this invocation
#[derive(Debug, Clone)]
pub struct CurrentGraph {
    manifest: Manifest,
    dag: DependencyGraph,
    target: TargetConfig,
}

impl CurrentGraph {
    /// Apply `target` to a parsed manifest
    ///
    /// Disabled nodes are dropped. Every remaining node gets its current
    /// environment qualifiers; any leftover `deferred` flag or compiled code
    /// from a previous invocation is cleared.
    pub fn build(mut manifest: Manifest, target: &TargetConfig) -> Self {
        manifest.nodes.retain(|_, node| node.config.enabled);

        for node in manifest.nodes.values_mut() {
            node.database = Some(
                node.config
                    .database
                    .clone()
                    .unwrap_or_else(|| target.database.clone()),
            );
            node.schema = Some(target.schema_for(node.config.schema.as_deref()));
            node.alias = Some(node.config.alias.clone().unwrap_or_else(|| node.name.clone()));
            node.deferred = false;
            node.compiled_code = None;
        }

        manifest.metadata.target_name = Some(target.name.clone());

        let dag = DependencyGraph::from_manifest(&manifest);

        tracing::debug!(
            target = %target.name,
            nodes = manifest.nodes.len(),
            sources = manifest.sources.len(),
            "built current graph"
        );

        Self {
            manifest,
            dag,
            target: target.clone(),
        }
    }

    pub fn node(&self, unique_id: &str) -> Option<&ManifestNode> {
        self.manifest.nodes.get(unique_id)
    }

    pub fn node_mut(&mut self, unique_id: &str) -> Option<&mut ManifestNode> {
        self.manifest.nodes.get_mut(unique_id)
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.manifest.nodes.contains_key(unique_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ManifestNode> {
        self.manifest.nodes.values()
    }

    pub fn source(&self, unique_id: &str) -> Option<&ManifestSource> {
        self.manifest.get_source(unique_id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &ManifestSource> {
        self.manifest.sources.values()
    }

    pub fn dag(&self) -> &DependencyGraph {
        &self.dag
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn into_manifest(self) -> Manifest {
        self.manifest
    }

    /// Replace or add a node record
    ///
    /// Edges are not rebuilt: traversal keeps following the current
    /// definition's dependencies.
    pub fn substitute(&mut self, node: ManifestNode) {
        self.manifest.insert_node(node);
    }

    /// Find a refable node by name, optionally restricted to a package
    ///
    /// Nodes from the root package win over same-named nodes elsewhere.
    pub fn find_refable(&self, package: Option<&str>, name: &str) -> Option<&ManifestNode> {
        let mut candidates: Vec<&ManifestNode> = self
            .nodes()
            .filter(|node| node.is_refable() && node.name == name)
            .filter(|node| package.map_or(true, |p| node.package_name == p))
            .collect();

        candidates.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        candidates
            .iter()
            .find(|node| Some(node.package_name.as_str()) == self.root_package())
            .or_else(|| candidates.first())
            .copied()
    }

    /// Find a source by source name and table name
    pub fn find_source(&self, source_name: &str, table: &str) -> Option<&ManifestSource> {
        self.sources()
            .find(|source| source.source_name == source_name && source.name == table)
    }

    fn root_package(&self) -> Option<&str> {
        self.manifest.metadata.project_name.as_deref()
    }

    /// Edges pointing at ids that are neither nodes nor sources
    pub fn dangling_dependencies(&self) -> Vec<DanglingDependency> {
        let mut dangling: Vec<DanglingDependency> = self
            .nodes()
            .flat_map(|node| {
                node.depends_on.nodes.iter().map(move |dep| (node, dep))
            })
            .filter(|(_, dep)| !self.contains(dep) && self.source(dep).is_none())
            .map(|(node, dep)| DanglingDependency {
                child: node.unique_id.clone(),
                missing: dep.clone(),
            })
            .collect();

        dangling.sort();
        dangling.dedup();
        dangling
    }
}
