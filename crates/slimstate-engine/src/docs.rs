//! catalog.json generation for `docs generate`
//!
//! Reads only the resolved graph: an entry points wherever resolution left
//! the node, deferred or not.

use serde::{Deserialize, Serialize};
use slimstate_catalog::{CatalogError, ExistenceOracle};
use slimstate_dbt::{CurrentGraph, NodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// File name of the docs catalog
pub const CATALOG_FILE: &str = "catalog.json";

/// Where a documented relation lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMetadata {
    pub database: String,
    pub schema: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub unique_id: NodeId,
    pub metadata: RelationMetadata,
    pub deferred: bool,
}

/// catalog.json
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub generated_at: String,

    /// Entries keyed by unique id
    pub nodes: BTreeMap<NodeId, CatalogEntry>,
}

impl Catalog {
    /// Build a catalog for `nodes` from existing relations
    ///
    /// Nodes without a relation (ephemeral, tests) are skipped. Every check
    /// goes to the oracle: relations may have been built since resolution.
    pub async fn generate(
        graph: &CurrentGraph,
        nodes: &BTreeSet<NodeId>,
        oracle: &dyn ExistenceOracle,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            nodes: BTreeMap::new(),
        };

        for node in nodes.iter().filter_map(|id| graph.node(id)) {
            if !node.is_refable() {
                continue;
            }
            let Some(relation) = node.relation() else {
                continue;
            };

            if !oracle.relation_exists(&relation).await? {
                tracing::debug!(node = %node.unique_id, relation = %relation.fqn(), "relation missing, not cataloged");
                continue;
            }

            catalog.nodes.insert(
                node.unique_id.clone(),
                CatalogEntry {
                    unique_id: node.unique_id.clone(),
                    metadata: RelationMetadata {
                        database: relation.database,
                        schema: relation.schema,
                        name: relation.identifier,
                    },
                    deferred: node.deferred,
                },
            );
        }

        tracing::info!(entries = catalog.nodes.len(), "generated catalog");
        Ok(catalog)
    }

    pub fn get(&self, unique_id: &str) -> Option<&CatalogEntry> {
        self.nodes.get(unique_id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimstate_catalog::MockWarehouseBuilder;
    use slimstate_core::TargetConfig;
    use slimstate_dbt::{DependsOn, Manifest, ManifestNode, NodeConfig, NodeKind};

    fn node(id: &str, kind: NodeKind) -> ManifestNode {
        let name = id.rsplit('.').next().unwrap().to_string();
        ManifestNode {
            unique_id: id.to_string(),
            name: name.clone(),
            resource_type: kind,
            package_name: "test".to_string(),
            path: String::new(),
            original_file_path: String::new(),
            database: None,
            schema: None,
            alias: None,
            config: NodeConfig::default(),
            raw_code: String::new(),
            compiled_code: None,
            depends_on: DependsOn::default(),
            fqn: vec![],
            deferred: false,
        }
    }

    fn graph() -> CurrentGraph {
        let mut manifest = Manifest::default();
        manifest.insert_node(node("seed.test.seed", NodeKind::Seed));
        manifest.insert_node(node("model.test.view_model", NodeKind::Model));
        manifest.insert_node(node("test.test.not_null_view_model_id", NodeKind::Test));
        CurrentGraph::build(manifest, &TargetConfig::new("default", "dbt", "dev"))
    }

    fn all(graph: &CurrentGraph) -> BTreeSet<NodeId> {
        graph.nodes().map(|node| node.unique_id.clone()).collect()
    }

    #[tokio::test]
    async fn only_existing_relations_are_cataloged() {
        let graph = graph();
        let warehouse = MockWarehouseBuilder::new().with_relation("dbt", "dev", "seed").build();

        let catalog = Catalog::generate(&graph, &all(&graph), &warehouse).await.unwrap();

        assert_eq!(catalog.nodes.len(), 1);
        let entry = catalog.get("seed.test.seed").unwrap();
        assert_eq!(entry.metadata.schema, "dev");
        assert!(!entry.deferred);
    }

    #[tokio::test]
    async fn empty_target_gives_empty_catalog() {
        let graph = graph();
        let warehouse = MockWarehouseBuilder::new().build();

        let catalog = Catalog::generate(&graph, &all(&graph), &warehouse).await.unwrap();
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn deferred_entries_point_at_state() {
        let mut graph = graph();
        let mut deferred = graph.node("seed.test.seed").unwrap().clone();
        deferred.schema = Some("prod".to_string());
        deferred.deferred = true;
        graph.substitute(deferred);

        let warehouse = MockWarehouseBuilder::new().with_relation("dbt", "prod", "seed").build();
        let catalog = Catalog::generate(&graph, &all(&graph), &warehouse).await.unwrap();

        let entry = catalog.get("seed.test.seed").unwrap();
        assert_eq!(entry.metadata.schema, "prod");
        assert!(entry.deferred);
    }
}
