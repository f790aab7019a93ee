//! Dependency graph (DAG) construction and traversal
//!
//! Forward and reverse edges over unique ids. Ids referenced through
//! `depends_on` but not defined anywhere stay in the graph so callers can
//! see them (deleted upstreams).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use crate::manifest::Manifest;

/// Node identifier (unique_id from manifest)
pub type NodeId = String;

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: node -> list of nodes it depends on (parents)
    parents: HashMap<NodeId, Vec<NodeId>>,

    /// Reverse edges: node -> list of nodes that depend on it (children)
    children: HashMap<NodeId, Vec<NodeId>>,

    /// All ids in the graph, including undefined dependency targets
    nodes: BTreeSet<NodeId>,
}

impl DependencyGraph {
    /// Build a dependency graph from a manifest's `depends_on` lists
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut graph = Self::default();

        for source_id in manifest.sources.keys() {
            graph.nodes.insert(source_id.clone());
        }

        for (node_id, node) in &manifest.nodes {
            graph.add_node(node_id, &node.depends_on.nodes);
        }

        graph
    }

    /// Add a node and its parent edges
    pub fn add_node(&mut self, node_id: &str, depends_on: &[NodeId]) {
        self.nodes.insert(node_id.to_string());

        for dep_id in depends_on {
            self.nodes.insert(dep_id.clone());

            let parents = self.parents.entry(node_id.to_string()).or_default();
            if !parents.contains(dep_id) {
                parents.push(dep_id.clone());
                self.children
                    .entry(dep_id.clone())
                    .or_default()
                    .push(node_id.to_string());
            }
        }
    }

    /// Get all nodes in the graph
    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    /// Get immediate parents (dependencies) of a node
    pub fn parents(&self, node_id: &str) -> &[NodeId] {
        self.parents.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Get immediate children (dependents) of a node
    pub fn children(&self, node_id: &str) -> &[NodeId] {
        self.children.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Get all downstream nodes (transitive closure of children)
    pub fn downstream(&self, node_id: &str) -> Vec<NodeId> {
        Self::walk(&self.children, node_id, None)
    }

    /// Get all upstream nodes (transitive closure of parents)
    pub fn upstream(&self, node_id: &str) -> Vec<NodeId> {
        Self::walk(&self.parents, node_id, None)
    }

    /// Downstream nodes at most `depth` edges away (`None` = unbounded)
    pub fn downstream_within(&self, node_id: &str, depth: Option<usize>) -> Vec<NodeId> {
        Self::walk(&self.children, node_id, depth)
    }

    /// Upstream nodes at most `depth` edges away (`None` = unbounded)
    pub fn upstream_within(&self, node_id: &str, depth: Option<usize>) -> Vec<NodeId> {
        Self::walk(&self.parents, node_id, depth)
    }

    /// Union of a set of nodes and everything upstream of them
    pub fn upstream_closure<'a>(&self, roots: impl IntoIterator<Item = &'a NodeId>) -> BTreeSet<NodeId> {
        let mut closure = BTreeSet::new();

        for root in roots {
            if closure.insert(root.clone()) {
                closure.extend(self.upstream(root));
            }
        }

        closure
    }

    /// BFS over one edge direction, excluding the start node
    fn walk(edges: &HashMap<NodeId, Vec<NodeId>>, start: &str, depth: Option<usize>) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::new();

        visited.insert(start.to_string());
        queue.push_back((start.to_string(), 0usize));

        while let Some((current, level)) = queue.pop_front() {
            if depth.is_some_and(|max| level >= max) {
                continue;
            }

            for next in edges.get(&current).into_iter().flatten() {
                if visited.insert(next.clone()) {
                    result.push(next.clone());
                    queue.push_back((next.clone(), level + 1));
                }
            }
        }

        result
    }

    /// Check if there's a path from source to target
    pub fn has_path(&self, source: &str, target: &str) -> bool {
        self.downstream(source).iter().any(|id| id == target)
    }

    /// Topological sort of all nodes, parents before children
    ///
    /// Ties are broken by id so the order is stable across runs.
    /// Returns `None` if the graph has a cycle.
    pub fn topological_sort(&self) -> Option<Vec<NodeId>> {
        let mut in_degree: BTreeMap<&NodeId, usize> = self
            .nodes
            .iter()
            .map(|id| (id, self.parents(id).len()))
            .collect();

        let mut ready: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        // Kahn's algorithm
        while let Some(node) = ready.pop_first() {
            result.push(node.clone());

            for child in self.children(node) {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(child);
                    }
                }
            }
        }

        // Every node visited means no cycles
        (result.len() == self.nodes.len()).then_some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chain() -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        graph.add_node("seed.p.seed", &[]);
        graph.add_node("model.p.ephemeral", &["seed.p.seed".to_string()]);
        graph.add_node("model.p.view_model", &["seed.p.seed".to_string()]);
        graph.add_node("model.p.table_model", &["model.p.ephemeral".to_string()]);
        graph.add_node("test.p.not_null", &["model.p.view_model".to_string()]);
        graph
    }

    #[test]
    fn parents_and_children() {
        let graph = chain();
        assert_eq!(graph.parents("model.p.table_model"), ["model.p.ephemeral".to_string()]);
        assert_eq!(graph.children("seed.p.seed").len(), 2);
        assert!(graph.parents("seed.p.seed").is_empty());
    }

    #[test]
    fn downstream_impact() {
        let graph = chain();
        let mut downstream = graph.downstream("seed.p.seed");
        downstream.sort();
        assert_eq!(
            downstream,
            vec![
                "model.p.ephemeral".to_string(),
                "model.p.table_model".to_string(),
                "model.p.view_model".to_string(),
                "test.p.not_null".to_string(),
            ]
        );
        assert!(graph.has_path("seed.p.seed", "test.p.not_null"));
        assert!(!graph.has_path("model.p.view_model", "model.p.table_model"));
    }

    #[test]
    fn depth_limited_walk() {
        let graph = chain();
        assert_eq!(
            graph.upstream_within("model.p.table_model", Some(1)),
            vec!["model.p.ephemeral".to_string()]
        );
        assert_eq!(graph.upstream("model.p.table_model").len(), 2);
    }

    #[test]
    fn upstream_closure_includes_roots() {
        let graph = chain();
        let roots = vec!["test.p.not_null".to_string()];
        let closure = graph.upstream_closure(&roots);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec![
                "model.p.view_model".to_string(),
                "seed.p.seed".to_string(),
                "test.p.not_null".to_string(),
            ]
        );
    }

    #[test]
    fn undefined_parent_is_kept() {
        let mut graph = DependencyGraph::default();
        graph.add_node("model.p.view_model", &["model.p.deleted".to_string()]);
        assert!(graph.contains("model.p.deleted"));
    }

    #[test]
    fn topological_order_is_stable() {
        let graph = chain();
        let order = graph.topological_sort().unwrap();
        let position = |id: &str| order.iter().position(|n| n == id).unwrap();

        assert_eq!(order[0], "seed.p.seed");
        assert!(position("model.p.ephemeral") < position("model.p.table_model"));
        assert!(position("model.p.view_model") < position("test.p.not_null"));
        assert_eq!(order, graph.topological_sort().unwrap());
    }

    #[test]
    fn cycle_has_no_order() {
        let mut graph = DependencyGraph::default();
        graph.add_node("model.p.a", &["model.p.b".to_string()]);
        graph.add_node("model.p.b", &["model.p.a".to_string()]);
        assert_eq!(graph.topological_sort(), None);
    }
}
