//! Node selection (`-m` / `--select`)
//!
//! Supports space-separated selectors (union) of the forms:
//! - `view_model`, `model.project.view_model`
//! - `resource_type:seed`, `path:models/staging`
//! - graph operators `+view_model`, `view_model+`, `2+view_model+1`

use crate::dag::NodeId;
use crate::graph::CurrentGraph;
use crate::manifest::{ManifestNode, NodeKind};
use std::collections::BTreeSet;

/// How far a graph operator reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Unbounded,
    Levels(usize),
}

impl Depth {
    fn limit(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Levels(n) => Some(n),
        }
    }
}

/// What a single selector matches on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorMethod {
    /// Node name, unique_id or dotted fqn
    Name(String),

    /// `resource_type:<kind>`
    ResourceType(NodeKind),

    /// `path:<prefix>` against the original file path
    Path(String),
}

/// One space-separated selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorItem {
    pub method: SelectorMethod,
    pub parents: Option<Depth>,
    pub children: Option<Depth>,
}

/// Parsed selection expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    raw: String,
    items: Vec<SelectorItem>,
}

/// Parses selection expressions
pub struct GraphSelector;

impl GraphSelector {
    /// Parse a selection expression
    pub fn parse(expr: &str) -> Result<Selection, SelectorError> {
        let items = expr
            .split_whitespace()
            .map(Self::parse_item)
            .collect::<Result<Vec<_>, _>>()?;

        if items.is_empty() {
            return Err(SelectorError::Empty);
        }

        Ok(Selection {
            raw: expr.to_string(),
            items,
        })
    }

    /// Select every node, or the parsed expression's nodes
    pub fn select(graph: &CurrentGraph, expr: Option<&str>) -> Result<BTreeSet<NodeId>, SelectorError> {
        match expr {
            Some(expr) => Ok(Self::parse(expr)?.select(graph)),
            None => Ok(graph.nodes().map(|node| node.unique_id.clone()).collect()),
        }
    }

    fn parse_item(item: &str) -> Result<SelectorItem, SelectorError> {
        let invalid = || SelectorError::Invalid(item.to_string());

        let (parents, rest) = match item.find('+') {
            Some(pos) if item[..pos].chars().all(|c| c.is_ascii_digit()) => {
                let depth = if pos == 0 {
                    Depth::Unbounded
                } else {
                    Depth::Levels(item[..pos].parse().map_err(|_| invalid())?)
                };
                (Some(depth), &item[pos + 1..])
            }
            _ => (None, item),
        };

        let (children, body) = match rest.rfind('+') {
            Some(pos) if rest[pos + 1..].chars().all(|c| c.is_ascii_digit()) => {
                let digits = &rest[pos + 1..];
                let depth = if digits.is_empty() {
                    Depth::Unbounded
                } else {
                    Depth::Levels(digits.parse().map_err(|_| invalid())?)
                };
                (Some(depth), &rest[..pos])
            }
            _ => (None, rest),
        };

        if body.is_empty() || body.contains('+') {
            return Err(invalid());
        }

        let method = match body.split_once(':') {
            Some(("resource_type", kind)) => SelectorMethod::ResourceType(
                NodeKind::parse(kind).ok_or_else(|| SelectorError::UnknownResourceType(kind.to_string()))?,
            ),
            Some(("path", prefix)) if !prefix.is_empty() => SelectorMethod::Path(prefix.to_string()),
            Some(("path", _)) => return Err(invalid()),
            Some((method, _)) => return Err(SelectorError::UnknownMethod(method.to_string())),
            None => SelectorMethod::Name(body.to_string()),
        };

        Ok(SelectorItem {
            method,
            parents,
            children,
        })
    }
}

impl Selection {
    /// The expression as written
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn items(&self) -> &[SelectorItem] {
        &self.items
    }

    /// Resolve against a graph; only defined nodes are returned
    pub fn select(&self, graph: &CurrentGraph) -> BTreeSet<NodeId> {
        let mut selected = BTreeSet::new();

        for item in &self.items {
            let matched: Vec<&ManifestNode> = graph.nodes().filter(|node| item.matches(node)).collect();

            if matched.is_empty() {
                tracing::warn!(selector = %self.raw, "selector matched no nodes");
            }

            for node in matched {
                selected.insert(node.unique_id.clone());

                if let Some(depth) = item.parents {
                    selected.extend(graph.dag().upstream_within(&node.unique_id, depth.limit()));
                }
                if let Some(depth) = item.children {
                    selected.extend(graph.dag().downstream_within(&node.unique_id, depth.limit()));
                }
            }
        }

        selected.retain(|id| graph.contains(id));
        selected
    }
}

impl SelectorItem {
    fn matches(&self, node: &ManifestNode) -> bool {
        match &self.method {
            SelectorMethod::Name(name) => {
                node.name == *name || node.unique_id == *name || node.fqn.join(".") == *name
            }
            SelectorMethod::ResourceType(kind) => node.resource_type == *kind,
            SelectorMethod::Path(prefix) => node.original_file_path.starts_with(prefix.as_str()),
        }
    }
}

/// Selection syntax errors
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("Empty selection")]
    Empty,

    #[error("Invalid selector '{0}'")]
    Invalid(String),

    #[error("Unknown selector method '{0}' (supported: resource_type, path)")]
    UnknownMethod(String),

    #[error("Unknown resource type '{0}'")]
    UnknownResourceType(String),
}
