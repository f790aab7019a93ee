//! manifest.json parsing and writing
//!
//! The same shape serves three roles: the parsed graph handed over by the
//! project parser, the prior-state snapshot loaded with `--state`, and the
//! resolved graph written back to `target/manifest.json` after an invocation.

use serde::{Deserialize, Serialize};
use slimstate_core::Relation;
use std::collections::HashMap;
use std::path::Path;

/// manifest.json structure (subset of fields we care about)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Metadata about the manifest
    #[serde(default)]
    pub metadata: ManifestMetadata,

    /// Model, seed, snapshot and test nodes
    #[serde(default)]
    pub nodes: HashMap<String, ManifestNode>,

    /// Source definitions
    #[serde(default)]
    pub sources: HashMap<String, ManifestSource>,
}

impl Manifest {
    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            return Err(ManifestError::NotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_str(&contents)
    }

    /// Parse manifest from JSON string
    pub fn from_str(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json)
            .map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, ManifestError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Write manifest to file, creating parent directories
    pub fn to_file(&self, path: &Path) -> Result<(), ManifestError> {
        let io_err = |e: std::io::Error| ManifestError::IoError(path.display().to_string(), e.to_string());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        std::fs::write(path, self.to_json()?).map_err(io_err)
    }

    /// Get all nodes of one kind
    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &ManifestNode> {
        self.nodes.values().filter(move |node| node.resource_type == kind)
    }

    /// Get a specific node by unique_id
    pub fn get_node(&self, unique_id: &str) -> Option<&ManifestNode> {
        self.nodes.get(unique_id)
    }

    /// Get a specific source by unique_id
    pub fn get_source(&self, unique_id: &str) -> Option<&ManifestSource> {
        self.sources.get(unique_id)
    }

    /// Insert a node keyed by its unique_id
    pub fn insert_node(&mut self, node: ManifestNode) {
        self.nodes.insert(node.unique_id.clone(), node);
    }
}

/// Manifest metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub schema_version: String,

    #[serde(default)]
    pub generated_at: String,

    #[serde(default)]
    pub invocation_id: Option<String>,

    /// Root project; its nodes win `ref()` name collisions
    #[serde(default)]
    pub project_name: Option<String>,

    /// Target the qualifiers in this manifest were resolved against
    #[serde(default)]
    pub target_name: Option<String>,
}

/// Kind of build-graph node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Model,
    Seed,
    Snapshot,
    Test,
    Analysis,
    Operation,
}

impl NodeKind {
    /// Kinds that can be the target of `ref()` and therefore of deferral
    pub fn is_refable(&self) -> bool {
        matches!(self, Self::Model | Self::Seed | Self::Snapshot)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Seed => "seed",
            Self::Snapshot => "snapshot",
            Self::Test => "test",
            Self::Analysis => "analysis",
            Self::Operation => "operation",
        }
    }

    /// Parse a resource type name as used in `resource_type:<kind>` selectors
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "model" => Some(Self::Model),
            "seed" => Some(Self::Seed),
            "snapshot" => Some(Self::Snapshot),
            "test" => Some(Self::Test),
            "analysis" => Some(Self::Analysis),
            "operation" => Some(Self::Operation),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node in the manifest (model, seed, snapshot, test, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// Unique identifier (e.g., "model.my_project.users")
    pub unique_id: String,

    /// Node name (e.g., "users")
    pub name: String,

    /// Resource type
    pub resource_type: NodeKind,

    /// Package name
    pub package_name: String,

    /// Relative path to the definition file
    #[serde(default)]
    pub path: String,

    /// Original file path
    #[serde(default)]
    pub original_file_path: String,

    /// Database name
    #[serde(default)]
    pub database: Option<String>,

    /// Schema name
    #[serde(default)]
    pub schema: Option<String>,

    /// Alias (output relation name)
    #[serde(default)]
    pub alias: Option<String>,

    /// Node configuration
    #[serde(default)]
    pub config: NodeConfig,

    /// Template source
    #[serde(default)]
    pub raw_code: String,

    /// Rendered SQL (set after compilation)
    #[serde(default)]
    pub compiled_code: Option<String>,

    /// Dependencies
    #[serde(default)]
    pub depends_on: DependsOn,

    /// Fully qualified name
    #[serde(default)]
    pub fqn: Vec<String>,

    /// Whether this record was taken from prior state
    #[serde(default)]
    pub deferred: bool,
}

impl ManifestNode {
    /// Relation the node builds into, if it has one
    ///
    /// Ephemeral models and nodes without qualifiers have no relation.
    pub fn relation(&self) -> Option<Relation> {
        if self.is_ephemeral() {
            return None;
        }

        Some(Relation::new(
            self.database.clone()?,
            self.schema.clone()?,
            self.identifier(),
        ))
    }

    /// Output relation name
    pub fn identifier(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.name.clone())
    }

    pub fn is_refable(&self) -> bool {
        self.resource_type.is_refable()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.config.materialized.as_deref() == Some("ephemeral")
    }

    /// Materialization, defaulting per resource type
    pub fn materialization(&self) -> &str {
        match (&self.config.materialized, self.resource_type) {
            (Some(m), _) => m,
            (None, NodeKind::Seed) => "seed",
            (None, NodeKind::Snapshot) => "snapshot",
            (None, NodeKind::Test) => "test",
            (None, _) => "view",
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Whether the node is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Materialization type
    #[serde(default)]
    pub materialized: Option<String>,

    /// Custom schema (suffixed onto the target schema)
    #[serde(default)]
    pub schema: Option<String>,

    /// Database override
    #[serde(default)]
    pub database: Option<String>,

    /// Alias override
    #[serde(default)]
    pub alias: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            materialized: None,
            schema: None,
            database: None,
            alias: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Dependencies structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    /// List of node unique_ids this node depends on
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// A source in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSource {
    /// Unique identifier (e.g., "source.my_project.raw.users")
    pub unique_id: String,

    /// Source name (e.g., "raw")
    pub source_name: String,

    /// Table name (e.g., "users")
    pub name: String,

    /// Database name
    #[serde(default)]
    pub database: Option<String>,

    /// Schema name
    pub schema: String,

    /// Identifier (actual table name)
    #[serde(default)]
    pub identifier: Option<String>,
}

impl ManifestSource {
    /// Relation for this source, using `default_database` when none is declared
    pub fn relation(&self, default_database: &str) -> Relation {
        Relation::new(
            self.database.clone().unwrap_or_else(|| default_database.to_string()),
            self.schema.clone(),
            self.identifier.clone().unwrap_or_else(|| self.name.clone()),
        )
    }
}

/// Manifest parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest not found at {0}")]
    NotFound(String),

    #[error("Failed to read manifest file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse manifest JSON: {0}")]
    ParseError(String),
}
