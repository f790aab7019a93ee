//! Configuration schema (slimstate.toml)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A named environment profile the current graph resolves against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target name (filled from the `[targets.<name>]` key)
    #[serde(default, skip_serializing)]
    pub name: String,

    /// Database (catalog) relations are built into
    pub database: String,

    /// Schema relations are built into
    pub schema: String,

    /// Execution threads requested for this target
    #[serde(default)]
    pub threads: Option<u32>,
}

impl TargetConfig {
    /// Create a target profile
    pub fn new(name: impl Into<String>, database: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: database.into(),
            schema: schema.into(),
            threads: None,
        }
    }

    /// Schema a node lands in, honoring a custom schema suffix
    ///
    /// Mirrors the default `generate_schema_name` behaviour: a node with a
    /// custom schema `marts` on target schema `analytics` builds into
    /// `analytics_marts`.
    pub fn schema_for(&self, custom_schema: Option<&str>) -> String {
        match custom_schema.map(str::trim).filter(|s| !s.is_empty()) {
            Some(custom) => format!("{}_{}", self.schema, custom),
            None => self.schema.clone(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::new("dev", "postgres", "public")
    }
}

/// Warehouse connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Warehouse type (postgres, ...)
    #[serde(rename = "type")]
    pub warehouse_type: String,

    /// Connection settings (warehouse-specific)
    #[serde(flatten)]
    pub settings: HashMap<String, String>,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            warehouse_type: "postgres".to_string(),
            settings: HashMap::new(),
        }
    }
}

fn default_project() -> String {
    "slimstate".to_string()
}

fn default_target_name() -> String {
    "dev".to_string()
}

fn default_graph_path() -> PathBuf {
    PathBuf::from("target/graph.json")
}

fn default_target_path() -> PathBuf {
    PathBuf::from("target")
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Project name
    #[serde(default = "default_project")]
    pub project: String,

    /// Target used when `--target` is not given
    #[serde(default = "default_target_name")]
    pub default_target: String,

    /// Target profiles by name
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,

    /// Warehouse connection configuration
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,

    /// Parsed (uncompiled) graph produced by the project parser
    #[serde(default = "default_graph_path")]
    pub graph_path: PathBuf,

    /// Directory artifacts (manifest.json, run_results.json, catalog.json) are written to
    #[serde(default = "default_target_path")]
    pub target_path: PathBuf,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let mut targets = HashMap::new();
        targets.insert("dev".to_string(), TargetConfig::default());

        Self {
            project: default_project(),
            default_target: default_target_name(),
            targets,
            warehouse: None,
            graph_path: default_graph_path(),
            target_path: default_target_path(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        for (name, target) in config.targets.iter_mut() {
            target.name = name.clone();
        }

        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Look up a target profile, falling back to `default_target`
    pub fn target(&self, name: Option<&str>) -> Result<TargetConfig, ConfigError> {
        let name = name.unwrap_or(&self.default_target);

        self.targets
            .get(name)
            .map(|target| TargetConfig {
                name: name.to_string(),
                ..target.clone()
            })
            .ok_or_else(|| {
                let mut known: Vec<_> = self.targets.keys().cloned().collect();
                known.sort();
                ConfigError::UnknownTarget(name.to_string(), known.join(", "))
            })
    }

    /// Resolve a project-relative path against the project root
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Target '{0}' is not defined (known targets: {1})")]
    UnknownTarget(String, String),
}
