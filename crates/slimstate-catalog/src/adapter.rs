//! Warehouse traits for relation existence and node execution

use slimstate_core::Relation;
use std::fmt;

/// How a node is built (or, for tests, queried)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Materialization {
    Seed,
    View,
    Table,
    Incremental,
    Snapshot,
    Test,
}

impl Materialization {
    /// Parse a materialization name (`view`, `table`, ...)
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "seed" => Some(Self::Seed),
            "view" => Some(Self::View),
            "table" => Some(Self::Table),
            "incremental" => Some(Self::Incremental),
            "snapshot" => Some(Self::Snapshot),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    /// Whether executing this materialization leaves a relation behind
    pub fn builds_relation(&self) -> bool {
        !matches!(self, Self::Test)
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Seed => "seed",
            Self::View => "view",
            Self::Table => "table",
            Self::Incremental => "incremental",
            Self::Snapshot => "snapshot",
            Self::Test => "test",
        };
        write!(f, "{}", name)
    }
}

/// A rendered node handed to the warehouse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Node being executed
    pub unique_id: String,

    pub materialization: Materialization,

    /// Relation being built (`None` for tests)
    pub target: Option<Relation>,

    /// Compiled SQL
    pub sql: String,

    /// Relations the SQL reads from
    pub references: Vec<Relation>,
}

/// Result of executing one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Rows written, when the warehouse reports it
    pub rows_affected: Option<u64>,

    /// Failing rows (tests only)
    pub failures: Option<u64>,

    /// Adapter status message (e.g. "CREATE VIEW")
    pub message: String,
}

/// Errors that can occur talking to the warehouse
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Relation {0} does not exist")]
    RelationNotFound(String),

    #[error("Query failed: {0}")]
    QueryError(String),

    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported by {adapter}: {what}")]
    Unsupported { adapter: &'static str, what: String },
}

/// Answers "does this relation exist in the warehouse"
///
/// Implementations may be expensive (a catalog query per call). Errors are
/// connectivity or permission failures, never "not found" - a missing
/// relation is `Ok(false)`.
#[async_trait::async_trait]
pub trait ExistenceOracle: Send + Sync {
    /// Get the adapter name (e.g., "PostgreSQL")
    fn name(&self) -> &'static str;

    /// Check whether a relation exists
    async fn relation_exists(&self, relation: &Relation) -> Result<bool, CatalogError>;
}

/// A warehouse that can also execute rendered nodes
#[async_trait::async_trait]
pub trait Warehouse: ExistenceOracle {
    /// Build a relation, or run a test query
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, CatalogError>;

    /// Test the connection to the warehouse
    ///
    /// Useful for validating credentials before starting an invocation.
    async fn test_connection(&self) -> Result<(), CatalogError>;
}
