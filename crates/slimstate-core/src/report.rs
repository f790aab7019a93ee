//! Run results schema (run_results.json v1)
//!
//! This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Outcome of one node in an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Relation built (seed, model, snapshot)
    Success,

    /// Rendered only (compile, docs generate)
    Compiled,

    /// Test returned zero failing rows
    Pass,

    /// Test returned failing rows
    Fail,

    /// Rendering or execution failed
    Error,

    /// Not attempted because an upstream node failed
    Skipped,
}

impl NodeStatus {
    /// Whether this status fails the invocation
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Compiled => write!(f, "compiled"),
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result for a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Unique identifier (e.g., "model.jaffle.view_model")
    pub unique_id: String,

    /// Node name
    pub name: String,

    /// Resource type (model, seed, test, ...)
    pub resource_type: String,

    /// Outcome
    pub status: NodeStatus,

    /// Whether the node resolved to a prior-state relation
    #[serde(default)]
    pub deferred: bool,

    /// Fully rendered relation name the node resolved to
    #[serde(default)]
    pub relation: Option<String>,

    /// Compiled SQL, when rendering succeeded
    #[serde(default)]
    pub compiled_code: Option<String>,

    /// Failing row count (tests only)
    #[serde(default)]
    pub failures: Option<u64>,

    /// Error or skip reason
    #[serde(default)]
    pub message: Option<String>,
}

/// What was invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationInfo {
    /// Command name (run, test, ...)
    pub command: String,

    /// Target the current graph resolved against
    pub target: String,

    /// Node selection, if any
    #[serde(default)]
    pub select: Option<String>,

    /// State directory, if any
    #[serde(default)]
    pub state: Option<String>,

    pub defer: bool,

    pub favor_state: bool,
}

/// Summary statistics for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred_upstream: usize,
}

/// Run results (run_results.json v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Schema version
    pub version: ReportVersion,

    /// Timestamp (ISO 8601)
    pub generated_at: String,

    pub invocation: InvocationInfo,

    /// Summary statistics
    pub summary: RunSummary,

    /// Per-node results in execution order
    pub results: Vec<NodeResult>,

    /// Non-fatal conditions observed while resolving the graph
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunReport {
    /// Build a report from per-node results
    ///
    /// `deferred_upstream` counts deferred nodes in the resolved graph,
    /// which are not results themselves.
    pub fn new(invocation: InvocationInfo, results: Vec<NodeResult>, deferred_upstream: usize) -> Self {
        let summary = RunSummary {
            total: results.len(),
            succeeded: results.iter().filter(|r| !r.status.is_failure() && r.status != NodeStatus::Skipped).count(),
            failed: results.iter().filter(|r| r.status.is_failure()).count(),
            skipped: results.iter().filter(|r| r.status == NodeStatus::Skipped).count(),
            deferred_upstream,
        };

        Self {
            version: ReportVersion::CURRENT,
            generated_at: chrono::Utc::now().to_rfc3339(),
            invocation,
            summary,
            results,
            warnings: Vec::new(),
        }
    }

    /// Whether every node succeeded
    pub fn success(&self) -> bool {
        self.summary.failed == 0 && self.summary.skipped == 0
    }

    /// Look up a result by unique id
    pub fn result(&self, unique_id: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.unique_id == unique_id)
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> InvocationInfo {
        InvocationInfo {
            command: "run".to_string(),
            target: "dev".to_string(),
            select: None,
            state: None,
            defer: false,
            favor_state: false,
        }
    }

    fn result(id: &str, status: NodeStatus) -> NodeResult {
        NodeResult {
            unique_id: id.to_string(),
            name: id.rsplit('.').next().unwrap_or(id).to_string(),
            resource_type: "model".to_string(),
            status,
            deferred: false,
            relation: None,
            compiled_code: None,
            failures: None,
            message: None,
        }
    }

    #[test]
    fn empty_report_succeeds() {
        let report = RunReport::new(info(), Vec::new(), 0);
        assert_eq!(report.version, ReportVersion::CURRENT);
        assert_eq!(report.summary.total, 0);
        assert!(report.success());
    }

    #[test]
    fn summary_counts_statuses() {
        let report = RunReport::new(
            info(),
            vec![
                result("model.p.a", NodeStatus::Success),
                result("model.p.b", NodeStatus::Error),
                result("model.p.c", NodeStatus::Skipped),
                result("test.p.t", NodeStatus::Pass),
            ],
            1,
        );

        assert_eq!(report.summary.total, 4);
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.deferred_upstream, 1);
        assert!(!report.success());
        assert_eq!(report.result("model.p.b").map(|r| r.status), Some(NodeStatus::Error));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&NodeStatus::Compiled).unwrap();
        assert_eq!(json, "\"compiled\"");
        assert!(NodeStatus::Fail.is_failure());
        assert!(!NodeStatus::Pass.is_failure());
    }
}
