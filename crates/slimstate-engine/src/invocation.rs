//! One command invocation, end to end
//!
//! usage validation → state load → current graph → selection → deferral
//! resolution → render → execute → artifacts
//!
//! Everything up to and including resolution is all-or-nothing: any error
//! there aborts before a single node is rendered. After that, failures are
//! per node and only skip that node's descendants.

use crate::docs::{Catalog, CATALOG_FILE};
use crate::resolver::{DeferralError, DeferralResolver, ResolutionOutcome};
use slimstate_catalog::{CatalogError, ExecutionOutcome, ExecutionRequest, Materialization, Warehouse};
use slimstate_core::{
    Config, ConfigError, DeferralPolicy, InvocationInfo, NodeResult, NodeStatus, PolicyError, RunReport,
};
use slimstate_dbt::{
    CurrentGraph, GraphSelector, Manifest, ManifestError, ManifestNode, NodeId, NodeKind, SelectorError,
    StateManifest,
};
use slimstate_jinja::{RenderContext, RenderedNode, Renderer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the run results artifact
pub const RUN_RESULTS_FILE: &str = "run_results.json";

/// Supported commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Seed,
    Run,
    Test,
    Snapshot,
    Compile,
    DocsGenerate,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Run => "run",
            Self::Test => "test",
            Self::Snapshot => "snapshot",
            Self::Compile => "compile",
            Self::DocsGenerate => "docs generate",
        }
    }

    /// Kinds of node this command acts on; `None` means every kind
    pub fn resource_kinds(&self) -> Option<&'static [NodeKind]> {
        match self {
            Self::Seed => Some(&[NodeKind::Seed]),
            Self::Run => Some(&[NodeKind::Model]),
            Self::Test => Some(&[NodeKind::Test]),
            Self::Snapshot => Some(&[NodeKind::Snapshot]),
            Self::Compile | Self::DocsGenerate => None,
        }
    }

    pub fn includes(&self, node: &ManifestNode) -> bool {
        self.resource_kinds()
            .map_or(true, |kinds| kinds.contains(&node.resource_type))
    }

    /// Whether rendered nodes are sent to the warehouse
    pub fn executes(&self) -> bool {
        !matches!(self, Self::Compile | Self::DocsGenerate)
    }

    /// Seeds never read upstream relations, so deferral is meaningless there
    pub fn accepts_defer(&self) -> bool {
        !matches!(self, Self::Seed)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub command: Command,

    /// Selection expression (`-m` / `--select`)
    pub select: Option<String>,

    /// Target profile name; `default_target` when absent
    pub target: Option<String>,

    /// Directory holding the prior-state manifest.json
    pub state_path: Option<PathBuf>,

    pub defer: bool,

    pub favor_state: bool,

    /// Project variables for `var()`
    pub vars: HashMap<String, serde_json::Value>,
}

impl Invocation {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            select: None,
            target: None,
            state_path: None,
            defer: false,
            favor_state: false,
            vars: HashMap::new(),
        }
    }

    pub fn select(mut self, expr: impl Into<String>) -> Self {
        self.select = Some(expr.into());
        self
    }

    pub fn target(mut self, name: impl Into<String>) -> Self {
        self.target = Some(name.into());
        self
    }

    pub fn state(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn defer(mut self) -> Self {
        self.defer = true;
        self
    }

    pub fn favor_state(mut self) -> Self {
        self.favor_state = true;
        self
    }

    pub fn var(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }

    /// Validate flag combinations before any other work
    pub fn policy(&self) -> Result<DeferralPolicy, InvocationError> {
        if self.defer && !self.command.accepts_defer() {
            return Err(InvocationError::Usage(format!(
                "--defer is not supported by `{}`",
                self.command
            )));
        }

        DeferralPolicy::new(self.defer, self.favor_state).map_err(|e| match e {
            PolicyError::FavorStateWithoutDefer => InvocationError::Usage(e.to_string()),
        })
    }

    /// Load prior state when deferring
    ///
    /// State is only read for `--defer`; a `--state` without it is ignored.
    pub fn load_state(&self, policy: &DeferralPolicy) -> Result<Option<StateManifest>, InvocationError> {
        if !policy.defer {
            if let Some(path) = &self.state_path {
                tracing::debug!(state = %path.display(), "--state given without --defer, not loading");
            }
            return Ok(None);
        }

        let path = self
            .state_path
            .as_ref()
            .ok_or_else(|| InvocationError::MissingState("no state provided for deferral: --defer requires --state".to_string()))?;

        StateManifest::load(path).map(Some).map_err(|e| {
            InvocationError::MissingState(format!("could not load state from {}: {}", path.display(), e))
        })
    }

    fn info(&self, target: &str) -> InvocationInfo {
        InvocationInfo {
            command: self.command.name().to_string(),
            target: target.to_string(),
            select: self.select.clone(),
            state: self.state_path.as_ref().map(|p| p.display().to_string()),
            defer: self.defer,
            favor_state: self.favor_state,
        }
    }
}

/// Fatal invocation errors
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Missing state: {0}")]
    MissingState(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Selection(#[from] SelectorError),

    #[error(transparent)]
    Deferral(#[from] DeferralError),

    #[error("Catalog generation failed: {0}")]
    Catalog(#[source] CatalogError),

    #[error("Dependency cycle detected in the current graph")]
    Cycle,

    #[error("Failed to write {path}: {reason}")]
    Artifact { path: String, reason: String },
}

impl InvocationError {
    /// Errors caused by how the command was called
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

/// Everything an invocation produced
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub report: RunReport,

    /// Resolved graph with deferred flags and compiled code
    pub manifest: Manifest,

    /// Present for `docs generate`
    pub catalog: Option<Catalog>,

    pub resolution: ResolutionOutcome,
}

impl InvocationResult {
    pub fn success(&self) -> bool {
        self.report.success()
    }

    /// Write manifest.json, run_results.json and (for docs) catalog.json
    pub fn write_artifacts(&self, dir: &Path) -> Result<Vec<PathBuf>, InvocationError> {
        let artifact_err = |path: &Path, reason: String| InvocationError::Artifact {
            path: path.display().to_string(),
            reason,
        };

        std::fs::create_dir_all(dir).map_err(|e| artifact_err(dir, e.to_string()))?;

        let manifest_path = dir.join(slimstate_dbt::graph::MANIFEST_FILE);
        self.manifest
            .to_file(&manifest_path)
            .map_err(|e| artifact_err(&manifest_path, e.to_string()))?;

        let results_path = dir.join(RUN_RESULTS_FILE);
        self.report
            .save_to_file(&results_path)
            .map_err(|e| artifact_err(&results_path, e.to_string()))?;

        let mut written = vec![manifest_path, results_path];

        if let Some(catalog) = &self.catalog {
            let catalog_path = dir.join(CATALOG_FILE);
            catalog
                .save_to_file(&catalog_path)
                .map_err(|e| artifact_err(&catalog_path, e.to_string()))?;
            written.push(catalog_path);
        }

        Ok(written)
    }
}

/// Runs invocations against one warehouse
pub struct Runner<'a, W: Warehouse> {
    config: &'a Config,
    warehouse: &'a W,
}

impl<'a, W: Warehouse> Runner<'a, W> {
    pub fn new(config: &'a Config, warehouse: &'a W) -> Self {
        Self { config, warehouse }
    }

    /// Read the parsed graph from `graph_path`, invoke, and write artifacts
    pub async fn run(&self, invocation: &Invocation) -> Result<InvocationResult, InvocationError> {
        let policy = invocation.policy()?;
        let graph_path = self.config.resolve_path(&self.config.graph_path);
        let manifest = Manifest::from_file(&graph_path)?;

        let result = self.invoke_with_policy(invocation, policy, manifest).await?;

        let target_dir = self.config.resolve_path(&self.config.target_path);
        for path in result.write_artifacts(&target_dir)? {
            tracing::info!(path = %path.display(), "wrote artifact");
        }

        Ok(result)
    }

    /// Invoke against an in-memory parsed graph
    pub async fn invoke(&self, invocation: &Invocation, manifest: Manifest) -> Result<InvocationResult, InvocationError> {
        let policy = invocation.policy()?;
        self.invoke_with_policy(invocation, policy, manifest).await
    }

    async fn invoke_with_policy(
        &self,
        invocation: &Invocation,
        policy: DeferralPolicy,
        mut manifest: Manifest,
    ) -> Result<InvocationResult, InvocationError> {
        let command = invocation.command;
        tracing::info!(%command, defer = policy.defer, favor_state = policy.favor_state, "starting invocation");

        let state = invocation.load_state(&policy)?;
        let target = self.config.target(invocation.target.as_deref())?;

        if manifest.metadata.project_name.is_none() {
            manifest.metadata.project_name = Some(self.config.project.clone());
        }
        let mut graph = CurrentGraph::build(manifest, &target);

        if !policy.defer {
            for dangling in graph.dangling_dependencies() {
                tracing::warn!(node = %dangling.child, missing = %dangling.missing, "upstream not in current graph");
            }
        }

        let executed: BTreeSet<NodeId> = GraphSelector::select(&graph, invocation.select.as_deref())?
            .into_iter()
            .filter(|id| graph.node(id).map_or(false, |node| command.includes(node)))
            .collect();
        tracing::info!(selected = executed.len(), "selected nodes");

        let resolution = DeferralResolver::new(self.warehouse)
            .resolve(&mut graph, &policy, state.as_ref(), &executed)
            .await?;

        let order = graph.dag().topological_sort().ok_or(InvocationError::Cycle)?;

        let mut context = RenderContext::for_target(graph.target());
        context.vars.extend(invocation.vars.clone());
        let renderer = Renderer::new(&graph, context);

        let mut results = Vec::new();
        let mut failed: BTreeSet<NodeId> = BTreeSet::new();
        let mut compiled: Vec<(NodeId, String)> = Vec::new();

        for id in order.iter().filter(|id| executed.contains(*id)) {
            let Some(node) = graph.node(id) else {
                continue;
            };
            // Ephemerals only get a result when nothing is executed
            let reported = !(node.is_ephemeral() && command.executes());

            if let Some(parent) = graph.dag().parents(id).iter().find(|p| failed.contains(*p)) {
                tracing::warn!(node = %id, upstream = %parent, "skipping, upstream failed");
                failed.insert(id.clone());
                if reported {
                    results.push(node_result(
                        node,
                        NodeStatus::Skipped,
                        None,
                        Some(format!("Skipped because upstream {} failed", parent)),
                    ));
                }
                continue;
            }

            let rendered = match renderer.render_node(id) {
                Ok(rendered) => rendered,
                Err(e) => {
                    tracing::error!(node = %id, error = %e, "render failed");
                    failed.insert(id.clone());
                    if reported {
                        results.push(node_result(node, NodeStatus::Error, None, Some(e.to_string())));
                    }
                    continue;
                }
            };
            compiled.push((id.clone(), rendered.sql.clone()));

            if !reported {
                continue;
            }

            if !command.executes() {
                results.push(node_result(node, NodeStatus::Compiled, Some(&rendered), None));
                continue;
            }

            let result = match self.execute(node, &rendered).await {
                Ok(outcome) => executed_result(node, &rendered, outcome),
                Err(e) => {
                    tracing::error!(node = %id, error = %e, "execution failed");
                    node_result(node, NodeStatus::Error, Some(&rendered), Some(e.to_string()))
                }
            };
            if result.status.is_failure() {
                failed.insert(id.clone());
            }
            results.push(result);
        }

        for (id, sql) in compiled {
            if let Some(node) = graph.node_mut(&id) {
                node.compiled_code = Some(sql);
            }
        }

        let catalog = if command == Command::DocsGenerate {
            let closure = graph.dag().upstream_closure(&executed);
            Some(
                Catalog::generate(&graph, &closure, self.warehouse)
                    .await
                    .map_err(InvocationError::Catalog)?,
            )
        } else {
            None
        };

        let mut report = RunReport::new(invocation.info(&target.name), results, resolution.deferred.len());
        report.warnings = resolution
            .warnings
            .iter()
            .map(|w| format!("{} depends on {}, which is in neither the current graph nor state", w.child, w.missing))
            .collect();

        let mut manifest = graph.into_manifest();
        manifest.metadata.generated_at = report.generated_at.clone();

        tracing::info!(
            %command,
            total = report.summary.total,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            deferred = report.summary.deferred_upstream,
            "finished invocation"
        );

        Ok(InvocationResult {
            report,
            manifest,
            catalog,
            resolution,
        })
    }

    async fn execute(&self, node: &ManifestNode, rendered: &RenderedNode) -> Result<ExecutionOutcome, CatalogError> {
        let materialization = Materialization::parse(node.materialization()).ok_or_else(|| {
            CatalogError::ConfigError(format!(
                "Unknown materialization '{}' on {}",
                node.materialization(),
                node.unique_id
            ))
        })?;

        let request = ExecutionRequest {
            unique_id: node.unique_id.clone(),
            materialization,
            target: if materialization.builds_relation() { node.relation() } else { None },
            sql: rendered.sql.clone(),
            references: rendered.references.clone(),
        };

        self.warehouse.execute(&request).await
    }
}

fn node_result(
    node: &ManifestNode,
    status: NodeStatus,
    rendered: Option<&RenderedNode>,
    message: Option<String>,
) -> NodeResult {
    let relation = match node.resource_type {
        NodeKind::Test => None,
        _ => node.relation().map(|r| r.render()),
    };

    NodeResult {
        unique_id: node.unique_id.clone(),
        name: node.name.clone(),
        resource_type: node.resource_type.to_string(),
        status,
        deferred: node.deferred,
        relation,
        compiled_code: rendered.map(|r| r.sql.clone()),
        failures: None,
        message,
    }
}

fn executed_result(node: &ManifestNode, rendered: &RenderedNode, outcome: ExecutionOutcome) -> NodeResult {
    match outcome.failures {
        Some(0) => node_result(node, NodeStatus::Pass, Some(rendered), None),
        Some(failures) => NodeResult {
            failures: Some(failures),
            ..node_result(
                node,
                NodeStatus::Fail,
                Some(rendered),
                Some(format!("Got {} results, configured to fail if != 0", failures)),
            )
        },
        None => node_result(node, NodeStatus::Success, Some(rendered), Some(outcome.message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_kinds() {
        let mut seed = slimstate_dbt::ManifestNode {
            unique_id: "seed.test.seed".to_string(),
            name: "seed".to_string(),
            resource_type: NodeKind::Seed,
            package_name: "test".to_string(),
            path: String::new(),
            original_file_path: String::new(),
            database: None,
            schema: None,
            alias: None,
            config: Default::default(),
            raw_code: String::new(),
            compiled_code: None,
            depends_on: Default::default(),
            fqn: vec![],
            deferred: false,
        };

        assert!(Command::Seed.includes(&seed));
        assert!(!Command::Run.includes(&seed));
        assert!(Command::Compile.includes(&seed));

        seed.resource_type = NodeKind::Snapshot;
        assert!(Command::Snapshot.includes(&seed));
        assert!(Command::DocsGenerate.includes(&seed));

        assert!(!Command::Compile.executes());
        assert!(!Command::DocsGenerate.executes());
        assert!(Command::Test.executes());
        assert_eq!(Command::DocsGenerate.to_string(), "docs generate");
    }

    #[test]
    fn seed_rejects_defer_before_state_is_considered() {
        let invocation = Invocation::new(Command::Seed).defer();
        let err = invocation.policy().unwrap_err();
        assert!(err.is_usage());
        assert_eq!(err.to_string(), "Usage error: --defer is not supported by `seed`");
    }

    #[test]
    fn favor_state_without_defer_is_usage() {
        let err = Invocation::new(Command::Run).favor_state().policy().unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn defer_without_state_is_missing_state() {
        let invocation = Invocation::new(Command::Snapshot).defer();
        let policy = invocation.policy().unwrap();
        assert!(matches!(
            invocation.load_state(&policy),
            Err(InvocationError::MissingState(_))
        ));
    }

    #[test]
    fn unreadable_state_is_missing_state() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new(Command::Run).state(dir.path()).defer();
        let policy = invocation.policy().unwrap();

        let err = invocation.load_state(&policy).unwrap_err();
        assert!(matches!(err, InvocationError::MissingState(ref msg) if msg.contains("could not load state")));
    }

    #[test]
    fn state_is_ignored_without_defer() {
        let invocation = Invocation::new(Command::Run).state("does/not/exist");
        let policy = invocation.policy().unwrap();
        assert!(invocation.load_state(&policy).unwrap().is_none());
    }
}
