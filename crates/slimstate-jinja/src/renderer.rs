//! Compiles node templates into executable SQL

use crate::context::RenderContext;
use crate::functions::{self, lock, InlinedCte, RenderState, Scope, SharedState};
use minijinja::{context, Environment, Value};
use slimstate_core::Relation;
use slimstate_dbt::{CurrentGraph, ManifestNode, NodeId};
use std::sync::Arc;

/// A compiled node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedNode {
    pub unique_id: NodeId,

    /// Executable SQL, ephemeral CTEs included
    pub sql: String,

    /// Relations the SQL reads from, sorted
    pub references: Vec<Relation>,

    /// Ephemeral models inlined into `sql`
    pub ephemerals: Vec<NodeId>,
}

/// Errors raised while rendering one node
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("Node '{0}' not found in graph")]
    NodeNotFound(String),

    #[error("{node} depends on a node named '{}' which was not found", qualified(.package, .name))]
    RefNotFound {
        node: NodeId,
        package: Option<String>,
        name: String,
    },

    #[error("{node} depends on a source named '{source_name}.{table}' which was not found")]
    SourceNotFound {
        node: NodeId,
        source_name: String,
        table: String,
    },

    #[error("{node} references '{target}' which has no database/schema")]
    Unqualified { node: NodeId, target: NodeId },

    #[error("Required var '{name}' not found in config (used by {node})")]
    UndefinedVariable { node: NodeId, name: String },

    #[error("Ephemeral model cycle through '{ephemeral}' (rendering {node})")]
    EphemeralCycle { node: NodeId, ephemeral: NodeId },

    #[error("Compilation error in {node}: {message}")]
    Template { node: NodeId, message: String },
}

fn qualified(package: &Option<String>, name: &str) -> String {
    match package {
        Some(package) => format!("{}.{}", package, name),
        None => name.to_string(),
    }
}

/// Renders nodes of one resolved graph
///
/// Holds its own copy of the graph, so a renderer built after deferral
/// resolution keeps seeing exactly those qualifiers.
pub struct Renderer {
    scope: Arc<Scope>,
}

impl Renderer {
    pub fn new(graph: &CurrentGraph, context: RenderContext) -> Self {
        Self {
            scope: Arc::new(Scope {
                graph: graph.clone(),
                context,
            }),
        }
    }

    /// Renderer with no project variables
    pub fn for_graph(graph: &CurrentGraph) -> Self {
        Self::new(graph, RenderContext::for_target(graph.target()))
    }

    /// Check if SQL contains Jinja templates
    pub fn has_jinja(sql: &str) -> bool {
        sql.contains("{{") || sql.contains("{%") || sql.contains("{#")
    }

    /// Compile one node
    pub fn render_node(&self, unique_id: &str) -> Result<RenderedNode, RenderError> {
        let node = self
            .scope
            .graph
            .node(unique_id)
            .ok_or_else(|| RenderError::NodeNotFound(unique_id.to_string()))?;

        let state = SharedState::default();
        let body = render_sql(&self.scope, &state, node)?;

        let RenderState { references, ctes, .. } = std::mem::take(&mut *lock(&state));

        tracing::debug!(
            node = %unique_id,
            references = references.len(),
            ephemerals = ctes.len(),
            "rendered node"
        );

        Ok(RenderedNode {
            unique_id: unique_id.to_string(),
            sql: inject_ctes(&body, &ctes),
            references: references.into_iter().collect(),
            ephemerals: ctes.into_iter().map(|cte| cte.unique_id).collect(),
        })
    }
}

/// Render a node's template without CTE injection
pub(crate) fn render_sql(scope: &Arc<Scope>, state: &SharedState, node: &ManifestNode) -> Result<String, RenderError> {
    if !Renderer::has_jinja(&node.raw_code) {
        return Ok(node.raw_code.clone());
    }

    let id = node.unique_id.clone();
    let mut env = Environment::new();

    env.add_function("ref", functions::ref_function(scope.clone(), state.clone(), id.clone()));
    env.add_function("source", functions::source_function(scope.clone(), state.clone(), id.clone()));
    env.add_function("var", functions::var_function(scope.clone(), state.clone(), id.clone()));
    env.add_function("config", functions::config_function);
    env.add_global("target", Value::from_serialize(&scope.context.target));

    let this = node
        .relation()
        .map(|relation| relation.render())
        .unwrap_or_else(|| functions::ephemeral_cte_name(&node.name));
    env.add_global("this", Value::from(this));

    env.render_str(&node.raw_code, context! {}).map_err(|e| {
        lock(state).error.take().unwrap_or_else(|| RenderError::Template {
            node: id,
            message: e.to_string(),
        })
    })
}

/// Prepend inlined ephemerals, merging into a leading `with` if present
fn inject_ctes(sql: &str, ctes: &[InlinedCte]) -> String {
    if ctes.is_empty() {
        return sql.to_string();
    }

    let prefix = ctes
        .iter()
        .map(|cte| format!("{} as (\n{}\n)", cte.name, cte.sql.trim()))
        .collect::<Vec<_>>()
        .join(",\n");

    let trimmed = sql.trim_start();
    let leading_with = trimmed
        .get(..4)
        .filter(|head| head.eq_ignore_ascii_case("with"))
        .and_then(|_| trimmed[4..].chars().next())
        .filter(|c| c.is_whitespace());

    match leading_with {
        Some(_) => format!("with {},\n{}", prefix, trimmed[4..].trim_start()),
        None => format!("with {}\n{}", prefix, sql),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use slimstate_core::TargetConfig;
    use slimstate_dbt::{DependsOn, Manifest, ManifestSource, NodeConfig, NodeKind};

    fn node(id: &str, kind: NodeKind, raw_code: &str) -> ManifestNode {
        let name = id.rsplit('.').next().unwrap().to_string();
        ManifestNode {
            unique_id: id.to_string(),
            name: name.clone(),
            resource_type: kind,
            package_name: "test".to_string(),
            path: format!("{}.sql", name),
            original_file_path: format!("models/{}.sql", name),
            database: None,
            schema: None,
            alias: None,
            config: NodeConfig::default(),
            raw_code: raw_code.to_string(),
            compiled_code: None,
            depends_on: DependsOn::default(),
            fqn: vec!["test".to_string(), name],
            deferred: false,
        }
    }

    fn ephemeral(id: &str, raw_code: &str) -> ManifestNode {
        let mut node = node(id, NodeKind::Model, raw_code);
        node.config.materialized = Some("ephemeral".to_string());
        node
    }

    fn graph(nodes: Vec<ManifestNode>) -> CurrentGraph {
        let mut manifest = Manifest::default();
        for node in nodes {
            manifest.insert_node(node);
        }
        manifest.sources.insert(
            "source.test.raw.users".to_string(),
            ManifestSource {
                unique_id: "source.test.raw.users".to_string(),
                source_name: "raw".to_string(),
                name: "users".to_string(),
                database: None,
                schema: "raw".to_string(),
                identifier: None,
            },
        );
        CurrentGraph::build(manifest, &TargetConfig::new("default", "dbt", "defer_state"))
    }

    #[test]
    fn ref_renders_current_relation() {
        let renderer = Renderer::for_graph(&graph(vec![
            node("seed.test.seed", NodeKind::Seed, "1,2"),
            node("model.test.view_model", NodeKind::Model, "select * from {{ ref('seed') }}"),
        ]));

        let rendered = renderer.render_node("model.test.view_model").unwrap();
        assert_eq!(rendered.sql, "select * from \"dbt\".\"defer_state\".\"seed\"");
        assert_eq!(rendered.references, vec![Relation::new("dbt", "defer_state", "seed")]);
        assert!(rendered.ephemerals.is_empty());
    }

    #[test]
    fn ref_follows_deferred_qualifiers() {
        let mut graph = graph(vec![
            node("seed.test.seed", NodeKind::Seed, "1,2"),
            node("model.test.view_model", NodeKind::Model, "select * from {{ ref('test', 'seed') }}"),
        ]);
        let mut deferred = graph.node("seed.test.seed").unwrap().clone();
        deferred.schema = Some("defer_state_prod".to_string());
        deferred.deferred = true;
        graph.substitute(deferred);

        let rendered = Renderer::for_graph(&graph).render_node("model.test.view_model").unwrap();
        assert_eq!(rendered.sql, "select * from \"dbt\".\"defer_state_prod\".\"seed\"");
    }

    #[test]
    fn ephemeral_is_inlined_as_cte() {
        let renderer = Renderer::for_graph(&graph(vec![
            node("seed.test.seed", NodeKind::Seed, "1,2"),
            ephemeral("model.test.ephemeral_model", "select * from {{ ref('seed') }}"),
            node(
                "model.test.view_model",
                NodeKind::Model,
                "select * from {{ ref('ephemeral_model') }}",
            ),
        ]));

        let rendered = renderer.render_node("model.test.view_model").unwrap();
        assert_eq!(
            rendered.sql,
            "with __dbt__cte__ephemeral_model as (\n\
             select * from \"dbt\".\"defer_state\".\"seed\"\n\
             )\n\
             select * from __dbt__cte__ephemeral_model"
        );
        assert_eq!(rendered.references, vec![Relation::new("dbt", "defer_state", "seed")]);
        assert_eq!(rendered.ephemerals, vec!["model.test.ephemeral_model".to_string()]);
    }

    #[test]
    fn ctes_merge_into_existing_with() {
        let renderer = Renderer::for_graph(&graph(vec![
            ephemeral("model.test.base", "select 1 as id"),
            ephemeral("model.test.middle", "select * from {{ ref('base') }}"),
            node(
                "model.test.top",
                NodeKind::Model,
                "WITH x as (select * from {{ ref('middle') }}) select * from x",
            ),
        ]));

        let rendered = renderer.render_node("model.test.top").unwrap();
        assert_eq!(
            rendered.sql,
            "with __dbt__cte__base as (\nselect 1 as id\n),\n\
             __dbt__cte__middle as (\nselect * from __dbt__cte__base\n),\n\
             x as (select * from __dbt__cte__middle) select * from x"
        );
        assert_eq!(
            rendered.ephemerals,
            vec!["model.test.base".to_string(), "model.test.middle".to_string()]
        );
    }

    #[test]
    fn ephemeral_cycle_is_an_error() {
        let renderer = Renderer::for_graph(&graph(vec![
            ephemeral("model.test.a", "select * from {{ ref('b') }}"),
            ephemeral("model.test.b", "select * from {{ ref('a') }}"),
            node("model.test.top", NodeKind::Model, "select * from {{ ref('a') }}"),
        ]));

        assert!(matches!(
            renderer.render_node("model.test.top"),
            Err(RenderError::EphemeralCycle { .. })
        ));
    }

    #[test]
    fn missing_ref_is_typed() {
        let renderer = Renderer::for_graph(&graph(vec![node(
            "model.test.view_model",
            NodeKind::Model,
            "select * from {{ ref('ephemeral_model') }}",
        )]));

        let err = renderer.render_node("model.test.view_model").unwrap_err();
        assert_eq!(
            err,
            RenderError::RefNotFound {
                node: "model.test.view_model".to_string(),
                package: None,
                name: "ephemeral_model".to_string(),
            }
        );
        assert_eq!(
            err.to_string(),
            "model.test.view_model depends on a node named 'ephemeral_model' which was not found"
        );
    }

    #[test]
    fn source_var_config_and_target() {
        let mut context = RenderContext::for_target(&TargetConfig::new("default", "dbt", "defer_state"));
        context.add_var("limit", serde_json::json!(10));

        let graph = graph(vec![node(
            "model.test.users",
            NodeKind::Model,
            "{{ config(materialized='table') }}select * from {{ source('raw', 'users') }} \
             where schema_name = '{{ target.schema }}' limit {{ var('limit') }} offset {{ var('offset', 0) }}",
        )]);

        let rendered = Renderer::new(&graph, context).render_node("model.test.users").unwrap();
        assert_eq!(
            rendered.sql,
            "select * from \"dbt\".\"raw\".\"users\" where schema_name = 'defer_state' limit 10 offset 0"
        );
        assert_eq!(rendered.references, vec![Relation::new("dbt", "raw", "users")]);
    }

    #[test]
    fn undefined_var_and_syntax_errors() {
        let renderer = Renderer::for_graph(&graph(vec![
            node("model.test.a", NodeKind::Model, "select {{ var('missing') }}"),
            node("model.test.b", NodeKind::Model, "select {{ ref('a' }}"),
        ]));

        assert!(matches!(
            renderer.render_node("model.test.a"),
            Err(RenderError::UndefinedVariable { .. })
        ));
        assert!(matches!(
            renderer.render_node("model.test.b"),
            Err(RenderError::Template { .. })
        ));
    }

    #[test]
    fn plain_sql_passes_through() {
        let renderer = Renderer::for_graph(&graph(vec![node("model.test.a", NodeKind::Model, "select 1")]));
        assert_eq!(renderer.render_node("model.test.a").unwrap().sql, "select 1");
        assert!(!Renderer::has_jinja("select 1"));
    }
}
