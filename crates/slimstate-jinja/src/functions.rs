//! Template functions: ref(), source(), var(), config()
//!
//! Each function closes over the resolved graph and the render state of the
//! node being compiled, so lookups see post-resolution qualifiers and every
//! relation a template touches is recorded.

use crate::context::RenderContext;
use crate::renderer::{render_sql, RenderError};
use minijinja::value::Rest;
use minijinja::{Error, ErrorKind, Value};
use slimstate_core::Relation;
use slimstate_dbt::{CurrentGraph, NodeId};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Prefix of the CTE an ephemeral model is inlined as
pub const EPHEMERAL_PREFIX: &str = "__dbt__cte__";

/// CTE name for an ephemeral model
pub fn ephemeral_cte_name(name: &str) -> String {
    format!("{}{}", EPHEMERAL_PREFIX, name)
}

/// What every function can read
pub(crate) struct Scope {
    pub graph: CurrentGraph,
    pub context: RenderContext,
}

/// An ephemeral model rendered for inlining
#[derive(Debug, Clone)]
pub(crate) struct InlinedCte {
    pub unique_id: NodeId,
    pub name: String,
    pub sql: String,
}

/// Mutable state for rendering one node (and the ephemerals it pulls in)
#[derive(Debug, Default)]
pub(crate) struct RenderState {
    pub references: BTreeSet<Relation>,

    /// Dependencies first
    pub ctes: Vec<InlinedCte>,

    /// Ephemerals currently being rendered
    pub stack: Vec<NodeId>,

    /// First typed error raised inside a function
    pub error: Option<RenderError>,
}

pub(crate) type SharedState = Arc<Mutex<RenderState>>;

pub(crate) fn lock(state: &SharedState) -> MutexGuard<'_, RenderState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stash a typed error and hand minijinja an opaque one
fn fail(state: &SharedState, error: RenderError) -> Error {
    let message = error.to_string();
    let mut guard = lock(state);
    if guard.error.is_none() {
        guard.error = Some(error);
    }
    Error::new(ErrorKind::InvalidOperation, message)
}

/// `{{ ref('model') }}` or `{{ ref('package', 'model') }}`
///
/// Regular nodes render as their quoted relation. Ephemeral models are
/// rendered recursively, queued as CTEs and referenced by CTE name.
pub(crate) fn ref_function(
    scope: Arc<Scope>,
    state: SharedState,
    node_id: NodeId,
) -> impl Fn(String, Option<String>) -> Result<Value, Error> + Send + Sync + 'static {
    move |first: String, second: Option<String>| {
        let (package, name) = match second {
            Some(name) => (Some(first), name),
            None => (None, first),
        };

        let target = scope
            .graph
            .find_refable(package.as_deref(), &name)
            .ok_or_else(|| {
                fail(
                    &state,
                    RenderError::RefNotFound {
                        node: node_id.clone(),
                        package: package.clone(),
                        name: name.clone(),
                    },
                )
            })?;

        if target.is_ephemeral() {
            return inline_ephemeral(&scope, &state, &node_id, &target.unique_id);
        }

        let relation = target.relation().ok_or_else(|| {
            fail(
                &state,
                RenderError::Unqualified {
                    node: node_id.clone(),
                    target: target.unique_id.clone(),
                },
            )
        })?;

        let rendered = relation.render();
        lock(&state).references.insert(relation);
        Ok(Value::from(rendered))
    }
}

fn inline_ephemeral(scope: &Arc<Scope>, state: &SharedState, node_id: &str, ephemeral_id: &str) -> Result<Value, Error> {
    let Some(ephemeral) = scope.graph.node(ephemeral_id) else {
        return Err(fail(
            state,
            RenderError::NodeNotFound(ephemeral_id.to_string()),
        ));
    };
    let cte_name = ephemeral_cte_name(&ephemeral.name);

    {
        let guard = lock(state);
        if guard.ctes.iter().any(|cte| cte.unique_id == ephemeral_id) {
            return Ok(Value::from(cte_name));
        }
        if guard.stack.iter().any(|id| id == ephemeral_id) {
            drop(guard);
            return Err(fail(
                state,
                RenderError::EphemeralCycle {
                    node: node_id.to_string(),
                    ephemeral: ephemeral_id.to_string(),
                },
            ));
        }
    }

    lock(state).stack.push(ephemeral_id.to_string());
    let rendered = render_sql(scope, state, ephemeral);
    lock(state).stack.pop();

    let sql = rendered.map_err(|error| fail(state, error))?;

    lock(state).ctes.push(InlinedCte {
        unique_id: ephemeral_id.to_string(),
        name: cte_name.clone(),
        sql,
    });

    Ok(Value::from(cte_name))
}

/// `{{ source('source_name', 'table_name') }}`
pub(crate) fn source_function(
    scope: Arc<Scope>,
    state: SharedState,
    node_id: NodeId,
) -> impl Fn(String, String) -> Result<Value, Error> + Send + Sync + 'static {
    move |source_name: String, table: String| {
        let source = scope.graph.find_source(&source_name, &table).ok_or_else(|| {
            fail(
                &state,
                RenderError::SourceNotFound {
                    node: node_id.clone(),
                    source_name: source_name.clone(),
                    table: table.clone(),
                },
            )
        })?;

        let relation = source.relation(&scope.graph.target().database);
        let rendered = relation.render();
        lock(&state).references.insert(relation);
        Ok(Value::from(rendered))
    }
}

/// `{{ var('name') }}` or `{{ var('name', default) }}`
pub(crate) fn var_function(
    scope: Arc<Scope>,
    state: SharedState,
    node_id: NodeId,
) -> impl Fn(String, Option<Value>) -> Result<Value, Error> + Send + Sync + 'static {
    move |name: String, default: Option<Value>| {
        if let Some(value) = scope.context.vars.get(&name) {
            return Ok(Value::from_serialize(value));
        }

        default.ok_or_else(|| {
            fail(
                &state,
                RenderError::UndefinedVariable {
                    node: node_id.clone(),
                    name,
                },
            )
        })
    }
}

/// `{{ config(materialized='table') }}` renders nothing
///
/// Node configuration is read from the manifest, not from the template.
pub(crate) fn config_function(_args: Rest<Value>) -> Result<Value, Error> {
    Ok(Value::from(""))
}
