//! Deferral resolution
//!
//! Decides, for every node upstream of what this invocation builds, whether
//! to keep the current definition or substitute the prior-state record.
//!
//! A candidate is any refable, non-ephemeral node in the upstream closure
//! of the executed set that is not itself executed. For each candidate found
//! in state:
//! - with `favor_state`, the state record wins unconditionally
//! - otherwise the state record wins only when the candidate's current
//!   relation does not exist
//!
//! Decisions are computed first and applied afterwards, so a failing
//! existence check leaves the graph untouched.

use crate::cache::ExistenceCache;
use slimstate_catalog::{CatalogError, ExistenceOracle, Relation};
use slimstate_core::DeferralPolicy;
use slimstate_dbt::{CurrentGraph, DanglingDependency, ManifestNode, NodeId, StateManifest};
use std::collections::BTreeSet;

/// What resolution did to the graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionOutcome {
    /// Nodes now carrying their prior-state record
    pub deferred: BTreeSet<NodeId>,

    /// Candidates that kept their current definition
    pub kept: BTreeSet<NodeId>,

    /// Upstreams missing from both graphs
    pub warnings: Vec<DanglingDependency>,

    /// Oracle calls made during the pass
    pub existence_checks: usize,
}

impl ResolutionOutcome {
    pub fn is_deferred(&self, unique_id: &str) -> bool {
        self.deferred.contains(unique_id)
    }
}

/// Fatal resolution errors
#[derive(Debug, thiserror::Error)]
pub enum DeferralError {
    #[error("no state provided for deferral: --defer requires --state")]
    MissingState,

    #[error("Existence check for {relation} ({node}) failed: {source}")]
    Oracle {
        node: NodeId,
        relation: String,
        #[source]
        source: CatalogError,
    },
}

enum Decision {
    Defer(ManifestNode),
    Keep,
    Missing,
}

/// Resolves deferral for one invocation
pub struct DeferralResolver<'a> {
    oracle: &'a dyn ExistenceOracle,
    cache: ExistenceCache,
}

impl<'a> DeferralResolver<'a> {
    pub fn new(oracle: &'a dyn ExistenceOracle) -> Self {
        Self::with_cache(oracle, ExistenceCache::new())
    }

    /// Use a caller-owned cache (e.g. to inspect it afterwards)
    pub fn with_cache(oracle: &'a dyn ExistenceOracle, cache: ExistenceCache) -> Self {
        Self { oracle, cache }
    }

    pub fn cache(&self) -> &ExistenceCache {
        &self.cache
    }

    /// Resolve deferral in place
    ///
    /// `executed` is the set of nodes this invocation builds, tests or
    /// compiles; none of them is ever deferred. Without `defer` this is a
    /// no-op.
    pub async fn resolve(
        &self,
        graph: &mut CurrentGraph,
        policy: &DeferralPolicy,
        state: Option<&StateManifest>,
        executed: &BTreeSet<NodeId>,
    ) -> Result<ResolutionOutcome, DeferralError> {
        if !policy.defer {
            return Ok(ResolutionOutcome::default());
        }

        let state = state.ok_or(DeferralError::MissingState)?;
        let (_, _, calls_before) = self.cache.stats();

        let closure = graph.dag().upstream_closure(executed);
        let mut outcome = ResolutionOutcome::default();
        let mut substitutions = Vec::new();

        for id in closure.iter().filter(|id| !executed.contains(*id)) {
            match self.decide(graph, policy, state, id).await? {
                Decision::Defer(record) => {
                    tracing::debug!(node = %id, "deferring to state");
                    outcome.deferred.insert(id.clone());
                    substitutions.push(record);
                }
                Decision::Keep => {
                    outcome.kept.insert(id.clone());
                }
                Decision::Missing => {
                    for child in graph.dag().children(id) {
                        if closure.contains(child) && graph.contains(child) {
                            tracing::warn!(
                                node = %child,
                                missing = %id,
                                "upstream not found in current graph or state"
                            );
                            outcome.warnings.push(DanglingDependency {
                                child: child.clone(),
                                missing: id.clone(),
                            });
                        }
                    }
                }
            }
        }

        for record in substitutions {
            graph.substitute(record);
        }

        let (_, _, calls_after) = self.cache.stats();
        outcome.existence_checks = calls_after - calls_before;
        outcome.warnings.sort();

        tracing::info!(
            deferred = outcome.deferred.len(),
            kept = outcome.kept.len(),
            warnings = outcome.warnings.len(),
            existence_checks = outcome.existence_checks,
            favor_state = policy.favor_state,
            "resolved deferral"
        );

        Ok(outcome)
    }

    async fn decide(
        &self,
        graph: &CurrentGraph,
        policy: &DeferralPolicy,
        state: &StateManifest,
        id: &str,
    ) -> Result<Decision, DeferralError> {
        let recorded = state.get(id).filter(|node| node.is_refable() && !node.is_ephemeral());

        let Some(current) = graph.node(id) else {
            if graph.source(id).is_some() {
                return Ok(Decision::Keep);
            }
            return Ok(match recorded {
                Some(record) => Decision::Defer(deferred_copy(record)),
                None => Decision::Missing,
            });
        };

        if !current.is_refable() || current.is_ephemeral() {
            return Ok(Decision::Keep);
        }

        let Some(record) = recorded else {
            tracing::debug!(node = %id, "not in state, keeping current definition");
            return Ok(Decision::Keep);
        };

        if policy.favor_state {
            return Ok(Decision::Defer(deferred_copy(record)));
        }

        let exists = match current.relation() {
            Some(relation) => self.exists(id, &relation).await?,
            None => false,
        };

        Ok(if exists {
            tracing::debug!(node = %id, "exists in current environment, not deferring");
            Decision::Keep
        } else {
            Decision::Defer(deferred_copy(record))
        })
    }

    async fn exists(&self, id: &str, relation: &Relation) -> Result<bool, DeferralError> {
        self.cache
            .check(self.oracle, relation)
            .await
            .map_err(|source| DeferralError::Oracle {
                node: id.to_string(),
                relation: relation.fqn(),
                source,
            })
    }
}

fn deferred_copy(record: &ManifestNode) -> ManifestNode {
    ManifestNode {
        deferred: true,
        ..record.clone()
    }
}
