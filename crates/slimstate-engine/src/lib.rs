//! slimstate engine - deferral and invocation
//!
//! This crate implements:
//! - Deferral resolution against prior state
//! - Per-pass relation existence caching
//! - The invocation pipeline (seed, run, test, snapshot, compile, docs generate)
//! - catalog.json generation

pub mod cache;
pub mod docs;
pub mod invocation;
pub mod resolver;

pub use cache::ExistenceCache;
pub use docs::{Catalog, CatalogEntry, RelationMetadata, CATALOG_FILE};
pub use invocation::{Command, Invocation, InvocationError, InvocationResult, Runner, RUN_RESULTS_FILE};
pub use resolver::{DeferralError, DeferralResolver, ResolutionOutcome};
