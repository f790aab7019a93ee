//! Warehouse boundary: relation existence and node execution
//!
//! The deferral resolver only needs [`ExistenceOracle`]; the invocation
//! pipeline also drives a [`Warehouse`] to build relations and run tests.
//!
//! ## Features
//!
//! Enable warehouse support via Cargo features:
//! - `postgres` - PostgreSQL/Redshift support
//! - `all-warehouses` - All warehouse adapters
//!
//! ## Example
//!
//! ```rust,ignore
//! use slimstate_catalog::{ExistenceOracle, MockWarehouse, Relation};
//!
//! let warehouse = MockWarehouse::new();
//! warehouse.add_relation(Relation::new("dbt", "defer_state", "seed")).await;
//! assert!(warehouse.relation_exists(&Relation::new("dbt", "defer_state", "seed")).await?);
//! ```

pub mod adapter;
pub mod mock;
pub mod postgres;

pub use adapter::{CatalogError, ExecutionOutcome, ExecutionRequest, ExistenceOracle, Materialization, Warehouse};
pub use mock::{MockWarehouse, MockWarehouseBuilder};
pub use postgres::PostgresWarehouse;
pub use slimstate_core::Relation;
