//! In-memory warehouse for testing
//!
//! Holds a set of relations instead of connecting anywhere. Executing a
//! model checks that everything it reads exists, then creates its relation,
//! so a graph that points at the wrong environment fails the same way it
//! would against a real warehouse.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use slimstate_catalog::{MockWarehouse, ExistenceOracle, Relation};
//!
//! let warehouse = MockWarehouse::new();
//! let seed = Relation::new("dbt", "prod", "seed");
//! warehouse.add_relation(seed.clone()).await;
//!
//! assert!(warehouse.relation_exists(&seed).await?);
//! assert_eq!(warehouse.existence_checks(&seed).await, 1);
//! ```
//!
//! ## Simulating Failures
//!
//! ```rust,ignore
//! // Every existence check and execution fails
//! let warehouse = MockWarehouse::new().with_connection_failure();
//!
//! // SQL containing this fragment fails to execute
//! warehouse.reject_sql_containing("select * fromm").await;
//! ```

use crate::adapter::{CatalogError, ExecutionOutcome, ExecutionRequest, ExistenceOracle, Warehouse};
use slimstate_core::Relation;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Mock warehouse for testing
///
/// Clones share state, so a test can keep a handle while the engine
/// owns another.
pub struct MockWarehouse {
    /// Existing relations by fqn
    relations: Arc<RwLock<BTreeSet<String>>>,

    /// Errors returned by existence checks for specific relations
    errors: Arc<RwLock<HashMap<String, CatalogError>>>,

    /// SQL fragments that make execution fail
    rejected_sql: Arc<RwLock<Vec<String>>>,

    /// Failing row counts per test unique_id
    test_failures: Arc<RwLock<HashMap<String, u64>>>,

    /// Existence checks made, per relation fqn
    existence_checks: Arc<RwLock<HashMap<String, usize>>>,

    /// Every execution request received, in order
    executed: Arc<RwLock<Vec<ExecutionRequest>>>,

    /// Simulate connection failure
    fail_connection: bool,

    /// Simulate query latency (milliseconds)
    latency_ms: u64,

    /// Name to return from name() method
    adapter_name: &'static str,
}

impl MockWarehouse {
    /// Create an empty mock warehouse
    pub fn new() -> Self {
        Self {
            relations: Arc::new(RwLock::new(BTreeSet::new())),
            errors: Arc::new(RwLock::new(HashMap::new())),
            rejected_sql: Arc::new(RwLock::new(Vec::new())),
            test_failures: Arc::new(RwLock::new(HashMap::new())),
            existence_checks: Arc::new(RwLock::new(HashMap::new())),
            executed: Arc::new(RwLock::new(Vec::new())),
            fail_connection: false,
            latency_ms: 0,
            adapter_name: "Mock",
        }
    }

    /// Make a relation exist
    pub async fn add_relation(&self, relation: Relation) {
        self.relations.write().await.insert(relation.fqn());
    }

    /// Remove a relation
    pub async fn drop_relation(&self, relation: &Relation) {
        self.relations.write().await.remove(&relation.fqn());
    }

    /// Drop every relation in a schema
    pub async fn drop_schema(&self, database: &str, schema: &str) {
        let prefix = format!("{}.{}.", database, schema);
        self.relations.write().await.retain(|fqn| !fqn.starts_with(&prefix));
    }

    /// Check if a relation exists without counting it as an oracle call
    pub async fn has_relation(&self, relation: &Relation) -> bool {
        self.relations.read().await.contains(&relation.fqn())
    }

    /// All existing relation fqns, sorted
    pub async fn relation_names(&self) -> Vec<String> {
        self.relations.read().await.iter().cloned().collect()
    }

    /// Configure an error for existence checks against one relation
    pub async fn add_error_for_relation(&self, relation: &Relation, error: CatalogError) {
        self.errors.write().await.insert(relation.fqn(), error);
    }

    /// Fail any execution whose SQL contains `fragment`
    pub async fn reject_sql_containing(&self, fragment: impl Into<String>) {
        self.rejected_sql.write().await.push(fragment.into());
    }

    /// Make a test report `failures` failing rows
    pub async fn set_test_failures(&self, unique_id: impl Into<String>, failures: u64) {
        self.test_failures.write().await.insert(unique_id.into(), failures);
    }

    /// Number of existence checks made for one relation
    pub async fn existence_checks(&self, relation: &Relation) -> usize {
        self.existence_checks
            .read()
            .await
            .get(&relation.fqn())
            .copied()
            .unwrap_or(0)
    }

    /// Number of existence checks made in total
    pub async fn total_existence_checks(&self) -> usize {
        self.existence_checks.read().await.values().sum()
    }

    /// Execution requests received so far
    pub async fn executed(&self) -> Vec<ExecutionRequest> {
        self.executed.read().await.clone()
    }

    /// Reset call counters and the execution log (relations are kept)
    pub async fn clear_history(&self) {
        self.existence_checks.write().await.clear();
        self.executed.write().await.clear();
    }

    /// Configure every call to fail with a network error
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Configure simulated latency for all operations
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set a custom adapter name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.adapter_name = name;
        self
    }

    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
    }

    fn check_connection(&self) -> Result<(), CatalogError> {
        if self.fail_connection {
            Err(CatalogError::NetworkError("Simulated connection failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MockWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockWarehouse {
    fn clone(&self) -> Self {
        Self {
            relations: Arc::clone(&self.relations),
            errors: Arc::clone(&self.errors),
            rejected_sql: Arc::clone(&self.rejected_sql),
            test_failures: Arc::clone(&self.test_failures),
            existence_checks: Arc::clone(&self.existence_checks),
            executed: Arc::clone(&self.executed),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
            adapter_name: self.adapter_name,
        }
    }
}

#[async_trait::async_trait]
impl ExistenceOracle for MockWarehouse {
    fn name(&self) -> &'static str {
        self.adapter_name
    }

    async fn relation_exists(&self, relation: &Relation) -> Result<bool, CatalogError> {
        self.simulate_latency().await;

        *self
            .existence_checks
            .write()
            .await
            .entry(relation.fqn())
            .or_insert(0) += 1;

        self.check_connection()?;

        if let Some(error) = self.errors.read().await.get(&relation.fqn()) {
            return Err(error.clone());
        }

        Ok(self.has_relation(relation).await)
    }
}

#[async_trait::async_trait]
impl Warehouse for MockWarehouse {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, CatalogError> {
        self.simulate_latency().await;
        self.executed.write().await.push(request.clone());
        self.check_connection()?;

        let rejected = self.rejected_sql.read().await;
        if let Some(fragment) = rejected.iter().find(|f| request.sql.contains(f.as_str())) {
            return Err(CatalogError::ExecutionError(format!(
                "syntax error at or near \"{}\"",
                fragment
            )));
        }
        drop(rejected);

        for reference in &request.references {
            if !self.has_relation(reference).await {
                return Err(CatalogError::RelationNotFound(reference.render()));
            }
        }

        match &request.target {
            Some(target) if request.materialization.builds_relation() => {
                self.add_relation(target.clone()).await;
                Ok(ExecutionOutcome {
                    rows_affected: None,
                    failures: None,
                    message: format!("CREATE {}", request.materialization.to_string().to_uppercase()),
                })
            }
            _ if request.materialization.builds_relation() => Err(CatalogError::ExecutionError(format!(
                "{} has no target relation",
                request.unique_id
            ))),
            _ => {
                let failures = self
                    .test_failures
                    .read()
                    .await
                    .get(&request.unique_id)
                    .copied()
                    .unwrap_or(0);

                Ok(ExecutionOutcome {
                    rows_affected: None,
                    failures: Some(failures),
                    message: "SELECT".to_string(),
                })
            }
        }
    }

    async fn test_connection(&self) -> Result<(), CatalogError> {
        self.simulate_latency().await;
        self.check_connection()
    }
}

/// Builder for a MockWarehouse with predefined relations
///
/// ```rust,ignore
/// let warehouse = MockWarehouseBuilder::new()
///     .with_relation("dbt", "prod", "seed")
///     .with_relation("dbt", "prod", "view_model")
///     .build();
/// ```
pub struct MockWarehouseBuilder {
    relations: BTreeSet<String>,
    rejected_sql: Vec<String>,
    fail_connection: bool,
    latency_ms: u64,
    adapter_name: &'static str,
}

impl MockWarehouseBuilder {
    pub fn new() -> Self {
        Self {
            relations: BTreeSet::new(),
            rejected_sql: Vec::new(),
            fail_connection: false,
            latency_ms: 0,
            adapter_name: "Mock",
        }
    }

    pub fn with_relation(mut self, database: &str, schema: &str, identifier: &str) -> Self {
        self.relations.insert(Relation::new(database, schema, identifier).fqn());
        self
    }

    pub fn rejecting_sql(mut self, fragment: impl Into<String>) -> Self {
        self.rejected_sql.push(fragment.into());
        self
    }

    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.adapter_name = name;
        self
    }

    pub fn build(self) -> MockWarehouse {
        MockWarehouse {
            relations: Arc::new(RwLock::new(self.relations)),
            rejected_sql: Arc::new(RwLock::new(self.rejected_sql)),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
            adapter_name: self.adapter_name,
            ..MockWarehouse::new()
        }
    }
}

impl Default for MockWarehouseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Materialization;

    fn seed() -> Relation {
        Relation::new("dbt", "prod", "seed")
    }

    fn model_request(sql: &str, references: Vec<Relation>) -> ExecutionRequest {
        ExecutionRequest {
            unique_id: "model.test.view_model".to_string(),
            materialization: Materialization::View,
            target: Some(Relation::new("dbt", "prod", "view_model")),
            sql: sql.to_string(),
            references,
        }
    }

    #[tokio::test]
    async fn existence_checks_are_counted() {
        let warehouse = MockWarehouse::new();
        warehouse.add_relation(seed()).await;

        assert!(warehouse.relation_exists(&seed()).await.unwrap());
        assert!(!warehouse
            .relation_exists(&Relation::new("dbt", "other", "seed"))
            .await
            .unwrap());

        assert_eq!(warehouse.existence_checks(&seed()).await, 1);
        assert_eq!(warehouse.total_existence_checks().await, 2);

        warehouse.clear_history().await;
        assert_eq!(warehouse.total_existence_checks().await, 0);
        assert!(warehouse.has_relation(&seed()).await);
    }

    #[tokio::test]
    async fn configured_error_is_returned() {
        let warehouse = MockWarehouse::new();
        warehouse
            .add_error_for_relation(&seed(), CatalogError::PermissionDenied("no usage on schema".to_string()))
            .await;

        let err = warehouse.relation_exists(&seed()).await.unwrap_err();
        assert!(matches!(err, CatalogError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn connection_failure() {
        let warehouse = MockWarehouse::new().with_connection_failure();
        assert!(warehouse.test_connection().await.is_err());
        assert!(matches!(
            warehouse.relation_exists(&seed()).await,
            Err(CatalogError::NetworkError(_))
        ));
    }

    #[tokio::test]
    async fn model_needs_its_references() {
        let warehouse = MockWarehouse::new();
        let request = model_request("select * from \"dbt\".\"prod\".\"seed\"", vec![seed()]);

        let err = warehouse.execute(&request).await.unwrap_err();
        assert!(matches!(err, CatalogError::RelationNotFound(_)));

        warehouse.add_relation(seed()).await;
        let outcome = warehouse.execute(&request).await.unwrap();
        assert_eq!(outcome.message, "CREATE VIEW");
        assert!(warehouse.has_relation(&Relation::new("dbt", "prod", "view_model")).await);
        assert_eq!(warehouse.executed().await.len(), 2);
    }

    #[tokio::test]
    async fn rejected_sql_fails() {
        let warehouse = MockWarehouseBuilder::new()
            .with_relation("dbt", "prod", "seed")
            .rejecting_sql("fromm")
            .build();

        let err = warehouse
            .execute(&model_request("select * fromm \"dbt\".\"prod\".\"seed\"", vec![seed()]))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::ExecutionError(_)));
    }

    #[tokio::test]
    async fn tests_report_failures() {
        let warehouse = MockWarehouseBuilder::new().with_relation("dbt", "prod", "seed").build();
        warehouse.set_test_failures("test.test.not_null_seed_id", 3).await;

        let request = ExecutionRequest {
            unique_id: "test.test.not_null_seed_id".to_string(),
            materialization: Materialization::Test,
            target: None,
            sql: "select * from \"dbt\".\"prod\".\"seed\" where id is null".to_string(),
            references: vec![seed()],
        };

        let outcome = warehouse.execute(&request).await.unwrap();
        assert_eq!(outcome.failures, Some(3));
    }

    #[tokio::test]
    async fn drop_schema_removes_only_that_schema() {
        let warehouse = MockWarehouseBuilder::new()
            .with_relation("dbt", "prod", "seed")
            .with_relation("dbt", "prod_other", "seed")
            .build();

        warehouse.drop_schema("dbt", "prod").await;
        assert_eq!(warehouse.relation_names().await, vec!["dbt.prod_other.seed".to_string()]);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let warehouse = MockWarehouse::new().with_name("Postgres (mock)");
        let handle = warehouse.clone();

        warehouse.add_relation(seed()).await;
        assert!(handle.has_relation(&seed()).await);
        assert_eq!(handle.name(), "Postgres (mock)");
    }
}
