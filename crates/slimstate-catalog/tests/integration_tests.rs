//! Integration tests for warehouses
//!
//! Tests against a live PostgreSQL server are marked `#[ignore]`:
//!
//! ```bash
//! PGHOST=localhost PGPORT=5432 PGDATABASE=dbt PGUSER=user PGPASSWORD=pass \
//! cargo test -p slimstate-catalog --features postgres --test integration_tests -- --ignored
//! ```

use slimstate_catalog::{
    CatalogError, ExecutionRequest, ExistenceOracle, Materialization, MockWarehouse, MockWarehouseBuilder,
    Relation, Warehouse,
};
use std::sync::Arc;

fn has_postgres_credentials() -> bool {
    std::env::var("PGHOST").is_ok()
}

fn build(id: &str, target: Relation, sql: &str, references: Vec<Relation>) -> ExecutionRequest {
    ExecutionRequest {
        unique_id: id.to_string(),
        materialization: Materialization::View,
        target: Some(target),
        sql: sql.to_string(),
        references,
    }
}

#[tokio::test]
async fn oracle_is_usable_as_trait_object() {
    let warehouse = MockWarehouseBuilder::new()
        .with_relation("dbt", "defer_state", "seed")
        .build();
    let oracle: Arc<dyn ExistenceOracle> = Arc::new(warehouse.clone());

    assert_eq!(oracle.name(), "Mock");
    assert!(oracle.relation_exists(&Relation::new("dbt", "defer_state", "seed")).await.unwrap());
    assert!(!oracle.relation_exists(&Relation::new("dbt", "other", "seed")).await.unwrap());
    assert_eq!(warehouse.total_existence_checks().await, 2);
}

#[tokio::test]
async fn building_a_chain_in_order() {
    let warehouse = MockWarehouseBuilder::new()
        .with_relation("dbt", "prod", "seed")
        .build();
    let seed = Relation::new("dbt", "prod", "seed");
    let view = Relation::new("dbt", "prod", "view_model");
    let table = Relation::new("dbt", "prod", "table_model");

    warehouse
        .execute(&build("model.test.view_model", view.clone(), "select * from seed", vec![seed]))
        .await
        .unwrap();
    warehouse
        .execute(&build("model.test.table_model", table.clone(), "select * from view_model", vec![view]))
        .await
        .unwrap();

    assert!(warehouse.has_relation(&table).await);
    let executed: Vec<String> = warehouse.executed().await.into_iter().map(|r| r.unique_id).collect();
    assert_eq!(executed, vec!["model.test.view_model", "model.test.table_model"]);
}

#[tokio::test]
async fn reading_another_environment_fails_after_it_is_dropped() {
    let warehouse = MockWarehouseBuilder::new()
        .with_relation("dbt", "prod", "seed")
        .build();
    let prod_seed = Relation::new("dbt", "prod", "seed");

    warehouse.drop_schema("dbt", "prod").await;

    let err = warehouse
        .execute(&build(
            "model.test.view_model",
            Relation::new("dbt", "dev", "view_model"),
            "select * from prod.seed",
            vec![prod_seed],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::RelationNotFound(_)));
}

#[tokio::test]
async fn latency_is_applied() {
    let warehouse = MockWarehouse::new().with_latency(20);
    let start = std::time::Instant::now();
    warehouse.test_connection().await.unwrap();
    assert!(start.elapsed().as_millis() >= 20);
}

#[tokio::test]
#[ignore]
async fn postgres_existence_check() {
    if !has_postgres_credentials() {
        eprintln!("Skipping PostgreSQL test: set PGHOST, PGPORT, PGDATABASE, PGUSER and PGPASSWORD");
        return;
    }

    #[cfg(feature = "postgres")]
    {
        use slimstate_catalog::PostgresWarehouse;

        let host = std::env::var("PGHOST").expect("PGHOST must be set");
        let port: u16 = std::env::var("PGPORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .expect("Invalid port");
        let database = std::env::var("PGDATABASE").expect("PGDATABASE must be set");
        let user = std::env::var("PGUSER").expect("PGUSER must be set");
        let password = std::env::var("PGPASSWORD").expect("PGPASSWORD must be set");

        let warehouse = PostgresWarehouse::connect(&host, port, &database, &user, &password)
            .await
            .expect("Failed to connect to PostgreSQL");
        warehouse.test_connection().await.expect("Connection test failed");

        let missing = Relation::new(database.as_str(), "slimstate_missing_schema", "nothing_here");
        assert!(!warehouse.relation_exists(&missing).await.unwrap());
    }
}
