//! PostgreSQL warehouse using information_schema
//!
//! Existence checks query `information_schema.tables`, which covers both
//! tables and views. Works with PostgreSQL 9.4+, Redshift and other
//! PostgreSQL-compatible databases.
//!
//! Views and tables are rebuilt with `drop ... cascade` followed by
//! `create view` / `create table as`. Tests run as `select count(*)` over
//! the compiled test query. Seed loading, snapshots and incremental
//! strategies are not implemented and return [`CatalogError::Unsupported`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! let warehouse = PostgresWarehouse::connect(
//!     "localhost", 5432, "dbt", "username", "password"
//! ).await?;
//!
//! let warehouse = PostgresWarehouse::from_connection_string_with_tls(
//!     "host=db.example.com port=5432 dbname=dbt user=username password=password"
//! ).await?;
//! ```

use crate::adapter::{CatalogError, ExecutionOutcome, ExecutionRequest, ExistenceOracle, Materialization, Warehouse};
use slimstate_core::Relation;

#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Config as PgConfig, NoTls};

#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;

#[cfg(feature = "postgres")]
use native_tls::TlsConnector;

#[cfg(not(feature = "postgres"))]
const NOT_COMPILED: &str = "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres";

const ADAPTER_NAME: &str = "PostgreSQL";

/// PostgreSQL warehouse
pub struct PostgresWarehouse {
    /// PostgreSQL client (only available with postgres feature)
    #[cfg(feature = "postgres")]
    client: Client,

    host: String,

    port: u16,

    database: String,

    #[cfg(not(feature = "postgres"))]
    _phantom: std::marker::PhantomData<()>,
}

impl PostgresWarehouse {
    /// Connect with direct credentials over a plain connection
    #[cfg(feature = "postgres")]
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CatalogError> {
        let host = host.into();
        let database = database.into();

        let config = format!(
            "host={} port={} dbname={} user={} password={}",
            host,
            port,
            database,
            user.into(),
            password.into()
        );

        let (client, connection) = tokio_postgres::connect(&config, NoTls).await.map_err(|e| {
            CatalogError::AuthenticationError(format!(
                "Failed to connect to PostgreSQL at {}:{}: {}",
                host, port, e
            ))
        })?;

        let label = format!("{}:{}", host, port);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(server = %label, error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Self {
            client,
            host,
            port,
            database,
        })
    }

    #[cfg(not(feature = "postgres"))]
    pub async fn connect(
        _host: impl Into<String>,
        _port: u16,
        _database: impl Into<String>,
        _user: impl Into<String>,
        _password: impl Into<String>,
    ) -> Result<Self, CatalogError> {
        Err(CatalogError::ConfigError(NOT_COMPILED.to_string()))
    }

    /// Connect from a libpq-style connection string
    ///
    /// `host=localhost port=5432 dbname=dbt user=postgres password=secret`
    #[cfg(feature = "postgres")]
    pub async fn from_connection_string(conn_str: &str) -> Result<Self, CatalogError> {
        let (host, port, database) = Self::describe(conn_str)?;

        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(|e| CatalogError::AuthenticationError(format!("Failed to connect: {}", e)))?;

        let label = format!("{}:{}", host, port);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(server = %label, error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Self {
            client,
            host,
            port,
            database,
        })
    }

    #[cfg(not(feature = "postgres"))]
    pub async fn from_connection_string(_conn_str: &str) -> Result<Self, CatalogError> {
        Err(CatalogError::ConfigError(NOT_COMPILED.to_string()))
    }

    /// Connect from a connection string, always using TLS
    #[cfg(feature = "postgres")]
    pub async fn from_connection_string_with_tls(conn_str: &str) -> Result<Self, CatalogError> {
        let (host, port, database) = Self::describe(conn_str)?;

        let connector = TlsConnector::builder()
            .build()
            .map_err(|e| CatalogError::ConfigError(format!("Failed to create TLS connector: {}", e)))?;

        let (client, connection) = tokio_postgres::connect(conn_str, MakeTlsConnector::new(connector))
            .await
            .map_err(|e| CatalogError::AuthenticationError(format!("Failed to connect with TLS: {}", e)))?;

        let label = format!("{}:{}", host, port);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(server = %label, error = %e, "PostgreSQL TLS connection error");
            }
        });

        Ok(Self {
            client,
            host,
            port,
            database,
        })
    }

    #[cfg(not(feature = "postgres"))]
    pub async fn from_connection_string_with_tls(_conn_str: &str) -> Result<Self, CatalogError> {
        Err(CatalogError::ConfigError(NOT_COMPILED.to_string()))
    }

    /// Host, port and database named by a connection string
    #[cfg(feature = "postgres")]
    fn describe(conn_str: &str) -> Result<(String, u16, String), CatalogError> {
        let config: PgConfig = conn_str
            .parse()
            .map_err(|e| CatalogError::ConfigError(format!("Invalid connection string: {}", e)))?;

        let host = config
            .get_hosts()
            .first()
            .map(|h| format!("{:?}", h))
            .unwrap_or_else(|| "localhost".to_string());
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let database = config.get_dbname().unwrap_or("postgres").to_string();

        Ok((host, port, database))
    }

    /// SQL that builds (or, for tests, evaluates) a request
    ///
    /// Returns `Unsupported` for materializations this adapter cannot build.
    pub fn statement_for(request: &ExecutionRequest) -> Result<String, CatalogError> {
        let unsupported = |what: &str| CatalogError::Unsupported {
            adapter: ADAPTER_NAME,
            what: what.to_string(),
        };

        let target = |request: &ExecutionRequest| {
            request.target.clone().ok_or_else(|| {
                CatalogError::ExecutionError(format!("{} has no target relation", request.unique_id))
            })
        };

        let sql = request.sql.trim().trim_end_matches(';');

        match request.materialization {
            Materialization::View => {
                let target = target(request)?;
                Ok(format!(
                    "{}\ndrop view if exists {rel} cascade;\ncreate view {rel} as (\n{}\n);",
                    Self::create_schema(&target),
                    sql,
                    rel = target.render(),
                ))
            }
            Materialization::Table => {
                let target = target(request)?;
                Ok(format!(
                    "{}\ndrop table if exists {rel} cascade;\ncreate table {rel} as (\n{}\n);",
                    Self::create_schema(&target),
                    sql,
                    rel = target.render(),
                ))
            }
            Materialization::Test => Ok(format!("select count(*) from (\n{}\n) as dbt_internal_test", sql)),
            Materialization::Seed => Err(unsupported("seed loading")),
            Materialization::Snapshot => Err(unsupported("snapshots")),
            Materialization::Incremental => Err(unsupported("incremental models")),
        }
    }

    fn create_schema(relation: &Relation) -> String {
        format!(
            "create schema if not exists \"{}\";",
            relation.schema.replace('"', "\"\"")
        )
    }

    /// Map a driver error onto the catalog taxonomy
    fn classify(error: impl std::fmt::Display, context: &str) -> CatalogError {
        let message = error.to_string();
        if message.contains("permission denied") {
            CatalogError::PermissionDenied(format!("{}: {}", context, message))
        } else if message.contains("does not exist") {
            CatalogError::RelationNotFound(format!("{}: {}", context, message))
        } else {
            CatalogError::QueryError(format!("{}: {}", context, message))
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

#[async_trait::async_trait]
impl ExistenceOracle for PostgresWarehouse {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    #[cfg(feature = "postgres")]
    async fn relation_exists(&self, relation: &Relation) -> Result<bool, CatalogError> {
        let query = r#"
            SELECT EXISTS (
                SELECT 1
                FROM information_schema.tables
                WHERE table_catalog = $1
                  AND table_schema = $2
                  AND table_name = $3
            )
        "#;

        let row = self
            .client
            .query_one(query, &[&relation.database, &relation.schema, &relation.identifier])
            .await
            .map_err(|e| Self::classify(e, &relation.fqn()))?;

        Ok(row.get(0))
    }

    #[cfg(not(feature = "postgres"))]
    async fn relation_exists(&self, _relation: &Relation) -> Result<bool, CatalogError> {
        Err(CatalogError::ConfigError(NOT_COMPILED.to_string()))
    }
}

#[async_trait::async_trait]
impl Warehouse for PostgresWarehouse {
    #[cfg(feature = "postgres")]
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, CatalogError> {
        let statement = Self::statement_for(request)?;

        if request.materialization == Materialization::Test {
            let row = self
                .client
                .query_one(statement.as_str(), &[])
                .await
                .map_err(|e| Self::classify(e, &request.unique_id))?;
            let failures: i64 = row.get(0);

            return Ok(ExecutionOutcome {
                rows_affected: None,
                failures: Some(failures.max(0) as u64),
                message: "SELECT".to_string(),
            });
        }

        self.client
            .batch_execute(&statement)
            .await
            .map_err(|e| Self::classify(e, &request.unique_id))?;

        Ok(ExecutionOutcome {
            rows_affected: None,
            failures: None,
            message: format!("CREATE {}", request.materialization.to_string().to_uppercase()),
        })
    }

    #[cfg(not(feature = "postgres"))]
    async fn execute(&self, _request: &ExecutionRequest) -> Result<ExecutionOutcome, CatalogError> {
        Err(CatalogError::ConfigError(NOT_COMPILED.to_string()))
    }

    #[cfg(feature = "postgres")]
    async fn test_connection(&self) -> Result<(), CatalogError> {
        self.client
            .query("SELECT 1", &[])
            .await
            .map_err(|e| CatalogError::QueryError(format!("Connection test failed: {}", e)))?;
        Ok(())
    }

    #[cfg(not(feature = "postgres"))]
    async fn test_connection(&self) -> Result<(), CatalogError> {
        Err(CatalogError::ConfigError(NOT_COMPILED.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(materialization: Materialization) -> ExecutionRequest {
        ExecutionRequest {
            unique_id: "model.test.view_model".to_string(),
            materialization,
            target: Some(Relation::new("dbt", "prod", "view_model")),
            sql: "select * from \"dbt\".\"prod\".\"seed\";".to_string(),
            references: vec![Relation::new("dbt", "prod", "seed")],
        }
    }

    #[test]
    fn view_statement() {
        let sql = PostgresWarehouse::statement_for(&request(Materialization::View)).unwrap();
        assert!(sql.starts_with("create schema if not exists \"prod\";"));
        assert!(sql.contains("drop view if exists \"dbt\".\"prod\".\"view_model\" cascade;"));
        assert!(sql.contains("create view \"dbt\".\"prod\".\"view_model\" as (\nselect * from \"dbt\".\"prod\".\"seed\"\n);"));
    }

    #[test]
    fn table_statement() {
        let sql = PostgresWarehouse::statement_for(&request(Materialization::Table)).unwrap();
        assert!(sql.contains("create table \"dbt\".\"prod\".\"view_model\" as ("));
    }

    #[test]
    fn test_statement_counts_rows() {
        let mut test = request(Materialization::Test);
        test.target = None;
        let sql = PostgresWarehouse::statement_for(&test).unwrap();
        assert!(sql.starts_with("select count(*) from ("));
    }

    #[test]
    fn unsupported_materializations() {
        for materialization in [Materialization::Seed, Materialization::Snapshot, Materialization::Incremental] {
            assert!(matches!(
                PostgresWarehouse::statement_for(&request(materialization)),
                Err(CatalogError::Unsupported { adapter: "PostgreSQL", .. })
            ));
        }
    }

    #[test]
    fn view_without_target_fails() {
        let mut view = request(Materialization::View);
        view.target = None;
        assert!(matches!(
            PostgresWarehouse::statement_for(&view),
            Err(CatalogError::ExecutionError(_))
        ));
    }

    #[test]
    fn error_classification() {
        assert!(matches!(
            PostgresWarehouse::classify("permission denied for schema prod", "x"),
            CatalogError::PermissionDenied(_)
        ));
        assert!(matches!(
            PostgresWarehouse::classify("relation \"seed\" does not exist", "x"),
            CatalogError::RelationNotFound(_)
        ));
        assert!(matches!(
            PostgresWarehouse::classify("syntax error", "x"),
            CatalogError::QueryError(_)
        ));
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn connect_without_feature_fails() {
        let result = PostgresWarehouse::connect("localhost", 5432, "dbt", "user", "pass").await;
        assert!(matches!(result, Err(CatalogError::ConfigError(_))));
    }
}
