//! End-to-end executor tests.
//!
//! Drives `RemoteExecutor` through its public API with credential files on
//! disk and a mock connector in place of a live database.

use db_courier::cache::CacheStore;
use db_courier::config::{ConfigResolver, CredentialSource};
use db_courier::db::{ColumnInfo, Dataset, QueryResult, Value};
use db_courier::error::CourierError;
use db_courier::query::{
    Completion, ExecuteRequest, ExecutionOutcome, ExecutionState, RemoteExecutor,
};
use db_courier::tunnel::{ConnectionMode, MockConnector, StaticTokenProvider, TunnelManager};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    connector: MockConnector,
    executor: RemoteExecutor,
}

impl Harness {
    fn new(connector: MockConnector) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let credentials_dir = dir.path().join("credentials");
        std::fs::create_dir_all(&credentials_dir).unwrap();
        std::fs::write(
            credentials_dir.join("config.json"),
            r#"{"DB_USER": "analyst", "DB_PASSWORD": "pw", "DB_HOST": "db.internal", "DB_PORT": 5432}"#,
        )
        .unwrap();
        std::fs::write(
            credentials_dir.join("warehouse.toml"),
            "DB_USER = \"loader\"\nDB_HOST = \"cluster.example.com\"\nDB_PORT = 5439\nCLUSTER_NAME = \"analytics\"\n",
        )
        .unwrap();

        let tunnels = TunnelManager::new(Arc::new(connector.clone())).with_token_provider(
            Arc::new(StaticTokenProvider::new("IAM:loader", "temporary-token")),
        );
        let executor = RemoteExecutor::new(
            ConfigResolver::new(credentials_dir),
            tunnels,
            CacheStore::new(dir.path().join("queries")),
        );
        Self {
            _dir: dir,
            connector,
            executor,
        }
    }

    fn cache_dir(&self) -> &Path {
        self.executor.cache().dir()
    }

    fn cache_files(&self) -> usize {
        std::fs::read_dir(self.cache_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn orders() -> QueryResult {
    QueryResult::with_data(
        vec![ColumnInfo::new("id", "INT4"), ColumnInfo::new("total", "FLOAT8")],
        (1..=10)
            .map(|i| vec![Value::Int(i), Value::Float(i as f64 * 1.5)])
            .collect(),
    )
}

#[tokio::test]
async fn test_select_with_default_credentials() {
    let harness = Harness::new(MockConnector::new().with_result(orders()));

    let outcome = harness
        .executor
        .execute(ExecuteRequest::sql("SELECT * FROM ORDERS LIMIT 10"))
        .await
        .unwrap();

    assert_eq!(outcome.row_count(), 10);
    let config = harness.connector.last_config().unwrap();
    assert_eq!(config.host.as_deref(), Some("db.internal"));
    assert_eq!(config.user.as_deref(), Some("analyst"));
    assert_eq!(harness.connector.stats().closes(), 1);
}

#[tokio::test]
async fn test_iam_redshift_uses_token_and_ssl() {
    let harness = Harness::new(MockConnector::new().with_result(orders()));

    harness
        .executor
        .execute(
            ExecuteRequest::sql("SELECT * FROM events")
                .with_credentials(CredentialSource::Named("warehouse".to_string()))
                .with_mode(ConnectionMode::Iam),
        )
        .await
        .unwrap();

    let config = harness.connector.last_config().unwrap();
    assert_eq!(config.port, 5439);
    assert_eq!(config.user.as_deref(), Some("IAM:loader"));
    assert_eq!(config.password.as_deref(), Some("temporary-token"));
    assert_eq!(config.sslmode.as_deref(), Some("require"));
}

#[tokio::test]
async fn test_cached_select_skips_second_round_trip() {
    let harness = Harness::new(MockConnector::new().with_result(orders()));
    let request = || {
        ExecuteRequest::sql("SELECT * FROM ORDERS LIMIT 10")
            .with_cache("2 hours")
            .with_cache_name("orders")
    };

    let first = harness.executor.execute(request()).await.unwrap();
    let second = harness.executor.execute(request()).await.unwrap();

    assert_eq!(harness.connector.stats().round_trips(), 1);
    assert_eq!(harness.cache_files(), 2);
    assert!(harness.cache_dir().join("orders.json").is_file());
    assert!(harness.cache_dir().join("orders.sql").is_file());

    let first_meta = first.rows().and_then(|r| r.cache.clone()).unwrap();
    let second_meta = second.rows().and_then(|r| r.cache.clone()).unwrap();
    assert!(!first_meta.hit);
    assert!(second_meta.hit);
    assert_eq!(first_meta.created_at, second_meta.created_at);
    assert_eq!(first.rows().unwrap().rows, second.rows().unwrap().rows);
}

#[tokio::test]
async fn test_refresh_reexecutes_cached_select() {
    let harness = Harness::new(MockConnector::new().with_result(orders()));
    let request = ExecuteRequest::sql("SELECT * FROM ORDERS").with_cache("1 day");

    harness.executor.execute(request.clone()).await.unwrap();
    harness
        .executor
        .execute(request.with_refresh(true))
        .await
        .unwrap();

    assert_eq!(harness.connector.stats().round_trips(), 2);
    assert_eq!(harness.cache_files(), 2);
}

#[tokio::test]
async fn test_dataset_insert_from_json() {
    let harness = Harness::new(MockConnector::new());
    let dataset = Dataset::from_json(
        r#"[{"id": 1, "customer": "acme"}, {"id": 2, "customer": null}, {"id": 3}]"#,
    )
    .unwrap();

    let outcome = harness
        .executor
        .execute(ExecuteRequest::dataset(dataset).with_table("orders"))
        .await
        .unwrap();

    assert!(matches!(outcome, ExecutionOutcome::Inserted(3)));
    let executed = harness.connector.stats().executed();
    assert_eq!(executed.len(), 3);
    assert_eq!(
        executed[1].0,
        "INSERT INTO orders (id, customer) VALUES ($1, NULL)"
    );
    assert_eq!(executed[1].1, vec![Value::Int(2)]);
}

#[tokio::test]
async fn test_dataset_insert_without_autofill_fails() {
    let harness = Harness::new(MockConnector::new());
    let dataset = Dataset::new(["id", "customer"])
        .with_row([("id", Value::Int(1)), ("customer", Value::String("a".into()))])
        .with_row([("id", Value::Int(2)), ("customer", Value::Null)]);

    let error = harness
        .executor
        .execute(
            ExecuteRequest::dataset(dataset)
                .with_table("orders")
                .with_autofill_nulls(false),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        CourierError::DataIntegrity { row: 1, ref column } if column == "customer"
    ));
    assert_eq!(harness.connector.stats().closes(), 1);
    assert_eq!(
        harness.executor.last_trace().last(),
        Some(&ExecutionState::TunnelClosed(Completion::Failure))
    );
}

#[tokio::test]
async fn test_table_mismatch_never_connects() {
    let harness = Harness::new(MockConnector::new());

    let error = harness
        .executor
        .execute(
            ExecuteRequest::sql("DELETE FROM orders WHERE id = 1")
                .with_query_type("DELETE")
                .with_table("customers"),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, CourierError::TableMismatch { .. }));
    assert_eq!(harness.connector.opens(), 0);
}

#[tokio::test]
async fn test_missing_named_credentials() {
    let harness = Harness::new(MockConnector::new());

    let error = harness
        .executor
        .execute(
            ExecuteRequest::sql("SELECT 1")
                .with_credentials(CredentialSource::Named("nope".to_string())),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, CourierError::Configuration(_)));
    assert_eq!(harness.connector.opens(), 0);
    assert_eq!(
        harness.executor.last_trace(),
        vec![
            ExecutionState::Classifying,
            ExecutionState::ResolvingCredentials,
            ExecutionState::Failed,
        ]
    );
}

#[tokio::test]
async fn test_unknown_query_type_lists_allowed_kinds() {
    let harness = Harness::new(MockConnector::new());

    let error = harness
        .executor
        .execute(ExecuteRequest::sql("MERGE INTO orders").with_query_type("merge"))
        .await
        .unwrap_err();

    assert!(matches!(error, CourierError::InvalidQuery(_)));
    assert!(error.to_string().contains("UNLOAD"));
}
