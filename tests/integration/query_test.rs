//! Query execution integration tests.
//!
//! Tests statements, dataset inserts and the result cache against a live
//! PostgreSQL database.

use db_courier::cache::CacheStore;
use db_courier::config::ConnectionConfig;
use db_courier::db::{DatabaseClient, Dataset, PostgresClient, Value};
use db_courier::error::CourierError;
use db_courier::query::DataInserter;
use std::time::Duration;

/// Helper to get test database URL from environment.
fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

/// Helper to create a test client.
async fn get_test_client() -> Option<PostgresClient> {
    let url = get_test_database_url()?;
    let config = ConnectionConfig::from_connection_string(&url).ok()?;
    PostgresClient::connect(&config).await.ok()
}

async fn create_table(client: &PostgresClient, table: &str) {
    client
        .execute_statement(&format!("DROP TABLE IF EXISTS {table}"))
        .await
        .unwrap();
    client
        .execute_statement(&format!(
            "CREATE TABLE {table} (id BIGINT, customer TEXT, total DOUBLE PRECISION)"
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_execute_simple_select() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let result = client
        .execute_query("SELECT 1 as num, 'hello' as greeting")
        .await
        .unwrap();

    assert_eq!(result.columns.len(), 2);
    assert_eq!(result.columns[0].name, "num");
    assert_eq!(result.columns[1].name, "greeting");
    assert_eq!(result.row_count, 1);
    assert!(result.cache.is_none());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_execute_statement_reports_affected_rows() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    create_table(&client, "courier_it_statements").await;

    let inserted = client
        .execute_statement(
            "INSERT INTO courier_it_statements (id, customer) VALUES (1, 'a'), (2, 'b')",
        )
        .await
        .unwrap();
    let deleted = client
        .execute_statement("DELETE FROM courier_it_statements WHERE id = 2")
        .await
        .unwrap();

    assert_eq!(inserted, 2);
    assert_eq!(deleted, 1);

    client
        .execute_statement("DROP TABLE courier_it_statements")
        .await
        .unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_insert_dataset_with_null_autofill() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    create_table(&client, "courier_it_orders").await;

    let dataset = Dataset::new(["id", "customer", "total"])
        .with_row([
            ("id", Value::Int(1)),
            ("customer", Value::String("acme".into())),
            ("total", Value::Float(9.5)),
        ])
        .with_row([
            ("id", Value::Int(2)),
            ("customer", Value::Null),
            ("total", Value::Float(f64::NAN)),
        ]);

    let inserted = DataInserter::new(true)
        .insert(&dataset, "courier_it_orders", &client)
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let result = client
        .execute_query("SELECT count(*) AS n FROM courier_it_orders WHERE customer IS NULL AND total IS NULL")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], Value::Int(1));

    client
        .execute_statement("DROP TABLE courier_it_orders")
        .await
        .unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_insert_dataset_without_autofill_rejects_nulls() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let dataset = Dataset::new(["id", "customer"]).with_row([
        ("id", Value::Int(1)),
        ("customer", Value::Null),
    ]);

    let error = DataInserter::new(false)
        .insert(&dataset, "courier_it_never_created", &client)
        .await
        .unwrap_err();

    match error {
        CourierError::DataIntegrity { row, column } => {
            assert_eq!(row, 0);
            assert_eq!(column, "customer");
        }
        other => panic!("Expected data integrity error, got: {other:?}"),
    }
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_cached_select_round_trip() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheStore::new(dir.path());
    let sql = "SELECT 42 AS answer";

    let first = cache
        .lookup_or_execute(sql, &client, Duration::from_secs(60), None)
        .await
        .unwrap();
    client.close().await.unwrap();

    // The connection is closed, so a second call must be served from disk.
    let second = cache
        .lookup_or_execute(sql, &client, Duration::from_secs(60), None)
        .await
        .unwrap();

    assert_eq!(first.rows, second.rows);
    assert!(second.cache.as_ref().is_some_and(|meta| meta.hit));
}

#[tokio::test]
async fn test_insert_dataset_strings_into_typed_columns() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    client
        .execute_statement("DROP TABLE IF EXISTS courier_it_typed")
        .await
        .unwrap();
    client
        .execute_statement(
            "CREATE TABLE courier_it_typed \
             (id BIGINT, created DATE, seen_at TIMESTAMP, amount NUMERIC(12, 2), note VARCHAR(20))",
        )
        .await
        .unwrap();

    let dataset = Dataset::new(["id", "created", "seen_at", "amount", "note"]).with_row([
        ("id", Value::Int(1)),
        ("created", Value::String("2024-01-01".into())),
        ("seen_at", Value::String("2024-01-01 12:30:00".into())),
        ("amount", Value::String("19.99".into())),
        ("note", Value::String("first".into())),
    ]);

    let inserted = DataInserter::default()
        .insert(&dataset, "courier_it_typed", &client)
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let result = client
        .execute_query(
            "SELECT count(*) AS n FROM courier_it_typed \
             WHERE created = DATE '2024-01-01' AND amount = 19.99 AND note = 'first'",
        )
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], Value::Int(1));

    client
        .execute_statement("DROP TABLE courier_it_typed")
        .await
        .unwrap();
    client.close().await.unwrap();
}
