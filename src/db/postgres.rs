//! PostgreSQL database client implementation.
//!
//! Provides the `PostgresClient` struct that implements the `DatabaseClient` trait
//! for PostgreSQL and Redshift using sqlx.

use crate::config::ConnectionConfig;
use crate::db::{ColumnInfo, DatabaseBackend, DatabaseClient, QueryResult, Row, Value};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column as SqlxColumn, Postgres, Row as SqlxRow, TypeInfo};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Column names and rendered types of one relation.
const COLUMN_TYPES_SQL: &str = "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
     FROM pg_catalog.pg_attribute a \
     WHERE a.attrelid = $1::regclass AND a.attnum > 0 AND NOT a.attisdropped";

/// PostgreSQL / Redshift database client.
///
/// Holds a single-connection pool: a client lives for exactly one call.
#[derive(Debug)]
pub struct PostgresClient {
    pool: PgPool,
    query_timeout: Duration,
}

impl PostgresClient {
    /// Opens a connection. Failures are not retried.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;
        debug!("Connecting to {}", config.display_string());

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect(&conn_str)
            .await
            .map_err(|e| map_connection_error(e, config))?;

        debug!("Successfully connected to database");
        Ok(Self {
            pool,
            query_timeout: config.query_timeout,
        })
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    ) -> Result<T> {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| {
                CourierError::query(format!(
                    "Query timed out after {} seconds",
                    self.query_timeout.as_secs()
                ))
            })?
            .map_err(|e| CourierError::query(format_query_error(e)))
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
    }

    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        let start = Instant::now();

        let result = self
            .with_timeout(sqlx::query(sql).fetch_all(&self.pool))
            .await?;

        let execution_time = start.elapsed();

        let columns: Vec<ColumnInfo> = result
            .first()
            .map(|first_row| {
                first_row
                    .columns()
                    .iter()
                    .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                    .collect()
            })
            .unwrap_or_default();

        let rows: Vec<Row> = result.iter().map(convert_row).collect();

        Ok(QueryResult::with_data(columns, rows).with_execution_time(execution_time))
    }

    async fn execute_statement(&self, sql: &str) -> Result<u64> {
        // Simple query protocol: COPY/UNLOAD/GRANT and multi-statement scripts
        // are not preparable.
        let done = self
            .with_timeout(sqlx::raw_sql(sql).execute(&self.pool))
            .await?;
        Ok(done.rows_affected())
    }

    async fn execute_with_params(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let query = params
            .iter()
            .fold(sqlx::query(sql), |query, value| bind_value(query, value));
        let done = self.with_timeout(query.execute(&self.pool)).await?;
        Ok(done.rows_affected())
    }

    async fn column_types(&self, table: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = self
            .with_timeout(
                sqlx::query_as(COLUMN_TYPES_SQL)
                    .bind(table)
                    .fetch_all(&self.pool),
            )
            .await?;
        debug!("Fetched {} column types for {table}", rows.len());
        Ok(rows.into_iter().collect())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Binds a value as a positional parameter.
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::String(s) => query.bind(s.as_str()),
        Value::Bytes(b) => query.bind(b.as_slice()),
    }
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "NUMERIC" | "DECIMAL" => row
            .try_get::<Option<rust_decimal::Decimal>, _>(index)
            .ok()
            .flatten()
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),

        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .ok()
            .flatten()
            .map(|t| Value::String(t.to_string()))
            .unwrap_or(Value::Null),

        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .ok()
            .flatten()
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null),

        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .ok()
            .flatten()
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        // For all other types, try to get as string
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> CourierError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    let message = if error_str.contains("connection refused")
        || error_str.contains("could not connect")
    {
        format!("Cannot connect to {host}:{port}. Check that the server is running.")
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        format!("Authentication failed for user '{user}'. Check your credentials.")
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        format!("Database '{database}' does not exist.")
    } else if error_str.contains("ssl") || error_str.contains("tls") {
        "Server requires SSL. Set sslmode=require for this connection.".to_string()
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        )
    } else {
        error.to_string()
    };

    CourierError::connection(DatabaseBackend::Postgres.as_str(), message)
}

/// Formats a query error with the Postgres detail/hint fields when present.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = String::from("ERROR: ");
    result.push_str(db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }

        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }

        if let Some(table) = pg_error.table() {
            result.push_str("\n  TABLE: ");
            result.push_str(table);
        }

        if let Some(column) = pg_error.column() {
            result.push_str("\n  COLUMN: ");
            result.push_str(column);
        }
    }

    result
}
