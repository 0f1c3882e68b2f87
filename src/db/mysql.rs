//! MySQL database client implementation.

use crate::config::ConnectionConfig;
use crate::db::{ColumnInfo, DatabaseBackend, DatabaseClient, QueryResult, Row, Value};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column as SqlxColumn, MySql, Row as SqlxRow, TypeInfo};
use std::time::{Duration, Instant};
use tracing::debug;

/// MySQL / MariaDB database client.
#[derive(Debug)]
pub struct MySqlClient {
    pool: MySqlPool,
    query_timeout: Duration,
}

impl MySqlClient {
    /// Opens a connection. Failures are not retried.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;
        debug!("Connecting to {}", config.display_string());

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect(&conn_str)
            .await
            .map_err(|e| map_connection_error(e, config))?;

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
            .map_err(|e| match e.as_database_error() {
                Some(db_error) => CourierError::query(format!("ERROR: {}", db_error.message())),
                None => CourierError::query(e.to_string()),
            })
    }
}

#[async_trait]
impl DatabaseClient for MySqlClient {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Mysql
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

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::String(s) => query.bind(s.as_str()),
        Value::Bytes(b) => query.bind(b.as_slice()),
    }
}

fn convert_row(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

fn convert_value(row: &MySqlRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => row
            .try_get::<Option<u64>, _>(index)
            .ok()
            .flatten()
            .map(|v| match i64::try_from(v) {
                Ok(i) => Value::Int(i),
                Err(_) => Value::String(v.to_string()),
            })
            .unwrap_or(Value::Null),

        "FLOAT" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "DOUBLE" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "DECIMAL" => row
            .try_get::<Option<rust_decimal::Decimal>, _>(index)
            .ok()
            .flatten()
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),

        "DATETIME" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .ok()
            .flatten()
            .map(|t| Value::String(t.to_string()))
            .unwrap_or(Value::Null),

        "TIMESTAMP" => row
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

        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> CourierError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let user = config.user.as_deref().unwrap_or("unknown");
    let error_str = error.to_string().to_lowercase();

    let message = if error_str.contains("connection refused") {
        format!("Cannot connect to {host}:{port}. Check that the server is running.")
    } else if error_str.contains("access denied") {
        format!("Authentication failed for user '{user}'. Check your credentials.")
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        format!("Connection to {host}:{port} timed out.")
    } else {
        error.to_string()
    };

    CourierError::connection(DatabaseBackend::Mysql.as_str(), message)
}
