//! Mock database client for testing.
//!
//! Records every round trip so tests can assert on backend traffic without
//! a live server.

use super::{ColumnInfo, DatabaseBackend, DatabaseClient, QueryResult, Value};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared counters for a mock client, cloneable so a test can keep a handle
/// after the client has been moved into a tunnel session.
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    queries: Arc<AtomicUsize>,
    statements: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    executed: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
}

impl MockStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `execute_query` calls.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `execute_statement`/`execute_with_params` calls.
    pub fn statements(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }

    /// Total backend round trips.
    pub fn round_trips(&self) -> usize {
        self.queries() + self.statements()
    }

    /// Number of `close` calls.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// SQL text and parameters of every statement, in order.
    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.executed
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn record(&self, sql: &str, params: &[Value]) {
        if let Ok(mut guard) = self.executed.lock() {
            guard.push((sql.to_string(), params.to_vec()));
        }
    }
}

/// A mock database client that returns predefined results.
pub struct MockDatabaseClient {
    backend: DatabaseBackend,
    result: QueryResult,
    fail_with: Option<String>,
    fail_statement_at: Option<usize>,
    column_types: HashMap<String, String>,
    stats: MockStats,
}

impl MockDatabaseClient {
    /// Creates a mock that answers every query with a single-row result.
    pub fn new() -> Self {
        Self {
            backend: DatabaseBackend::Postgres,
            result: QueryResult::with_data(
                vec![ColumnInfo::new("result", "TEXT")],
                vec![vec![Value::String("mock".to_string())]],
            ),
            fail_with: None,
            fail_statement_at: None,
            column_types: HashMap::new(),
            stats: MockStats::new(),
        }
    }

    /// Answers every query with `result`.
    pub fn with_result(mut self, result: QueryResult) -> Self {
        self.result = result;
        self
    }

    /// Fails every query and statement with a backend error.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    /// Fails the `n`-th statement (0-based) and accepts the others.
    pub fn failing_statement_at(mut self, n: usize) -> Self {
        self.fail_statement_at = Some(n);
        self
    }

    /// Reports these column types for every table.
    pub fn with_column_types<I, K, V>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.column_types = types
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn with_backend(mut self, backend: DatabaseBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Shares counters with an existing handle.
    pub fn with_stats(mut self, stats: MockStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> MockStats {
        self.stats.clone()
    }

    fn run_statement(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let n = self.stats.statements.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(CourierError::query(message.clone()));
        }
        if self.fail_statement_at == Some(n) {
            return Err(CourierError::query(format!("mock failure on statement {n}")));
        }
        self.stats.record(sql, params);
        Ok(1)
    }
}

impl Default for MockDatabaseClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        self.stats.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(CourierError::query(message.clone()));
        }
        self.stats.record(sql, &[]);
        Ok(self
            .result
            .clone()
            .with_execution_time(Duration::from_millis(1)))
    }

    async fn execute_statement(&self, sql: &str) -> Result<u64> {
        self.run_statement(sql, &[])
    }

    async fn execute_with_params(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.run_statement(sql, params)
    }

    async fn column_types(&self, _table: &str) -> Result<HashMap<String, String>> {
        Ok(self.column_types.clone())
    }

    async fn close(&self) -> Result<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
