//! Mock connector for testing.

use super::Connector;
use crate::config::ConnectionConfig;
use crate::db::{DatabaseClient, MockDatabaseClient, MockStats, QueryResult};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Hands out [`MockDatabaseClient`]s sharing one set of counters.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    opens: Arc<AtomicUsize>,
    configs: Arc<Mutex<Vec<ConnectionConfig>>>,
    stats: MockStats,
    result: Option<QueryResult>,
    fail_connect: Option<String>,
    fail_query: Option<String>,
    fail_statement_at: Option<usize>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every client answers queries with `result`.
    pub fn with_result(mut self, result: QueryResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_stats(mut self, stats: MockStats) -> Self {
        self.stats = stats;
        self
    }

    /// Every connect attempt fails with a connection error.
    pub fn failing_connect(mut self, message: impl Into<String>) -> Self {
        self.fail_connect = Some(message.into());
        self
    }

    /// Every client fails its queries and statements.
    pub fn failing_queries(mut self, message: impl Into<String>) -> Self {
        self.fail_query = Some(message.into());
        self
    }

    /// Every client fails its `n`-th statement (0-based, counted across clients).
    pub fn failing_statement_at(mut self, n: usize) -> Self {
        self.fail_statement_at = Some(n);
        self
    }

    /// Number of connect attempts.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> MockStats {
        self.stats.clone()
    }

    /// The configuration of the most recent connect attempt.
    pub fn last_config(&self) -> Option<ConnectionConfig> {
        self.configs
            .lock()
            .ok()
            .and_then(|configs| configs.last().cloned())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DatabaseClient>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut configs) = self.configs.lock() {
            configs.push(config.clone());
        }
        if let Some(message) = &self.fail_connect {
            return Err(CourierError::connection("mock", message.clone()));
        }

        let mut client = MockDatabaseClient::new()
            .with_backend(config.backend)
            .with_stats(self.stats.clone());
        if let Some(result) = &self.result {
            client = client.with_result(result.clone());
        }
        if let Some(message) = &self.fail_query {
            client = client.failing(message.clone());
        }
        if let Some(n) = self.fail_statement_at {
            client = client.failing_statement_at(n);
        }
        Ok(Box::new(client))
    }
}
