//! Remote execution of a single request.
//!
//! `execute` classifies the request, resolves credentials, opens a tunnel
//! session and dispatches on the operation kind. The session is released on
//! every path once it has been opened.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{parse_ttl, CacheStore};
use crate::classify::{Classification, OperationKind, Payload, QueryClassifier};
use crate::config::{ConfigResolver, CredentialSource, Settings};
use crate::db::{DatabaseClient, Dataset, Engine, QueryResult};
use crate::error::{CourierError, Result};
use crate::query::insert::DataInserter;
use crate::tunnel::{ConnectionMode, TunnelManager};
use tracing::{debug, info};

/// How a call ended once its tunnel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure,
}

/// States a call passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Classifying,
    ResolvingCredentials,
    TunnelOpen,
    Executing,
    TunnelClosed(Completion),
    /// Terminal failure before any tunnel was opened.
    Failed,
}

/// A single call to the engine.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub payload: Payload,
    pub query_type: String,
    pub table: String,
    pub credentials: CredentialSource,
    pub mode: ConnectionMode,
    pub autofill_nulls: bool,
    pub engine: Engine,
    /// Cache TTL such as `"2 hours"`; caching is off when unset.
    pub cache: Option<String>,
    pub cache_name: Option<String>,
    /// Drop any cached entry before running.
    pub refresh: bool,
}

impl ExecuteRequest {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            query_type: String::new(),
            table: String::new(),
            credentials: CredentialSource::Default,
            mode: ConnectionMode::Direct,
            autofill_nulls: true,
            engine: Engine::Default,
            cache: None,
            cache_name: None,
            refresh: false,
        }
    }

    /// A request running SQL text, or the contents of a `.sql` file.
    pub fn sql(sql: impl Into<String>) -> Self {
        Self::new(Payload::Sql(sql.into()))
    }

    /// A request inserting `dataset`.
    pub fn dataset(dataset: Dataset) -> Self {
        Self::new(Payload::Dataset(dataset))
    }

    pub fn with_query_type(mut self, query_type: impl Into<String>) -> Self {
        self.query_type = query_type.into();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_credentials(mut self, source: CredentialSource) -> Self {
        self.credentials = source;
        self
    }

    pub fn with_mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_autofill_nulls(mut self, enabled: bool) -> Self {
        self.autofill_nulls = enabled;
        self
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_cache(mut self, ttl: impl Into<String>) -> Self {
        self.cache = Some(ttl.into());
        self
    }

    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = Some(name.into());
        self
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }
}

/// What a successful call produced.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Rows returned by a SELECT, possibly from cache.
    Rows(QueryResult),
    /// Rows written by a dataset insert.
    Inserted(u64),
    /// Rows affected by a passthrough statement.
    Executed(u64),
}

impl ExecutionOutcome {
    pub fn rows(&self) -> Option<&QueryResult> {
        match self {
            Self::Rows(result) => Some(result),
            _ => None,
        }
    }

    /// Returned rows for a SELECT, written or affected rows otherwise.
    pub fn row_count(&self) -> u64 {
        match self {
            Self::Rows(result) => result.row_count as u64,
            Self::Inserted(n) | Self::Executed(n) => *n,
        }
    }
}

/// The work to do once a session is open.
enum Plan {
    Select {
        sql: String,
        cache: Option<(Duration, Option<String>)>,
    },
    Insert {
        dataset: Dataset,
        table: String,
    },
    Statement {
        sql: String,
    },
}

/// Runs requests against remote databases.
pub struct RemoteExecutor {
    resolver: ConfigResolver,
    tunnels: TunnelManager,
    cache: CacheStore,
    classifier: QueryClassifier,
    last_trace: Mutex<Vec<ExecutionState>>,
}

impl RemoteExecutor {
    pub fn new(resolver: ConfigResolver, tunnels: TunnelManager, cache: CacheStore) -> Self {
        Self {
            resolver,
            tunnels,
            cache,
            classifier: QueryClassifier::new(),
            last_trace: Mutex::new(Vec::new()),
        }
    }

    /// Creates an executor wired to the real backends.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            ConfigResolver::from_settings(settings),
            TunnelManager::from_settings(settings),
            CacheStore::from_settings(settings),
        )
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// States observed by the most recently finished call.
    pub fn last_trace(&self) -> Vec<ExecutionState> {
        self.last_trace
            .lock()
            .map(|trace| trace.clone())
            .unwrap_or_default()
    }

    /// Executes one request.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionOutcome> {
        let (outcome, trace) = self.execute_traced(request).await;
        if let Ok(mut last) = self.last_trace.lock() {
            *last = trace;
        }
        outcome
    }

    /// Executes one request and returns the states it passed through.
    ///
    /// The trace belongs to this call alone.
    pub async fn execute_traced(
        &self,
        request: ExecuteRequest,
    ) -> (Result<ExecutionOutcome>, Vec<ExecutionState>) {
        let trace = CallTrace::default();
        let outcome = self.execute_inner(request, &trace).await;
        (outcome, trace.into_states())
    }

    async fn execute_inner(
        &self,
        request: ExecuteRequest,
        trace: &CallTrace,
    ) -> Result<ExecutionOutcome> {
        trace.enter(ExecutionState::Classifying);

        let prepared = self.prepare(&request).and_then(|plan| {
            trace.enter(ExecutionState::ResolvingCredentials);
            let credentials =
                self.resolver
                    .resolve(&request.credentials, request.mode, request.engine)?;
            Ok((plan, credentials))
        });
        let (plan, credentials) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                trace.enter(ExecutionState::Failed);
                return Err(e);
            }
        };

        if request.refresh {
            if let Plan::Select { sql, .. } = &plan {
                if let Err(e) = self.cache.invalidate(sql, request.cache_name.as_deref()) {
                    trace.enter(ExecutionState::Failed);
                    return Err(e);
                }
            }
        }

        let outcome = self
            .tunnels
            .with_session(&credentials, request.mode, request.engine, |client| {
                trace.enter(ExecutionState::TunnelOpen);
                self.run(plan, client, request.autofill_nulls, trace)
            })
            .await;

        match &outcome {
            Ok(result) => {
                trace.enter(ExecutionState::TunnelClosed(Completion::Success));
                info!("Request finished: {} rows", result.row_count());
            }
            Err(e) => {
                // Acquisition failures never reached TunnelOpen.
                trace.enter(if trace.contains(ExecutionState::TunnelOpen) {
                    ExecutionState::TunnelClosed(Completion::Failure)
                } else {
                    ExecutionState::Failed
                });
                debug!("Request failed: {e}");
            }
        }
        outcome
    }

    /// Loads the payload, classifies it and decides what to run. Fails
    /// without touching the network.
    fn prepare(&self, request: &ExecuteRequest) -> Result<Plan> {
        let payload = load_payload(&request.payload)?;
        let Classification { kind, table } =
            self.classifier
                .classify(&request.query_type, &payload, &request.table)?;

        let ttl = request.cache.as_deref().map(parse_ttl).transpose()?;

        let plan = match (kind, payload) {
            (OperationKind::Select, Payload::Sql(sql)) => Plan::Select {
                sql,
                cache: ttl.map(|ttl| (ttl, request.cache_name.clone())),
            },
            (OperationKind::Select, Payload::Dataset(_)) => {
                return Err(CourierError::unsupported(
                    "SELECT needs SQL text, not a dataset",
                ))
            }
            (OperationKind::Insert, Payload::Dataset(dataset)) => Plan::Insert {
                dataset,
                table: table.ok_or_else(|| {
                    CourierError::invalid_query("A target table is required to insert a dataset")
                })?,
            },
            (_, Payload::Sql(sql)) => Plan::Statement { sql },
            (kind, Payload::Dataset(_)) => {
                return Err(CourierError::unsupported(format!(
                    "{kind} cannot be run with a dataset payload"
                )))
            }
        };

        if ttl.is_some() && !matches!(plan, Plan::Select { .. }) {
            debug!("Ignoring cache TTL for {kind}");
        }
        Ok(plan)
    }

    async fn run(
        &self,
        plan: Plan,
        client: Arc<dyn DatabaseClient>,
        autofill_nulls: bool,
        trace: &CallTrace,
    ) -> Result<ExecutionOutcome> {
        trace.enter(ExecutionState::Executing);
        match plan {
            Plan::Select { sql, cache: None } => {
                Ok(ExecutionOutcome::Rows(client.execute_query(&sql).await?))
            }
            Plan::Select {
                sql,
                cache: Some((ttl, name)),
            } => {
                let result = self
                    .cache
                    .lookup_or_execute(&sql, client.as_ref(), ttl, name.as_deref())
                    .await?;
                Ok(ExecutionOutcome::Rows(result))
            }
            Plan::Insert { dataset, table } => {
                let inserted = DataInserter::new(autofill_nulls)
                    .insert(&dataset, &table, client.as_ref())
                    .await?;
                Ok(ExecutionOutcome::Inserted(inserted))
            }
            Plan::Statement { sql } => {
                Ok(ExecutionOutcome::Executed(client.execute_statement(&sql).await?))
            }
        }
    }

}

/// States observed by one call.
#[derive(Default)]
struct CallTrace(Mutex<Vec<ExecutionState>>);

impl CallTrace {
    fn enter(&self, state: ExecutionState) {
        debug!("Execution state: {state:?}");
        if let Ok(mut states) = self.0.lock() {
            states.push(state);
        }
    }

    fn contains(&self, state: ExecutionState) -> bool {
        self.0
            .lock()
            .map(|states| states.contains(&state))
            .unwrap_or(false)
    }

    fn into_states(self) -> Vec<ExecutionState> {
        self.0.into_inner().unwrap_or_default()
    }
}

/// Replaces a `.sql` path payload with the file's contents.
fn load_payload(payload: &Payload) -> Result<Payload> {
    let Payload::Sql(text) = payload else {
        return Ok(payload.clone());
    };
    let trimmed = text.trim();
    if !trimmed.to_lowercase().ends_with(".sql") {
        return Ok(payload.clone());
    }

    let path = Path::new(trimmed);
    let sql = std::fs::read_to_string(path).map_err(|e| {
        CourierError::invalid_query(format!("Failed to read {}: {e}", path.display()))
    })?;
    if sql.trim().is_empty() {
        return Err(CourierError::invalid_query(format!(
            "{} is empty",
            path.display()
        )));
    }
    debug!("Loaded query from {}", path.display());
    Ok(Payload::Sql(sql))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ColumnInfo, Value};
    use crate::tunnel::MockConnector;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn inline_credentials() -> CredentialSource {
        CredentialSource::Inline(HashMap::from([
            ("DB_USER".to_string(), "analyst".to_string()),
            ("DB_PASSWORD".to_string(), "pw".to_string()),
            ("DB_HOST".to_string(), "db.internal".to_string()),
        ]))
    }

    fn executor(connector: &MockConnector, cache_dir: &Path) -> RemoteExecutor {
        RemoteExecutor::new(
            ConfigResolver::new(cache_dir.join("credentials")),
            TunnelManager::new(Arc::new(connector.clone())),
            CacheStore::new(cache_dir.join("queries")),
        )
    }

    fn orders_result() -> QueryResult {
        QueryResult::with_data(
            vec![ColumnInfo::new("id", "INT4")],
            (1..=10).map(|i| vec![Value::Int(i)]).collect(),
        )
    }

    #[tokio::test]
    async fn test_select_runs_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new().with_result(orders_result());
        let executor = executor(&connector, dir.path());

        let outcome = executor
            .execute(ExecuteRequest::sql("SELECT * FROM ORDERS LIMIT 10").with_credentials(inline_credentials()))
            .await
            .unwrap();

        assert_eq!(outcome.row_count(), 10);
        assert_eq!(connector.opens(), 1);
        assert_eq!(connector.stats().closes(), 1);
        assert_eq!(
            executor.last_trace(),
            vec![
                ExecutionState::Classifying,
                ExecutionState::ResolvingCredentials,
                ExecutionState::TunnelOpen,
                ExecutionState::Executing,
                ExecutionState::TunnelClosed(Completion::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_backend_error_still_releases_once() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new().failing_queries("relation \"orders\" does not exist");
        let executor = executor(&connector, dir.path());

        let err = executor
            .execute(ExecuteRequest::sql("SELECT * FROM orders").with_credentials(inline_credentials()))
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::Query(_)));
        assert_eq!(connector.opens(), 1);
        assert_eq!(connector.stats().closes(), 1);
        assert_eq!(
            executor.last_trace().last(),
            Some(&ExecutionState::TunnelClosed(Completion::Failure))
        );
    }

    #[tokio::test]
    async fn test_cached_select_skips_backend_on_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new().with_result(orders_result());
        let executor = executor(&connector, dir.path());
        let request = ExecuteRequest::sql("SELECT * FROM ORDERS LIMIT 10")
            .with_credentials(inline_credentials())
            .with_cache("1 hour");

        let first = executor.execute(request.clone()).await.unwrap();
        assert_eq!(connector.stats().round_trips(), 1);
        assert_eq!(std::fs::read_dir(dir.path().join("queries")).unwrap().count(), 2);

        let second = executor.execute(request).await.unwrap();
        assert_eq!(connector.stats().round_trips(), 1);
        assert_eq!(second.row_count(), first.row_count());
        assert!(second.rows().unwrap().cache.as_ref().unwrap().hit);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let executor = executor(&connector, dir.path());
        let request = ExecuteRequest::sql("SELECT 1")
            .with_credentials(inline_credentials())
            .with_cache("1 hour");

        executor.execute(request.clone()).await.unwrap();
        executor.execute(request.with_refresh(true)).await.unwrap();

        assert_eq!(connector.stats().round_trips(), 2);
    }

    #[tokio::test]
    async fn test_insert_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let executor = executor(&connector, dir.path());
        let mut dataset = Dataset::new(["id", "total"]);
        for id in 1..=3 {
            dataset.push_row([("id", Value::Int(id)), ("total", Value::Float(1.5))]);
        }

        let outcome = executor
            .execute(
                ExecuteRequest::dataset(dataset)
                    .with_query_type("INSERT")
                    .with_table("ORDERS")
                    .with_credentials(inline_credentials()),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Inserted(3)));
        assert_eq!(connector.stats().closes(), 1);
    }

    #[tokio::test]
    async fn test_passthrough_statement() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let executor = executor(&connector, dir.path());

        let outcome = executor
            .execute(
                ExecuteRequest::sql("DELETE FROM ORDERS WHERE id=1")
                    .with_query_type("DELETE")
                    .with_table("ORDERS")
                    .with_credentials(inline_credentials()),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Executed(1)));
        assert_eq!(
            connector.stats().executed()[0].0,
            "DELETE FROM ORDERS WHERE id=1"
        );
    }

    #[tokio::test]
    async fn test_table_mismatch_never_opens_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let executor = executor(&connector, dir.path());

        let err = executor
            .execute(
                ExecuteRequest::sql("DELETE FROM ORDERS WHERE id=1")
                    .with_table("CUSTOMERS")
                    .with_credentials(inline_credentials()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::TableMismatch { .. }));
        assert_eq!(connector.opens(), 0);
        assert_eq!(
            executor.last_trace(),
            vec![ExecutionState::Classifying, ExecutionState::Failed]
        );
    }

    #[tokio::test]
    async fn test_bad_ttl_fails_before_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let executor = executor(&connector, dir.path());

        // The default credential file does not exist; the TTL error wins.
        let err = executor
            .execute(ExecuteRequest::sql("SELECT 1").with_cache("soon"))
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::Configuration(_)));
        assert!(err.to_string().contains("soon"));
        assert_eq!(connector.opens(), 0);
    }

    #[tokio::test]
    async fn test_select_with_dataset_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let executor = executor(&connector, dir.path());
        let dataset = Dataset::new(["id"]).with_row([("id", Value::Int(1))]);

        let err = executor
            .execute(
                ExecuteRequest::dataset(dataset)
                    .with_query_type("SELECT")
                    .with_credentials(inline_credentials()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::UnsupportedOperation(_)));
        assert_eq!(connector.opens(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_failed_state() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new().failing_connect("Cannot connect to db.internal:5432");
        let executor = executor(&connector, dir.path());

        let err = executor
            .execute(ExecuteRequest::sql("SELECT 1").with_credentials(inline_credentials()))
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::Connection { .. }));
        assert_eq!(
            executor.last_trace().last(),
            Some(&ExecutionState::Failed)
        );
    }

    #[tokio::test]
    async fn test_sql_file_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.sql");
        std::fs::write(&path, "SELECT *\nFROM orders\n").unwrap();
        let connector = MockConnector::new();
        let executor = executor(&connector, dir.path());

        executor
            .execute(
                ExecuteRequest::sql(path.to_string_lossy())
                    .with_credentials(inline_credentials()),
            )
            .await
            .unwrap();

        assert_eq!(
            connector.stats().executed()[0].0,
            "SELECT *\nFROM orders\n"
        );
    }

    #[tokio::test]
    async fn test_concurrent_calls_keep_separate_traces() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MockConnector::new().with_result(orders_result());
        let executor = executor(&connector, dir.path());

        let ok = executor.execute_traced(
            ExecuteRequest::sql("SELECT * FROM orders").with_credentials(inline_credentials()),
        );
        let mismatch = executor.execute_traced(
            ExecuteRequest::sql("DELETE FROM orders")
                .with_query_type("DELETE")
                .with_table("customers")
                .with_credentials(inline_credentials()),
        );
        let ((ok, ok_trace), (mismatch, mismatch_trace)) = tokio::join!(ok, mismatch);

        assert!(ok.is_ok());
        assert!(mismatch.is_err());
        assert_eq!(
            ok_trace,
            vec![
                ExecutionState::Classifying,
                ExecutionState::ResolvingCredentials,
                ExecutionState::TunnelOpen,
                ExecutionState::Executing,
                ExecutionState::TunnelClosed(Completion::Success),
            ]
        );
        assert_eq!(
            mismatch_trace,
            vec![ExecutionState::Classifying, ExecutionState::Failed]
        );
    }

    #[test]
    fn test_empty_sql_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sql");
        std::fs::write(&path, "  \n").unwrap();

        let err = load_payload(&Payload::Sql(path.to_string_lossy().into_owned())).unwrap_err();
        assert!(matches!(err, CourierError::InvalidQuery(_)));
    }
}
