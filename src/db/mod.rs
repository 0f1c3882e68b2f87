//! Database abstraction layer for db-courier.
//!
//! Provides a trait-based interface for database operations, allowing
//! different database backends to be used interchangeably.

mod mock;
mod mysql;
mod postgres;
mod types;

pub use mock::{MockDatabaseClient, MockStats};
pub use mysql::MySqlClient;
pub use postgres::PostgresClient;
pub use types::{ColumnInfo, DataRow, Dataset, QueryResult, Row, Value};

use crate::config::ConnectionConfig;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Wire protocols spoken by the supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Postgres,
    Mysql,
}

impl DatabaseBackend {
    /// Returns the backend as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Returns the URL scheme for this backend.
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Bind placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::Mysql => "?".to_string(),
        }
    }
}

/// Database engine requested by the caller.
///
/// `Default` is resolved against the credentials: a cluster name means
/// Redshift, port 3306 means MySQL, anything else is Postgres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Default,
    Mysql,
    Postgres,
    Redshift,
}

impl Engine {
    /// Resolves `Default` to a concrete engine.
    pub fn resolve(self, cluster_name: Option<&str>, port: Option<u16>) -> Engine {
        match self {
            Engine::Default => {
                if cluster_name.is_some_and(|c| !c.is_empty()) {
                    Engine::Redshift
                } else if port == Some(3306) {
                    Engine::Mysql
                } else {
                    Engine::Postgres
                }
            }
            other => other,
        }
    }

    /// Returns the wire protocol used to talk to this engine.
    pub fn backend(&self) -> DatabaseBackend {
        match self {
            Engine::Mysql => DatabaseBackend::Mysql,
            Engine::Default | Engine::Postgres | Engine::Redshift => DatabaseBackend::Postgres,
        }
    }

    /// Returns the default port for this engine.
    pub fn default_port(&self) -> u16 {
        match self {
            Engine::Mysql => 3306,
            Engine::Redshift => 5439,
            Engine::Default | Engine::Postgres => 5432,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Default => "default",
            Engine::Mysql => "mysql",
            Engine::Postgres => "postgres",
            Engine::Redshift => "redshift",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "default" => Ok(Self::Default),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redshift" => Ok(Self::Redshift),
            other => Err(CourierError::config(format!(
                "Unknown engine '{other}'. Expected default, mysql, postgres or redshift"
            ))),
        }
    }
}

/// Creates a database client for the given configuration.
///
/// This is the central factory function for database connections.
pub async fn connect(config: &ConnectionConfig) -> Result<Box<dyn DatabaseClient>> {
    match config.backend {
        DatabaseBackend::Postgres => {
            let client = PostgresClient::connect(config).await?;
            Ok(Box::new(client))
        }
        DatabaseBackend::Mysql => {
            let client = MySqlClient::connect(config).await?;
            Ok(Box::new(client))
        }
    }
}

/// Trait defining the interface for database clients.
///
/// All database operations are async and return Results with CourierError.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// The wire protocol of this client, used to pick placeholder syntax.
    fn backend(&self) -> DatabaseBackend;

    /// Executes a SQL query and returns the results.
    async fn execute_query(&self, sql: &str) -> Result<QueryResult>;

    /// Executes a statement that returns no rows and commits it.
    /// Returns the number of affected rows.
    async fn execute_statement(&self, sql: &str) -> Result<u64>;

    /// Executes a parameterized statement with positional parameters.
    async fn execute_with_params(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Declared column types of `table`, keyed by column name. Backends that
    /// coerce bound text on their own return an empty map.
    async fn column_types(&self, _table: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    /// Closes the database connection.
    async fn close(&self) -> Result<()>;
}
