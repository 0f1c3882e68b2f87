//! Command-line argument parsing for courier.

use crate::config::{CredentialSource, Settings};
use crate::db::{Dataset, Engine, QueryResult, Value};
use crate::error::{CourierError, Result};
use crate::query::{ExecuteRequest, ExecutionOutcome};
use crate::tunnel::ConnectionMode;
use clap::Parser;
use std::path::PathBuf;

/// How results are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Tab-separated rows with a header line.
    #[default]
    Text,
    /// A JSON document with columns, rows and cache provenance.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid output format: {s}. Expected: text or json")),
        }
    }
}

/// Run SQL against a remote database over a direct, IAM or SSH connection.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// SQL text, or a path to a .sql file
    #[arg(value_name = "QUERY")]
    pub query: Option<String>,

    /// Operation kind (SELECT, INSERT, DELETE, COPY, UNLOAD, UPDATE, CREATE, GRANT)
    #[arg(short = 't', long = "type", value_name = "KIND", default_value = "")]
    pub query_type: String,

    /// Target table
    #[arg(long, value_name = "TABLE", default_value = "")]
    pub table: String,

    /// JSON file with an array of row objects to insert
    #[arg(short = 'd', long, value_name = "PATH")]
    pub data: Option<PathBuf>,

    /// Credential record: a name in the credentials directory or a file path
    #[arg(short = 'c', long, value_name = "NAME|PATH", env = "COURIER_CREDENTIALS")]
    pub credentials: Option<String>,

    /// Connection mode: direct, iam or ssh
    #[arg(long, value_name = "MODE", default_value = "direct")]
    pub connection: ConnectionMode,

    /// Database engine: default, mysql, postgres or redshift
    #[arg(short = 'e', long, value_name = "ENGINE", default_value = "default")]
    pub engine: Engine,

    /// Fail on null cells instead of inserting NULL
    #[arg(long)]
    pub no_autofill: bool,

    /// Cache SELECT results for this long (e.g. "2 hours")
    #[arg(long, value_name = "TTL")]
    pub cache: Option<String>,

    /// File name for the cache entry instead of the query fingerprint
    #[arg(long, value_name = "NAME")]
    pub cache_name: Option<String>,

    /// Ignore and overwrite any cached result
    #[arg(long)]
    pub refresh: bool,

    /// Delete every cached result and exit
    #[arg(long)]
    pub clear_cache: bool,

    /// Output format: text or json
    #[arg(short = 'o', long, value_name = "FORMAT", default_value = "text")]
    pub output: String,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log progress to stderr
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Settings::default_path)
    }

    /// Parses the output format from the --output argument.
    pub fn parse_output_format(&self) -> Result<OutputFormat> {
        self.output.parse().map_err(CourierError::config)
    }

    /// Builds the request described by the arguments.
    pub fn to_request(&self) -> Result<ExecuteRequest> {
        let request = match (&self.query, &self.data) {
            (Some(_), Some(_)) => {
                return Err(CourierError::config("Pass either QUERY or --data, not both"))
            }
            (Some(query), None) => ExecuteRequest::sql(query.clone()),
            (None, Some(path)) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    CourierError::config(format!("Failed to read {}: {e}", path.display()))
                })?;
                ExecuteRequest::dataset(Dataset::from_json(&text)?)
            }
            (None, None) => return Err(CourierError::config("No QUERY or --data given")),
        };

        let mut request = request
            .with_query_type(self.query_type.clone())
            .with_table(self.table.clone())
            .with_credentials(CredentialSource::parse(
                self.credentials.as_deref().unwrap_or_default(),
            ))
            .with_mode(self.connection)
            .with_engine(self.engine)
            .with_autofill_nulls(!self.no_autofill)
            .with_refresh(self.refresh);
        if let Some(ttl) = &self.cache {
            request = request.with_cache(ttl.clone());
        }
        if let Some(name) = &self.cache_name {
            request = request.with_cache_name(name.clone());
        }
        Ok(request)
    }
}

/// Renders an outcome for stdout.
pub fn render_outcome(outcome: &ExecutionOutcome, format: OutputFormat) -> Result<String> {
    match (outcome, format) {
        (ExecutionOutcome::Rows(result), OutputFormat::Text) => Ok(render_text(result)),
        (ExecutionOutcome::Rows(result), OutputFormat::Json) => render_json(result),
        (ExecutionOutcome::Inserted(n), OutputFormat::Text) => Ok(format!("{n} rows inserted")),
        (ExecutionOutcome::Executed(n), OutputFormat::Text) => Ok(format!("{n} rows affected")),
        (ExecutionOutcome::Inserted(n), OutputFormat::Json) => {
            Ok(serde_json::json!({ "inserted": n }).to_string())
        }
        (ExecutionOutcome::Executed(n), OutputFormat::Json) => {
            Ok(serde_json::json!({ "affected": n }).to_string())
        }
    }
}

fn render_text(result: &QueryResult) -> String {
    let mut lines = Vec::with_capacity(result.rows.len() + 1);
    lines.push(
        result
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join("\t"),
    );
    for row in &result.rows {
        lines.push(
            row.iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join("\t"),
        );
    }
    lines.join("\n")
}

fn render_json(result: &QueryResult) -> Result<String> {
    let rows: Vec<serde_json::Value> = result
        .rows
        .iter()
        .map(|row| {
            let object: serde_json::Map<String, serde_json::Value> = result
                .columns
                .iter()
                .zip(row)
                .map(|(col, value)| (col.name.clone(), value.to_json()))
                .collect();
            serde_json::Value::Object(object)
        })
        .collect();

    let document = serde_json::json!({
        "columns": result.columns,
        "rows": rows,
        "row_count": result.row_count,
        "cache": result.cache,
    });
    serde_json::to_string_pretty(&document)
        .map_err(|e| CourierError::internal(format!("Failed to render JSON: {e}")))
}
