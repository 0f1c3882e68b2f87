//! Row-by-row dataset insertion.
//!
//! Each row becomes one parameterized `INSERT`. Rows are committed as they
//! go: a failure leaves earlier rows in place.

use crate::db::{DatabaseBackend, DatabaseClient, Dataset, Value};
use crate::error::{CourierError, Result};
use sqlparser::ast::{Ident, ObjectName};
use std::collections::HashMap;
use tracing::{debug, info};

/// Inserts [`Dataset`]s into a table.
#[derive(Debug, Clone, Copy)]
pub struct DataInserter {
    autofill_nulls: bool,
}

impl Default for DataInserter {
    fn default() -> Self {
        Self {
            autofill_nulls: true,
        }
    }
}

impl DataInserter {
    /// `autofill_nulls` writes null and NaN cells as `NULL`; when off such
    /// a cell fails the call.
    pub fn new(autofill_nulls: bool) -> Self {
        Self { autofill_nulls }
    }

    /// Inserts every row of `dataset` into `table` and returns the number of
    /// rows written.
    pub async fn insert(
        &self,
        dataset: &Dataset,
        table: &str,
        client: &dyn DatabaseClient,
    ) -> Result<u64> {
        let backend = client.backend();
        let target = table_name(table, backend)?;
        let mut inserted = 0u64;
        let mut types: Option<HashMap<String, String>> = None;

        for index in 0..dataset.len() {
            // Postgres types bound strings as TEXT, which does not convert
            // implicitly to dates, numerics and the like.
            let has_text = dataset.rows()[index]
                .values()
                .any(|v| matches!(v, Value::String(_)));
            if types.is_none() && has_text && backend == DatabaseBackend::Postgres {
                types = Some(client.column_types(&target.to_string()).await?);
            }
            let (sql, params) =
                self.row_statement(dataset, index, &target, backend, types.as_ref())?;
            inserted += client.execute_with_params(&sql, &params).await?;
        }

        info!("Inserted {inserted} rows into {target}");
        Ok(inserted)
    }

    /// Builds the statement and bound values for row `index`.
    fn row_statement(
        &self,
        dataset: &Dataset,
        index: usize,
        target: &ObjectName,
        backend: DatabaseBackend,
        types: Option<&HashMap<String, String>>,
    ) -> Result<(String, Vec<Value>)> {
        let row = &dataset.rows()[index];
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut params = Vec::new();

        for name in dataset.columns() {
            let Some(value) = row.get(name) else {
                continue;
            };
            if value.is_missing() {
                if !self.autofill_nulls {
                    return Err(CourierError::data_integrity(index, name.as_str()));
                }
                values.push("NULL".to_string());
            } else {
                params.push(value.clone());
                let placeholder = backend.placeholder(params.len());
                let cast = match value {
                    Value::String(_) => types.and_then(|t| cast_type(t, name)),
                    _ => None,
                };
                values.push(match cast {
                    Some(ty) => format!("{placeholder}::{ty}"),
                    None => placeholder,
                });
            }
            columns.push(identifier(name, backend).to_string());
        }

        let sql = if columns.is_empty() {
            match backend {
                DatabaseBackend::Postgres => format!("INSERT INTO {target} DEFAULT VALUES"),
                DatabaseBackend::Mysql => format!("INSERT INTO {target} () VALUES ()"),
            }
        } else {
            format!(
                "INSERT INTO {target} ({}) VALUES ({})",
                columns.join(", "),
                values.join(", ")
            )
        };
        debug!("Row {index}: {sql}");
        Ok((sql, params))
    }
}

/// Renders an identifier, quoting it only when it is not a plain name so
/// unquoted case folding still applies.
fn identifier(name: &str, backend: DatabaseBackend) -> Ident {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        Ident::new(name)
    } else {
        let quote = match backend {
            DatabaseBackend::Postgres => '"',
            DatabaseBackend::Mysql => '`',
        };
        Ident::with_quote(quote, name)
    }
}

/// Target type to cast a bound string to, if it is not already textual.
///
/// Plain column names fold to lower case on the server.
fn cast_type<'a>(types: &'a HashMap<String, String>, column: &str) -> Option<&'a str> {
    let ty = types
        .get(column)
        .or_else(|| types.get(&column.to_lowercase()))?;
    let textual = ["text", "character", "varchar", "char", "name", "unknown"]
        .iter()
        .any(|prefix| ty.starts_with(prefix));
    (!textual).then_some(ty.as_str())
}

/// Splits `schema.table` into its parts.
fn table_name(table: &str, backend: DatabaseBackend) -> Result<ObjectName> {
    let parts: Vec<&str> = table.trim().split('.').collect();
    if parts.iter().any(|part| part.trim().is_empty()) {
        return Err(CourierError::invalid_query(format!(
            "Invalid table name '{table}'"
        )));
    }
    Ok(ObjectName(
        parts
            .into_iter()
            .map(|part| identifier(part.trim(), backend))
            .collect(),
    ))
}
