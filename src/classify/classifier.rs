//! Keyword-based operation classification and table resolution.
//!
//! Precedence, first match wins: an explicit query type, then a dataset
//! payload (insert), then the `UNLOAD`/`COPY`/`UPDATE` keywords in the SQL
//! text, then `SELECT` for any other non-empty text.

use super::{Classification, OperationKind, Payload};
use crate::error::{CourierError, Result};
use tracing::debug;

/// Keywords checked in the SQL text, in order.
const KEYWORD_KINDS: [(&str, OperationKind); 3] = [
    ("UNLOAD ", OperationKind::Unload),
    ("COPY ", OperationKind::Copy),
    ("UPDATE ", OperationKind::Update),
];

/// Classifier for requests handed to the execution engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryClassifier;

impl QueryClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classifies a request into exactly one operation kind and resolves its table.
    ///
    /// `query_type` and `table` may be empty.
    pub fn classify(
        &self,
        query_type: &str,
        payload: &Payload,
        table: &str,
    ) -> Result<Classification> {
        let kind = self.operation_kind(query_type, payload)?;
        let table = resolve_table(kind, payload, table.trim())?;
        debug!("Classified request as {kind} (table: {table:?})");
        Ok(Classification::new(kind, table))
    }

    /// Determines the operation kind alone.
    pub fn operation_kind(&self, query_type: &str, payload: &Payload) -> Result<OperationKind> {
        if !query_type.trim().is_empty() {
            return query_type.parse();
        }

        match payload {
            Payload::Dataset(dataset) if !dataset.is_empty() => Ok(OperationKind::Insert),
            Payload::Dataset(_) => Err(CourierError::invalid_query(format!(
                "Dataset is empty and no query_type was given, allowed values are {}",
                OperationKind::allowed_list()
            ))),
            Payload::Sql(sql) => {
                if sql.trim().is_empty() {
                    return Err(CourierError::invalid_query(format!(
                        "Query is empty and no query_type was given, allowed values are {}",
                        OperationKind::allowed_list()
                    )));
                }
                // Raw text: the keyword must be followed by a literal space.
                let text = sql.to_uppercase();
                Ok(KEYWORD_KINDS
                    .iter()
                    .find(|(keyword, _)| text.contains(keyword))
                    .map(|(_, kind)| *kind)
                    .unwrap_or(OperationKind::Select))
            }
        }
    }
}

/// Convenience function to classify without creating a classifier instance.
pub fn classify(query_type: &str, payload: &Payload, table: &str) -> Result<Classification> {
    QueryClassifier::new().classify(query_type, payload, table)
}

/// Resolves and checks the target table for a classified request.
fn resolve_table(kind: OperationKind, payload: &Payload, table: &str) -> Result<Option<String>> {
    let declared = (!table.is_empty()).then(|| table.to_string());

    let sql = match payload {
        Payload::Sql(sql) => sql,
        Payload::Dataset(_) => {
            if kind == OperationKind::Insert && declared.is_none() {
                return Err(CourierError::invalid_query(
                    "A target table is required to insert a dataset",
                ));
            }
            return Ok(declared);
        }
    };

    match (kind, declared) {
        (OperationKind::Select, None) => Ok(extract_from_table(sql)),
        (_, None) => Ok(None),
        (_, Some(table)) => {
            if mentions_table(sql, &table) {
                Ok(Some(table))
            } else {
                Err(CourierError::table_mismatch(
                    table,
                    "does not appear in the SQL statement",
                ))
            }
        }
    }
}

/// Collapses whitespace runs to single spaces and upper-cases ASCII letters.
fn normalize_upper(sql: &str) -> String {
    normalize(sql).to_ascii_uppercase()
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-insensitive check that `table` appears in the SQL text.
fn mentions_table(sql: &str, table: &str) -> bool {
    normalize_upper(sql).contains(&normalize_upper(table))
}

/// Takes the identifier after the first `FROM` token.
///
/// Best effort: subqueries and quoted identifiers containing `FROM` can
/// yield the wrong name.
fn extract_from_table(sql: &str) -> Option<String> {
    let text = normalize(sql);
    // ASCII upper-casing keeps byte offsets aligned with `text`.
    let upper = text.to_ascii_uppercase();
    let start = upper.find("FROM ")? + "FROM ".len();
    text[start..]
        .split(' ')
        .next()
        .map(|token| token.trim_end_matches([';', ')', ',']))
        .filter(|token| !token.is_empty())
        .map(String::from)
}
