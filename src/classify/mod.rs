//! Operation classification module.
//!
//! Decides which kind of operation a request performs (read, bulk insert,
//! or a write statement) and which table it targets, before any network
//! resource is acquired.

mod classifier;

pub use classifier::{classify, QueryClassifier};

use crate::db::Dataset;
use crate::error::{CourierError, Result};
use std::fmt;
use std::str::FromStr;

/// The closed set of operations the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Select,
    Insert,
    Delete,
    Copy,
    Unload,
    Update,
    Create,
    Grant,
}

impl OperationKind {
    /// Every kind, in the order used in error messages.
    pub const ALL: [OperationKind; 8] = [
        Self::Select,
        Self::Insert,
        Self::Delete,
        Self::Copy,
        Self::Unload,
        Self::Update,
        Self::Create,
        Self::Grant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Delete => "DELETE",
            Self::Copy => "COPY",
            Self::Unload => "UNLOAD",
            Self::Update => "UPDATE",
            Self::Create => "CREATE",
            Self::Grant => "GRANT",
        }
    }

    /// Comma-separated list of all kinds, for error messages.
    pub fn allowed_list() -> String {
        Self::ALL
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                CourierError::invalid_query(format!(
                    "Your query_type value is not correct, allowed values are {}. Got '{}'",
                    Self::allowed_list(),
                    s
                ))
            })
    }
}

/// What the caller hands to the engine: SQL text or rows to insert.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Sql(String),
    Dataset(Dataset),
}

impl Payload {
    pub fn as_sql(&self) -> Option<&str> {
        match self {
            Self::Sql(sql) => Some(sql),
            Self::Dataset(_) => None,
        }
    }

    pub fn is_dataset(&self) -> bool {
        matches!(self, Self::Dataset(_))
    }
}

impl From<&str> for Payload {
    fn from(sql: &str) -> Self {
        Self::Sql(sql.to_string())
    }
}

impl From<String> for Payload {
    fn from(sql: String) -> Self {
        Self::Sql(sql)
    }
}

impl From<Dataset> for Payload {
    fn from(dataset: Dataset) -> Self {
        Self::Dataset(dataset)
    }
}

/// Result of classifying a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The single operation kind for this call.
    pub kind: OperationKind,
    /// Target table, when declared or extracted.
    pub table: Option<String>,
}

impl Classification {
    pub fn new(kind: OperationKind, table: Option<String>) -> Self {
        Self { kind, table }
    }
}
