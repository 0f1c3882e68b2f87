//! Request execution for db-courier.
//!
//! The executor orchestrates classification, credentials, tunnels and the
//! cache; the inserter turns datasets into INSERT statements.

pub mod executor;
pub mod insert;

pub use executor::{
    Completion, ExecuteRequest, ExecutionOutcome, ExecutionState, RemoteExecutor,
};
pub use insert::DataInserter;
