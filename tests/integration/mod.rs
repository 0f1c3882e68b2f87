//! Integration tests for db-courier.

pub mod connection_test;
pub mod executor_test;
pub mod query_test;
