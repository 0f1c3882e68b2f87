//! db-courier - remote SQL execution with tunnels, caching and bulk inserts.
//!
//! This library exposes the engine modules to the `courier` binary and to
//! integration tests.

pub mod cache;
pub mod classify;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod query;
pub mod tunnel;
