//! Database layer for Stockroom

mod connection;
mod local_store;
mod migrations;

pub use connection::{Database, DatabaseLocation};
pub use local_store::{LibSqlLocalStore, LocalStore, Query};
