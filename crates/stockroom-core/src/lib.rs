//! stockroom-core - Core library for Stockroom
//!
//! This crate contains the record models, the local and remote stores, and the
//! offline-first sync engine used by every Stockroom interface.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod identity;
pub mod models;
pub mod remote;
pub mod state;
pub mod sync;
pub mod util;

pub use config::{RetryPolicy, SyncSettings};
pub use engine::{SyncContext, SyncEngine, SyncStatusReport};
pub use error::{Error, Result};
pub use identity::{IdentityProvider, StaticIdentity};
pub use models::{CurrentUser, OperationKind, Priority, Table};
pub use state::SyncState;
