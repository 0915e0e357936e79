//! Remote document store adapters
//!
//! The engine talks to the shared multi-tenant store only through [`RemoteStore`].
//! Two implementations ship with the crate: [`InMemoryRemoteStore`] for tests and
//! single-process demos, and [`LibSqlRemoteStore`] which keeps the shared documents
//! in a libSQL database (a local file or a hosted server).

mod libsql_store;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::Query;
use crate::models::{Document, DocumentChange, RemoteDocument, RemoteUpdate, Table};

pub use libsql_store::LibSqlRemoteStore;
pub use memory::InMemoryRemoteStore;

/// Result type for remote store calls
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Failures reported by a remote store adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network down or server unreachable
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Remote call timed out: {0}")]
    Timeout(String),

    #[error("Remote document not found: {0}")]
    NotFound(String),

    /// The document was already written (e.g., by an earlier attempt)
    #[error("Remote document already exists: {remote_id}")]
    AlreadyExists { remote_id: String },

    /// The server refused the request (permissions, validation)
    #[error("Remote store rejected the request: {0}")]
    Rejected(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),
}

impl RemoteError {
    /// Whether retrying the same call later could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Event delivered on a change-stream subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Batch(Vec<DocumentChange>),
    /// The subscription failed and will deliver nothing further
    Error(RemoteError),
}

/// Live subscription to one collection.
///
/// The first batch carries every document currently matching the owner filter as
/// `added`. Dropping the stream unsubscribes.
pub struct ChangeStream {
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    task: Option<JoinHandle<()>>,
}

impl ChangeStream {
    pub const fn new(receiver: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self {
            receiver,
            task: None,
        }
    }

    /// Stream fed by a background task that is aborted when the stream is dropped
    pub const fn with_task(
        receiver: mpsc::UnboundedReceiver<ChangeEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            receiver,
            task: Some(task),
        }
    }

    /// Next event, or `None` once the producer has gone away.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The shared remote document store.
///
/// Documents passed in never carry local bookkeeping fields; ids returned by
/// `create` are remote ids.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a document, returning its remote id.
    async fn create(&self, table: Table, document: &Document) -> RemoteResult<String>;

    async fn update(&self, table: Table, remote_id: &str, document: &Document)
        -> RemoteResult<()>;

    async fn delete(&self, table: Table, remote_id: &str) -> RemoteResult<()>;

    async fn get(&self, table: Table, remote_id: &str) -> RemoteResult<Option<RemoteDocument>>;

    /// Documents of `table` matching every filter of `query`.
    async fn find(&self, table: Table, query: &Query) -> RemoteResult<Vec<RemoteDocument>>;

    /// Changes recorded after `since` for documents owned by one of `owner_ids`.
    async fn updates_since(
        &self,
        since: DateTime<Utc>,
        owner_ids: &[String],
    ) -> RemoteResult<Vec<RemoteUpdate>>;

    /// Subscribe to changes of `table` owned by one of `owner_ids`.
    async fn subscribe(&self, table: Table, owner_ids: &[String]) -> RemoteResult<ChangeStream>;
}

/// Whether a document passes an owner filter (an empty filter admits everything).
pub(crate) fn owned_by(document: &Document, owner_ids: &[String]) -> bool {
    if owner_ids.is_empty() {
        return true;
    }
    crate::models::document_str(document, crate::models::FIELD_OWNER_ID)
        .is_some_and(|owner| owner_ids.iter().any(|id| id == owner))
}
