//! Changes flowing from the remote store to the device

use serde::{Deserialize, Serialize};

use crate::models::{Document, OperationKind, Table};

/// Kind of a realtime change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document change delivered by a change-stream subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub remote_id: String,
    /// Remote fields; empty for removals
    #[serde(default)]
    pub data: Document,
}

impl DocumentChange {
    pub fn new(kind: ChangeKind, remote_id: impl Into<String>, data: Document) -> Self {
        Self {
            kind,
            remote_id: remote_id.into(),
            data,
        }
    }
}

/// One entry of a "changes since checkpoint" response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUpdate {
    pub table: Table,
    pub operation: OperationKind,
    pub remote_id: String,
    #[serde(default)]
    pub data: Document,
}

/// A document as held by the remote store, keyed by its remote id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub remote_id: String,
    pub data: Document,
}
