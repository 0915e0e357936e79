//! Durable queue of local mutations awaiting the remote store

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::{LocalStore, Query};
use crate::error::Result;
use crate::models::{
    document_str, Document, Operation, OperationKind, OperationStatus, Priority, Table,
    FIELD_REMOTE_ID,
};
use crate::util::{compact_text, format_timestamp};

/// Local table holding queue entries
pub const QUEUE_TABLE: &str = "sync_queue";

/// Entry counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
}

/// Operation queue persisted through the local store.
pub struct OperationQueue {
    store: Arc<dyn LocalStore>,
}

impl OperationQueue {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Append an entry and return it.
    pub async fn enqueue(
        &self,
        table: Table,
        record_id: &str,
        kind: OperationKind,
        payload: Document,
        priority: Priority,
    ) -> Result<Operation> {
        let operation = Operation {
            id: Uuid::now_v7().to_string(),
            table,
            record_id: record_id.to_string(),
            kind,
            payload,
            priority,
            status: OperationStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            next_attempt_at: None,
        };
        self.store
            .insert(QUEUE_TABLE, operation.to_document()?)
            .await?;

        tracing::debug!(
            operation_id = %operation.id,
            table = %table,
            record_id,
            operation = %kind,
            priority = priority.get(),
            "Enqueued operation"
        );
        Ok(operation)
    }

    /// Every entry in drain order.
    pub async fn all(&self) -> Result<Vec<Operation>> {
        let mut operations: Vec<Operation> = self
            .store
            .get_all(QUEUE_TABLE)
            .await?
            .into_iter()
            .filter_map(|document| match Operation::from_document(document) {
                Ok(operation) => Some(operation),
                Err(error) => {
                    tracing::warn!("Skipping unreadable queue entry: {error}");
                    None
                }
            })
            .collect();
        operations.sort_by(Operation::drain_order);
        Ok(operations)
    }

    /// Pending entries, highest priority first, then oldest first.
    pub async fn list_pending(&self) -> Result<Vec<Operation>> {
        self.with_status(OperationStatus::Pending).await
    }

    /// Dead-lettered entries.
    pub async fn list_failed(&self) -> Result<Vec<Operation>> {
        self.with_status(OperationStatus::Error).await
    }

    async fn with_status(&self, status: OperationStatus) -> Result<Vec<Operation>> {
        let mut operations = self.all().await?;
        operations.retain(|operation| operation.status == status);
        Ok(operations)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Operation>> {
        self.store
            .get_by_id(QUEUE_TABLE, id)
            .await?
            .map(Operation::from_document)
            .transpose()
    }

    /// Delete an entry after the remote store confirmed it.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store.delete(QUEUE_TABLE, id).await
    }

    pub async fn mark_syncing(&self, id: &str) -> Result<bool> {
        self.set_fields(
            id,
            json!({ "status": OperationStatus::Syncing.as_str() }),
        )
        .await
    }

    /// Put an entry back in line for another attempt no earlier than `next_attempt_at`.
    pub async fn mark_retry(
        &self,
        id: &str,
        message: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.set_fields(
            id,
            json!({
                "status": OperationStatus::Pending.as_str(),
                "retry_count": retry_count,
                "error_message": compact_text(message),
                "next_attempt_at": format_timestamp(next_attempt_at),
            }),
        )
        .await
    }

    /// Dead-letter an entry, keeping its last error message.
    pub async fn mark_error(&self, id: &str, message: &str, retry_count: u32) -> Result<bool> {
        self.set_fields(
            id,
            json!({
                "status": OperationStatus::Error.as_str(),
                "retry_count": retry_count,
                "error_message": compact_text(message),
                "next_attempt_at": Value::Null,
            }),
        )
        .await
    }

    /// Move entries left `syncing` by an interrupted run back to `pending`.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for operation in self.with_status(OperationStatus::Syncing).await? {
            if self
                .set_fields(
                    &operation.id,
                    json!({ "status": OperationStatus::Pending.as_str() }),
                )
                .await?
            {
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Recovered interrupted queue entries");
        }
        Ok(recovered)
    }

    /// Reset every dead-lettered entry to `pending` with a fresh retry budget.
    pub async fn retry_failed(&self) -> Result<usize> {
        let mut reset = 0;
        for operation in self.list_failed().await? {
            let changed = self
                .set_fields(
                    &operation.id,
                    json!({
                        "status": OperationStatus::Pending.as_str(),
                        "retry_count": 0,
                        "error_message": Value::Null,
                        "next_attempt_at": Value::Null,
                    }),
                )
                .await?;
            if changed {
                reset += 1;
            }
        }
        tracing::info!(reset, "Reset failed queue entries");
        Ok(reset)
    }

    /// Drop pending create entries for `table` ahead of a forced re-enqueue.
    pub async fn purge_pending_creates(&self, table: Table) -> Result<usize> {
        let mut purged = 0;
        for operation in self.list_pending().await? {
            if operation.table == table
                && operation.kind == OperationKind::Create
                && self.remove(&operation.id).await?
            {
                purged += 1;
            }
        }
        tracing::info!(table = %table, purged, "Purged pending create operations");
        Ok(purged)
    }

    /// Drop all pending entries for a record that never reached the remote store.
    ///
    /// Only applies while the record's create is still pending; returns the number
    /// of entries removed (zero when the create was already sent).
    pub async fn discard_unsent(&self, table: Table, record_id: &str) -> Result<usize> {
        let entries: Vec<Operation> = self
            .all()
            .await?
            .into_iter()
            .filter(|operation| operation.table == table && operation.record_id == record_id)
            .collect();

        let unsent = entries.iter().all(|operation| operation.status == OperationStatus::Pending)
            && entries
                .iter()
                .any(|operation| operation.kind == OperationKind::Create);
        if !unsent {
            return Ok(0);
        }

        let mut removed = 0;
        for operation in &entries {
            if self.remove(&operation.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for operation in self.all().await? {
            match operation.status {
                OperationStatus::Pending => counts.pending += 1,
                OperationStatus::Syncing => counts.syncing += 1,
                OperationStatus::Error => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Entries touching one record.
    pub async fn for_record(&self, table: Table, record_id: &str) -> Result<Vec<Operation>> {
        let query = Query::new()
            .eq("table_name", table.as_str())
            .eq("record_id", record_id);
        let mut operations: Vec<Operation> = self
            .store
            .query(QUEUE_TABLE, &query)
            .await?
            .into_iter()
            .filter_map(|document| Operation::from_document(document).ok())
            .collect();
        operations.sort_by(Operation::drain_order);
        Ok(operations)
    }

    /// Whether a delete of `remote_id` is still waiting to be pushed.
    pub async fn has_unsent_delete(&self, table: Table, remote_id: &str) -> Result<bool> {
        let query = Query::new()
            .eq("table_name", table.as_str())
            .eq("operation", OperationKind::Delete.as_str());
        Ok(self
            .store
            .query(QUEUE_TABLE, &query)
            .await?
            .into_iter()
            .filter_map(|document| Operation::from_document(document).ok())
            .any(|operation| {
                operation.status != OperationStatus::Error
                    && (operation.record_id == remote_id
                        || document_str(&operation.payload, FIELD_REMOTE_ID) == Some(remote_id))
            }))
    }

    async fn set_fields(&self, id: &str, fields: Value) -> Result<bool> {
        let Value::Object(fields) = fields else {
            return Ok(false);
        };
        self.store.update(QUEUE_TABLE, id, fields).await
    }
}
