//! Persisted sync bookkeeping (pull checkpoint, last completed cycle)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::db::LocalStore;
use crate::error::Result;
use crate::models::{Document, FIELD_ID};
use crate::util::{format_timestamp, parse_timestamp};

/// Local table holding sync bookkeeping
pub const METADATA_TABLE: &str = "sync_metadata";

const STATE_ID: &str = "last_sync";
const FIELD_CHECKPOINT: &str = "checkpoint";
const FIELD_LAST_SYNC: &str = "last_sync";

/// Reads and writes the sync bookkeeping document.
pub struct SyncMetadata {
    store: Arc<dyn LocalStore>,
}

impl SyncMetadata {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Boundary up to which remote changes have been applied; the epoch before the first pull.
    pub async fn checkpoint(&self) -> Result<DateTime<Utc>> {
        Ok(self
            .read(FIELD_CHECKPOINT)
            .await?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    pub async fn set_checkpoint(&self, checkpoint: DateTime<Utc>) -> Result<()> {
        self.write(FIELD_CHECKPOINT, checkpoint).await
    }

    /// When the last sync cycle completed.
    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        self.read(FIELD_LAST_SYNC).await
    }

    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.write(FIELD_LAST_SYNC, at).await
    }

    async fn read(&self, field: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get_by_id(METADATA_TABLE, STATE_ID)
            .await?
            .and_then(|document| document.get(field).and_then(parse_timestamp)))
    }

    async fn write(&self, field: &str, at: DateTime<Utc>) -> Result<()> {
        let mut fields = Document::new();
        fields.insert(field.to_string(), Value::String(format_timestamp(at)));

        if !self
            .store
            .update(METADATA_TABLE, STATE_ID, fields.clone())
            .await?
        {
            fields.insert(FIELD_ID.to_string(), Value::String(STATE_ID.to_string()));
            self.store.insert(METADATA_TABLE, fields).await?;
        }
        Ok(())
    }
}
