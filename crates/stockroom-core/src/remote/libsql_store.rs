//! Remote store kept in a libSQL database
//!
//! Documents live in the `documents` table and every write appends to `change_log`,
//! which backs both `updates_since` and polling subscriptions. Pointing several
//! devices at the same file (or hosted database) gives them one shared store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::db::{Database, Query};
use crate::models::{
    document_str, ChangeKind, Document, DocumentChange, OperationKind, RemoteDocument,
    RemoteUpdate, Table, FIELD_OWNER_ID, FIELD_UPDATED_AT,
};
use crate::util::{compact_text, timestamp_now};

use super::{owned_by, ChangeEvent, ChangeStream, RemoteError, RemoteResult, RemoteStore};

/// Default delay between change-log polls for subscriptions
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn remote_error(error: libsql::Error) -> RemoteError {
    RemoteError::Unavailable(compact_text(&error.to_string()))
}

fn parse_data(data: &str) -> RemoteResult<Document> {
    serde_json::from_str(data).map_err(|error| RemoteError::Rejected(error.to_string()))
}

fn encode(document: &Document) -> RemoteResult<String> {
    serde_json::to_string(document).map_err(|error| RemoteError::Rejected(error.to_string()))
}

/// libSQL implementation of `RemoteStore`
#[derive(Clone)]
pub struct LibSqlRemoteStore {
    db: Arc<Mutex<Database>>,
    poll_interval: Duration,
}

impl LibSqlRemoteStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self {
            db,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set how often subscriptions poll the change log
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn load(db: &Database, table: Table, remote_id: &str) -> RemoteResult<Option<Document>> {
        let mut rows = db
            .connection()
            .query(
                "SELECT data FROM documents WHERE table_name = ?1 AND id = ?2",
                [table.as_str(), remote_id],
            )
            .await
            .map_err(remote_error)?;
        match rows.next().await.map_err(remote_error)? {
            Some(row) => {
                let data: String = row.get(0).map_err(remote_error)?;
                Ok(Some(parse_data(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn load_table(db: &Database, table: Table) -> RemoteResult<Vec<RemoteDocument>> {
        let mut rows = db
            .connection()
            .query(
                "SELECT id, data FROM documents WHERE table_name = ?1 ORDER BY rowid",
                [table.as_str()],
            )
            .await
            .map_err(remote_error)?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next().await.map_err(remote_error)? {
            let remote_id: String = row.get(0).map_err(remote_error)?;
            let data: String = row.get(1).map_err(remote_error)?;
            documents.push(RemoteDocument {
                remote_id,
                data: parse_data(&data)?,
            });
        }
        Ok(documents)
    }

    async fn log_change(
        db: &Database,
        table: Table,
        remote_id: &str,
        operation: OperationKind,
        document: &Document,
    ) -> RemoteResult<()> {
        db.connection()
            .execute(
                "INSERT INTO change_log (table_name, document_id, operation, owner_id, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                libsql::params![
                    table.as_str(),
                    remote_id,
                    operation.as_str(),
                    document_str(document, FIELD_OWNER_ID).unwrap_or_default(),
                    Utc::now().timestamp_millis()
                ],
            )
            .await
            .map_err(remote_error)?;
        Ok(())
    }

    /// Change-log rows after `after_seq` (optionally for one table), newest last.
    async fn changes_after(
        db: &Database,
        after_seq: i64,
        since_millis: i64,
        table: Option<Table>,
    ) -> RemoteResult<Vec<LoggedChange>> {
        let mut rows = db
            .connection()
            .query(
                "SELECT c.seq, c.table_name, c.document_id, c.operation,
                        COALESCE(c.owner_id, ''), COALESCE(d.data, '{}')
                 FROM change_log c
                 LEFT JOIN documents d ON d.table_name = c.table_name AND d.id = c.document_id
                 WHERE c.seq > ?1 AND c.changed_at > ?2 AND (?3 = '' OR c.table_name = ?3)
                 ORDER BY c.seq",
                libsql::params![
                    after_seq,
                    since_millis,
                    table.map_or("", Table::as_str)
                ],
            )
            .await
            .map_err(remote_error)?;

        let mut changes = Vec::new();
        while let Some(row) = rows.next().await.map_err(remote_error)? {
            let seq: i64 = row.get(0).map_err(remote_error)?;
            let table_name: String = row.get(1).map_err(remote_error)?;
            let remote_id: String = row.get(2).map_err(remote_error)?;
            let operation: String = row.get(3).map_err(remote_error)?;
            let owner_id: String = row.get(4).map_err(remote_error)?;
            let data: String = row.get(5).map_err(remote_error)?;

            let (Ok(table), Ok(operation)) = (
                table_name.parse::<Table>(),
                operation.parse::<OperationKind>(),
            ) else {
                tracing::warn!(seq, table = %table_name, "Skipping unreadable change-log entry");
                continue;
            };
            changes.push(LoggedChange {
                seq,
                table,
                remote_id,
                operation,
                owner_id,
                data: if operation == OperationKind::Delete {
                    Document::new()
                } else {
                    parse_data(&data)?
                },
            });
        }
        Ok(changes)
    }

    async fn last_seq(db: &Database) -> RemoteResult<i64> {
        let mut rows = db
            .connection()
            .query("SELECT COALESCE(MAX(seq), 0) FROM change_log", ())
            .await
            .map_err(remote_error)?;
        match rows.next().await.map_err(remote_error)? {
            Some(row) => row.get(0).map_err(remote_error),
            None => Ok(0),
        }
    }
}

struct LoggedChange {
    seq: i64,
    table: Table,
    remote_id: String,
    operation: OperationKind,
    owner_id: String,
    data: Document,
}

impl LoggedChange {
    fn owned_by(&self, owner_ids: &[String]) -> bool {
        owner_ids.is_empty() || owner_ids.iter().any(|owner| *owner == self.owner_id)
    }

    fn into_document_change(self) -> DocumentChange {
        let kind = match self.operation {
            OperationKind::Create => ChangeKind::Added,
            OperationKind::Update => ChangeKind::Modified,
            OperationKind::Delete => ChangeKind::Removed,
        };
        DocumentChange::new(kind, self.remote_id, self.data)
    }
}

#[async_trait]
impl RemoteStore for LibSqlRemoteStore {
    async fn create(&self, table: Table, document: &Document) -> RemoteResult<String> {
        let remote_id = Uuid::now_v7().simple().to_string();
        let mut document = document.clone();
        if !document.contains_key(FIELD_UPDATED_AT) {
            document.insert(FIELD_UPDATED_AT.to_string(), timestamp_now());
        }

        let db = self.db.lock().await;
        db.connection()
            .execute(
                "INSERT INTO documents (table_name, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
                libsql::params![
                    table.as_str(),
                    remote_id.as_str(),
                    encode(&document)?,
                    Utc::now().timestamp_millis()
                ],
            )
            .await
            .map_err(remote_error)?;
        Self::log_change(&db, table, &remote_id, OperationKind::Create, &document).await?;
        Ok(remote_id)
    }

    async fn update(
        &self,
        table: Table,
        remote_id: &str,
        document: &Document,
    ) -> RemoteResult<()> {
        let db = self.db.lock().await;
        let mut existing = Self::load(&db, table, remote_id)
            .await?
            .ok_or_else(|| RemoteError::NotFound(format!("{table}/{remote_id}")))?;
        existing.extend(document.clone());
        if !document.contains_key(FIELD_UPDATED_AT) {
            existing.insert(FIELD_UPDATED_AT.to_string(), timestamp_now());
        }

        db.connection()
            .execute(
                "UPDATE documents SET data = ?1, updated_at = ?2 WHERE table_name = ?3 AND id = ?4",
                libsql::params![
                    encode(&existing)?,
                    Utc::now().timestamp_millis(),
                    table.as_str(),
                    remote_id
                ],
            )
            .await
            .map_err(remote_error)?;
        Self::log_change(&db, table, remote_id, OperationKind::Update, &existing).await
    }

    async fn delete(&self, table: Table, remote_id: &str) -> RemoteResult<()> {
        let db = self.db.lock().await;
        let existing = Self::load(&db, table, remote_id)
            .await?
            .ok_or_else(|| RemoteError::NotFound(format!("{table}/{remote_id}")))?;

        db.connection()
            .execute(
                "DELETE FROM documents WHERE table_name = ?1 AND id = ?2",
                [table.as_str(), remote_id],
            )
            .await
            .map_err(remote_error)?;
        Self::log_change(&db, table, remote_id, OperationKind::Delete, &existing).await
    }

    async fn get(&self, table: Table, remote_id: &str) -> RemoteResult<Option<RemoteDocument>> {
        let db = self.db.lock().await;
        Ok(Self::load(&db, table, remote_id)
            .await?
            .map(|data| RemoteDocument {
                remote_id: remote_id.to_string(),
                data,
            }))
    }

    async fn find(&self, table: Table, query: &Query) -> RemoteResult<Vec<RemoteDocument>> {
        let db = self.db.lock().await;
        let mut documents = Self::load_table(&db, table).await?;
        documents.retain(|document| query.matches(&document.data));
        Ok(documents)
    }

    async fn updates_since(
        &self,
        since: DateTime<Utc>,
        owner_ids: &[String],
    ) -> RemoteResult<Vec<RemoteUpdate>> {
        let db = self.db.lock().await;
        let changes = Self::changes_after(&db, 0, since.timestamp_millis(), None).await?;
        Ok(changes
            .into_iter()
            .filter(|change| change.owned_by(owner_ids))
            .map(|change| RemoteUpdate {
                table: change.table,
                operation: change.operation,
                remote_id: change.remote_id,
                data: change.data,
            })
            .collect())
    }

    async fn subscribe(&self, table: Table, owner_ids: &[String]) -> RemoteResult<ChangeStream> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut after_seq = {
            let db = self.db.lock().await;
            let snapshot: Vec<DocumentChange> = Self::load_table(&db, table)
                .await?
                .into_iter()
                .filter(|document| owned_by(&document.data, owner_ids))
                .map(|document| {
                    DocumentChange::new(ChangeKind::Added, document.remote_id, document.data)
                })
                .collect();
            if !snapshot.is_empty() {
                let _ = sender.send(ChangeEvent::Batch(snapshot));
            }
            Self::last_seq(&db).await?
        };

        let db = self.db.clone();
        let owner_ids = owner_ids.to_vec();
        let poll_interval = self.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sender.is_closed() {
                    break;
                }

                let polled = {
                    let db = db.lock().await;
                    Self::changes_after(&db, after_seq, i64::MIN, Some(table)).await
                };
                match polled {
                    Ok(changes) => {
                        if let Some(last) = changes.last() {
                            after_seq = last.seq;
                        }
                        let batch: Vec<DocumentChange> = changes
                            .into_iter()
                            .filter(|change| change.owned_by(&owner_ids))
                            .map(LoggedChange::into_document_change)
                            .collect();
                        if !batch.is_empty() && sender.send(ChangeEvent::Batch(batch)).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = sender.send(ChangeEvent::Error(RemoteError::Subscription(
                            error.to_string(),
                        )));
                        break;
                    }
                }
            }
            tracing::debug!(%table, "Change-log subscription ended");
        });

        Ok(ChangeStream::with_task(receiver, task))
    }
}
