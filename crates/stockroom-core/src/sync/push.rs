//! Draining the operation queue to the remote store

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config::SyncSettings;
use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::models::{
    document_str, outbound_fields, Document, EntityRecord, Operation, OperationKind,
    OperationStatus, SyncStatus, Table, FIELD_REMOTE_ID, FIELD_SYNC_STATUS, FIELD_UPDATED_AT,
};
use crate::remote::{RemoteError, RemoteStore};
use crate::util::is_remote_id_shaped;

use super::events::{EventBus, SyncEvent};
use super::id_map::IdReconciler;
use super::queue::OperationQueue;
use super::tracked::TrackedIds;

/// Result of one push run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub pushed: usize,
    /// Entries removed without a remote call (already applied, nothing to delete)
    pub skipped: usize,
    /// Entries put back for a later attempt
    pub retried: usize,
    /// Entries dead-lettered during this run
    pub failed: usize,
    /// Entries still waiting out a retry delay
    pub deferred: usize,
    /// Earliest time a retried or deferred entry becomes due
    pub next_retry_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl PushReport {
    fn schedule(&mut self, at: DateTime<Utc>) {
        self.next_retry_at = Some(self.next_retry_at.map_or(at, |current| current.min(at)));
    }
}

enum Outcome {
    Synced { remote_id: Option<String> },
    Skipped(&'static str),
}

/// Sends queued operations to the remote store in priority order.
pub struct PushPipeline {
    queue: Arc<OperationQueue>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    id_map: Arc<IdReconciler>,
    tracked: Arc<TrackedIds>,
    events: EventBus,
    settings: SyncSettings,
}

impl PushPipeline {
    pub fn new(
        queue: Arc<OperationQueue>,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        id_map: Arc<IdReconciler>,
        tracked: Arc<TrackedIds>,
        events: EventBus,
        settings: SyncSettings,
    ) -> Self {
        Self {
            queue,
            local,
            remote,
            id_map,
            tracked,
            events,
            settings,
        }
    }

    /// Push every due pending operation, `batch_size` at a time.
    ///
    /// Per-operation failures are recorded on the queue entry; only failures to
    /// read the queue itself are returned.
    pub async fn run(&self) -> Result<PushReport> {
        let now = Utc::now();
        let (due, waiting): (Vec<Operation>, Vec<Operation>) = self
            .queue
            .list_pending()
            .await?
            .into_iter()
            .partition(|operation| operation.is_due(now));

        let mut report = PushReport {
            deferred: waiting.len(),
            ..PushReport::default()
        };
        for at in waiting.iter().filter_map(|operation| operation.next_attempt_at) {
            report.schedule(at);
        }

        if due.is_empty() {
            tracing::debug!(deferred = report.deferred, "No queued operations due");
            return Ok(report);
        }

        tracing::info!(operations = due.len(), deferred = report.deferred, "Pushing queued operations");
        for (index, batch) in due.chunks(self.settings.batch_size).enumerate() {
            tracing::debug!(batch = index + 1, size = batch.len(), "Pushing batch");
            for operation in batch {
                self.process(operation, &mut report).await;
            }
        }

        tracing::info!(
            pushed = report.pushed,
            skipped = report.skipped,
            retried = report.retried,
            failed = report.failed,
            "Push finished"
        );
        Ok(report)
    }

    async fn process(&self, operation: &Operation, report: &mut PushReport) {
        match self.queue.mark_syncing(&operation.id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => {
                tracing::warn!(operation_id = %operation.id, "Failed to claim operation: {error}");
                return;
            }
        }

        match self.dispatch(operation).await {
            Ok(outcome) => {
                if let Err(error) = self.queue.remove(&operation.id).await {
                    tracing::error!(operation_id = %operation.id, "Failed to remove pushed operation: {error}");
                }
                match outcome {
                    Outcome::Synced { remote_id } => {
                        report.pushed += 1;
                        tracing::debug!(
                            operation_id = %operation.id,
                            table = %operation.table,
                            record_id = %operation.record_id,
                            operation = %operation.kind,
                            "Operation synced"
                        );
                        self.events.emit(SyncEvent::OperationSynced {
                            table: operation.table,
                            record_id: operation.record_id.clone(),
                            remote_id,
                        });
                    }
                    Outcome::Skipped(reason) => {
                        report.skipped += 1;
                        tracing::info!(
                            operation_id = %operation.id,
                            table = %operation.table,
                            record_id = %operation.record_id,
                            reason,
                            "Operation dropped without remote call"
                        );
                    }
                }
            }
            Err(error) => self.handle_failure(operation, &error, report).await,
        }
    }

    async fn dispatch(&self, operation: &Operation) -> Result<Outcome> {
        match operation.kind {
            OperationKind::Create => self.push_create(operation).await,
            OperationKind::Update => self.push_update(operation).await,
            OperationKind::Delete => self.push_delete(operation).await,
        }
    }

    async fn push_create(&self, operation: &Operation) -> Result<Outcome> {
        let table = operation.table;
        let local = self
            .local
            .get_by_id(table.as_str(), &operation.record_id)
            .await?;

        let linked = local
            .clone()
            .map(EntityRecord::try_from)
            .transpose()?
            .and_then(|record| record.remote_id);
        if let Some(remote_id) = linked {
            self.id_map.record(table, &operation.record_id, &remote_id);
            return Ok(Outcome::Skipped("record already has a remote id"));
        }

        let document = outbound_fields(local.as_ref().unwrap_or(&operation.payload));
        let remote_id = match self.remote.create(table, &document).await {
            Ok(remote_id) => remote_id,
            Err(RemoteError::AlreadyExists { remote_id }) => {
                tracing::info!(table = %table, remote_id = %remote_id, "Remote copy already exists");
                remote_id
            }
            Err(error) => return Err(error.into()),
        };

        self.tracked.insert(table, &remote_id);
        self.id_map
            .record(table, &operation.record_id, &remote_id);
        self.settle_record(operation, Some(&remote_id)).await;
        Ok(Outcome::Synced {
            remote_id: Some(remote_id),
        })
    }

    async fn push_update(&self, operation: &Operation) -> Result<Outcome> {
        let remote_id = match self.resolve_remote_id(operation).await? {
            Some(remote_id) => remote_id,
            None => {
                tracing::warn!(
                    table = %operation.table,
                    record_id = %operation.record_id,
                    "No remote id known, updating by local id"
                );
                operation.record_id.clone()
            }
        };

        self.remote
            .update(operation.table, &remote_id, &outbound_fields(&operation.payload))
            .await?;
        self.settle_record(operation, None).await;
        Ok(Outcome::Synced {
            remote_id: Some(remote_id),
        })
    }

    async fn push_delete(&self, operation: &Operation) -> Result<Outcome> {
        let Some(remote_id) = self.resolve_remote_id(operation).await? else {
            tracing::warn!(
                table = %operation.table,
                record_id = %operation.record_id,
                "Deleted record never reached the remote store"
            );
            return Ok(Outcome::Skipped("no remote copy to delete"));
        };

        match self.remote.delete(operation.table, &remote_id).await {
            Ok(()) => {}
            Err(RemoteError::NotFound(_)) => {
                tracing::debug!(table = %operation.table, remote_id = %remote_id, "Remote copy already gone");
            }
            Err(error) => return Err(error.into()),
        }
        self.id_map.forget(operation.table, &operation.record_id);
        Ok(Outcome::Synced {
            remote_id: Some(remote_id),
        })
    }

    /// Remote id an update or delete should target.
    async fn resolve_remote_id(&self, operation: &Operation) -> Result<Option<String>> {
        let table = operation.table;
        if is_remote_id_shaped(&operation.record_id) {
            return Ok(Some(operation.record_id.clone()));
        }
        if let Some(remote_id) = self.id_map.resolve(table, &operation.record_id) {
            return Ok(Some(remote_id));
        }
        if let Some(remote_id) = document_str(&operation.payload, FIELD_REMOTE_ID) {
            return Ok(Some(remote_id.to_string()));
        }

        let linked = self
            .local
            .get_by_id(table.as_str(), &operation.record_id)
            .await?
            .and_then(|document| document_str(&document, FIELD_REMOTE_ID).map(str::to_string));
        if let Some(remote_id) = &linked {
            self.id_map.record(table, &operation.record_id, remote_id);
        }
        Ok(linked)
    }

    /// Mark the local record synced after a successful push.
    ///
    /// Failures are logged only: the remote write already happened and must not be
    /// retried because of local bookkeeping.
    async fn settle_record(&self, operation: &Operation, remote_id: Option<&str>) {
        let still_queued = match self
            .queue
            .for_record(operation.table, &operation.record_id)
            .await
        {
            Ok(entries) => entries
                .iter()
                .any(|entry| entry.id != operation.id && entry.status == OperationStatus::Pending),
            Err(_) => false,
        };
        let status = if still_queued {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };

        if let Err(error) = self
            .mark_record(operation.table, &operation.record_id, status, remote_id)
            .await
        {
            tracing::warn!(
                table = %operation.table,
                record_id = %operation.record_id,
                "Failed to update local sync status: {error}"
            );
        }
    }

    async fn mark_record(
        &self,
        table: Table,
        local_id: &str,
        status: SyncStatus,
        remote_id: Option<&str>,
    ) -> Result<()> {
        let Some(existing) = self.local.get_by_id(table.as_str(), local_id).await? else {
            return Ok(());
        };

        let mut partial = Document::new();
        partial.insert(
            FIELD_SYNC_STATUS.to_string(),
            Value::String(status.as_str().to_string()),
        );
        if let Some(remote_id) = remote_id {
            partial.insert(
                FIELD_REMOTE_ID.to_string(),
                Value::String(remote_id.to_string()),
            );
        }
        // bookkeeping must not look like a local edit to the regression guard
        if let Some(updated_at) = existing.get(FIELD_UPDATED_AT) {
            partial.insert(FIELD_UPDATED_AT.to_string(), updated_at.clone());
        }

        self.local
            .update(table.as_str(), local_id, partial)
            .await?;
        Ok(())
    }

    async fn handle_failure(&self, operation: &Operation, error: &Error, report: &mut PushReport) {
        let retry_count = operation.retry_count + 1;
        let message = error.to_string();
        let retryable = error.is_transient() && retry_count < self.settings.max_retries;

        if retryable {
            let delay = chrono::Duration::from_std(self.settings.retry_delay_for(retry_count))
                .unwrap_or_else(|_| chrono::Duration::zero());
            let next_attempt_at = Utc::now() + delay;
            if let Err(store_error) = self
                .queue
                .mark_retry(&operation.id, &message, retry_count, next_attempt_at)
                .await
            {
                tracing::error!(operation_id = %operation.id, "Failed to reschedule operation: {store_error}");
            }
            report.retried += 1;
            report.schedule(next_attempt_at);
            tracing::warn!(
                operation_id = %operation.id,
                table = %operation.table,
                record_id = %operation.record_id,
                retry_count,
                max_retries = self.settings.max_retries,
                "Push failed, will retry: {message}"
            );
        } else {
            if let Err(store_error) = self
                .queue
                .mark_error(&operation.id, &message, retry_count)
                .await
            {
                tracing::error!(operation_id = %operation.id, "Failed to dead-letter operation: {store_error}");
            }
            if operation.kind != OperationKind::Delete {
                if let Err(store_error) = self
                    .mark_record(operation.table, &operation.record_id, SyncStatus::Error, None)
                    .await
                {
                    tracing::warn!(record_id = %operation.record_id, "Failed to flag record: {store_error}");
                }
            }
            report.failed += 1;
            report.errors.push(format!(
                "{} {}/{}: {message}",
                operation.kind, operation.table, operation.record_id
            ));
            tracing::error!(
                operation_id = %operation.id,
                table = %operation.table,
                record_id = %operation.record_id,
                retry_count,
                "Push failed permanently: {message}"
            );
        }

        self.events.emit(SyncEvent::OperationFailed {
            table: operation.table,
            record_id: operation.record_id.clone(),
            retry_count,
            message,
            dead_lettered: !retryable,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LibSqlLocalStore;
    use crate::models::Priority;
    use crate::remote::InMemoryRemoteStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        local: Arc<LibSqlLocalStore>,
        remote: Arc<InMemoryRemoteStore>,
        queue: Arc<OperationQueue>,
        id_map: Arc<IdReconciler>,
        tracked: Arc<TrackedIds>,
        pipeline: PushPipeline,
    }

    async fn setup(settings: SyncSettings) -> Fixture {
        let local = Arc::new(LibSqlLocalStore::open_in_memory(Duration::ZERO).await.unwrap());
        let remote = Arc::new(InMemoryRemoteStore::new());
        let queue = Arc::new(OperationQueue::new(local.clone()));
        let id_map = Arc::new(IdReconciler::new());
        let tracked = Arc::new(TrackedIds::new(100));
        let pipeline = PushPipeline::new(
            queue.clone(),
            local.clone(),
            remote.clone(),
            id_map.clone(),
            tracked.clone(),
            EventBus::new(),
            settings,
        );
        Fixture {
            local,
            remote,
            queue,
            id_map,
            tracked,
            pipeline,
        }
    }

    fn document(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn local_product(fx: &Fixture, name: &str) -> String {
        let id = fx
            .local
            .insert(
                "products",
                document(json!({ "name": name, "owner_id": "me", "sync_status": "pending" })),
            )
            .await
            .unwrap();
        fx.queue
            .enqueue(
                Table::Products,
                &id,
                OperationKind::Create,
                document(json!({ "name": name, "owner_id": "me" })),
                Priority::HIGH,
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_links_remote_id_and_empties_queue() {
        let fx = setup(SyncSettings::default()).await;
        let id = local_product(&fx, "Widget").await;

        let report = fx.pipeline.run().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert!(fx.queue.all().await.unwrap().is_empty());

        let remote = fx.remote.documents(Table::Products);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].data.get("name"), Some(&json!("Widget")));
        assert!(!remote[0].data.contains_key("sync_status"));

        let stored = fx.local.get_by_id("products", &id).await.unwrap().unwrap();
        assert_eq!(stored.get("remote_id"), Some(&json!(remote[0].remote_id)));
        assert_eq!(stored.get("sync_status"), Some(&json!("synced")));
        assert!(fx.tracked.contains(Table::Products, &remote[0].remote_id));
        assert_eq!(
            fx.id_map.resolve(Table::Products, &id),
            Some(remote[0].remote_id.clone())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_after_create_targets_the_new_remote_id() {
        let fx = setup(SyncSettings::default()).await;
        let id = local_product(&fx, "Widget").await;
        fx.queue
            .enqueue(
                Table::Products,
                &id,
                OperationKind::Update,
                document(json!({ "price": 12 })),
                Priority::HIGH,
            )
            .await
            .unwrap();

        let report = fx.pipeline.run().await.unwrap();
        assert_eq!(report.pushed, 2);
        let remote = fx.remote.documents(Table::Products);
        assert_eq!(remote[0].data.get("price"), Some(&json!(12)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failures_are_retried_then_dead_lettered() {
        let settings = SyncSettings {
            retry_delay: Duration::ZERO,
            ..SyncSettings::default()
        };
        let fx = setup(settings).await;
        let id = local_product(&fx, "Widget").await;
        fx.remote.set_offline(true);

        for _ in 0..3 {
            fx.pipeline.run().await.unwrap();
        }

        let failed = fx.queue.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 3);
        assert!(failed[0].error_message.as_deref().unwrap().contains("offline"));
        assert_eq!(fx.remote.call_count("create"), 3);

        let stored = fx.local.get_by_id("products", &id).await.unwrap().unwrap();
        assert_eq!(stored.get("sync_status"), Some(&json!("error")));

        let report = fx.pipeline.run().await.unwrap();
        assert_eq!(report, PushReport::default());
        assert_eq!(fx.remote.call_count("create"), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_delay_defers_the_next_attempt() {
        let fx = setup(SyncSettings::default()).await;
        local_product(&fx, "Widget").await;
        fx.remote
            .fail_next(RemoteError::Timeout("slow network".into()));

        let first = fx.pipeline.run().await.unwrap();
        assert_eq!(first.retried, 1);
        assert!(first.next_retry_at.is_some());

        let second = fx.pipeline.run().await.unwrap();
        assert_eq!(second.deferred, 1);
        assert_eq!(second.pushed, 0);
        assert_eq!(fx.remote.call_count("create"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_writes_are_dead_lettered_immediately() {
        let fx = setup(SyncSettings::default()).await;
        local_product(&fx, "Widget").await;
        fx.remote
            .fail_next(RemoteError::Rejected("permission denied".into()));

        let report = fx.pipeline.run().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(fx.queue.list_failed().await.unwrap()[0].retry_count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn already_existing_remote_copy_counts_as_success() {
        let fx = setup(SyncSettings::default()).await;
        let id = local_product(&fx, "Widget").await;
        fx.remote.fail_next(RemoteError::AlreadyExists {
            remote_id: "ExistingRemoteId0001".into(),
        });

        let report = fx.pipeline.run().await.unwrap();
        assert_eq!(report.pushed, 1);
        let stored = fx.local.get_by_id("products", &id).await.unwrap().unwrap();
        assert_eq!(stored.get("remote_id"), Some(&json!("ExistingRemoteId0001")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_for_already_linked_record_is_skipped() {
        let fx = setup(SyncSettings::default()).await;
        let id = fx
            .local
            .insert(
                "products",
                document(json!({ "name": "Widget", "remote_id": "AlreadyLinkedRemote01" })),
            )
            .await
            .unwrap();
        fx.queue
            .enqueue(Table::Products, &id, OperationKind::Create, Document::new(), Priority::HIGH)
            .await
            .unwrap();

        let report = fx.pipeline.run().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(fx.remote.call_count("create"), 0);
        assert!(fx.queue.all().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_without_remote_id_is_skipped_and_missing_remote_is_fine() {
        let fx = setup(SyncSettings::default()).await;
        fx.queue
            .enqueue(
                Table::Sales,
                "id-never-pushed",
                OperationKind::Delete,
                Document::new(),
                Priority::HIGH,
            )
            .await
            .unwrap();
        fx.queue
            .enqueue(
                Table::Sales,
                "id-pushed",
                OperationKind::Delete,
                document(json!({ "remote_id": "GoneFromRemoteStore1" })),
                Priority::HIGH,
            )
            .await
            .unwrap();

        let report = fx.pipeline.run().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(fx.remote.call_count("delete"), 1);
        assert!(fx.queue.all().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn operations_are_pushed_in_batches_by_priority() {
        let settings = SyncSettings {
            batch_size: 2,
            ..SyncSettings::default()
        };
        let fx = setup(settings).await;
        for (name, priority) in [("low", Priority::LOW), ("high", Priority::HIGH), ("normal", Priority::NORMAL)] {
            fx.queue
                .enqueue(
                    Table::Categories,
                    &format!("id-{name}"),
                    OperationKind::Create,
                    document(json!({ "name": name })),
                    priority,
                )
                .await
                .unwrap();
        }

        let report = fx.pipeline.run().await.unwrap();
        assert_eq!(report.pushed, 3);
        assert_eq!(fx.remote.call_count("create"), 3);

        let mut names: Vec<_> = fx
            .remote
            .documents(Table::Categories)
            .into_iter()
            .map(|doc| doc.data.get("name").cloned().unwrap())
            .collect();
        names.sort_by_key(|name| name.to_string());
        assert_eq!(names, vec![json!("high"), json!("low"), json!("normal")]);
    }
}
