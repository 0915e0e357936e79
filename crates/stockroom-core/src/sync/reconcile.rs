//! Applying remote data to the local store
//!
//! Both the pull pipeline and the realtime listener funnel remote documents through
//! [`Reconciler`], which decides between updating a linked record, merging into a
//! duplicate candidate, inserting a new record, or skipping the change.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::db::{LocalStore, Query};
use crate::error::Result;
use crate::models::{
    ChangeKind, Document, DocumentChange, EntityRecord, OperationKind, RemoteUpdate, SyncStatus,
    Table, FIELD_CREATED_AT, FIELD_ID, FIELD_OWNER_ID, FIELD_REMOTE_ID, FIELD_SYNC_STATUS,
    FIELD_UPDATED_AT, LOCAL_ONLY_FIELDS,
};
use crate::util::{format_timestamp, is_provisional_id};

use super::id_map::IdReconciler;
use super::queue::OperationQueue;
use super::tracked::TrackedIds;

/// Why a remote change left the local store untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Our own write coming back through the change stream
    Echo,
    /// Remote value is older and would undo a local edit
    Regression,
    /// The record is deleted locally and its remote delete is still queued
    PendingDelete,
    /// Removal of a record this device never had
    UnknownRecord,
}

/// What applying one remote change did locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Inserted { local_id: String },
    Updated { local_id: String },
    /// Remote record folded into an unlinked local duplicate
    Merged { local_id: String },
    Deleted { local_id: String },
    Skipped(SkipReason),
}

impl Applied {
    /// Whether the local store was written.
    pub const fn changed_local(&self) -> bool {
        !matches!(self, Self::Skipped(_))
    }
}

/// Shared upsert/merge/delete logic for remote changes.
pub struct Reconciler {
    local: Arc<dyn LocalStore>,
    queue: Arc<OperationQueue>,
    tracked: Arc<TrackedIds>,
    id_map: Arc<IdReconciler>,
    duplicate_window: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        local: Arc<dyn LocalStore>,
        queue: Arc<OperationQueue>,
        tracked: Arc<TrackedIds>,
        id_map: Arc<IdReconciler>,
        duplicate_window: Duration,
    ) -> Self {
        Self {
            local,
            queue,
            tracked,
            id_map,
            duplicate_window: chrono::Duration::from_std(duplicate_window)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Apply one realtime change.
    ///
    /// `added` events for tracked ids are echoes and are skipped; `modified`
    /// events go through the regression guard.
    pub async fn apply_change(&self, table: Table, change: &DocumentChange) -> Result<Applied> {
        let applied = match change.kind {
            ChangeKind::Removed => self.remove(table, &change.remote_id).await?,
            ChangeKind::Added => {
                if self.tracked.contains(table, &change.remote_id) {
                    tracing::debug!(table = %table, remote_id = %change.remote_id, "Skipping echo of own write");
                    Applied::Skipped(SkipReason::Echo)
                } else {
                    self.upsert(table, &change.remote_id, &change.data, false)
                        .await?
                }
            }
            ChangeKind::Modified => {
                self.upsert(table, &change.remote_id, &change.data, true)
                    .await?
            }
        };
        if applied.changed_local() {
            self.local.invalidate_cache(Some(table.as_str()));
        }
        Ok(applied)
    }

    /// Apply one entry of a pulled "changes since" response.
    pub async fn apply_update(&self, update: &RemoteUpdate) -> Result<Applied> {
        let applied = match update.operation {
            OperationKind::Delete => self.remove(update.table, &update.remote_id).await?,
            OperationKind::Create | OperationKind::Update => {
                self.upsert(update.table, &update.remote_id, &update.data, true)
                    .await?
            }
        };
        if applied.changed_local() {
            self.local.invalidate_cache(Some(update.table.as_str()));
        }
        Ok(applied)
    }

    async fn upsert(
        &self,
        table: Table,
        remote_id: &str,
        data: &Document,
        guard_regressions: bool,
    ) -> Result<Applied> {
        let incoming = incoming_record(remote_id, data)?;

        if let Some(local) = self.find_linked(table, remote_id).await? {
            if guard_regressions && is_regression(table, &local, &incoming) {
                tracing::info!(
                    table = %table,
                    remote_id,
                    local_id = %local.local_id,
                    "Skipping stale remote change that would undo a local edit"
                );
                return Ok(Applied::Skipped(SkipReason::Regression));
            }
            self.overwrite(table, &local, remote_id, &incoming).await?;
            return Ok(Applied::Updated {
                local_id: local.local_id,
            });
        }

        if let Some(candidate) = self.find_duplicate(table, remote_id, &incoming).await? {
            self.overwrite(table, &candidate, remote_id, &incoming)
                .await?;
            self.id_map.record(table, &candidate.local_id, remote_id);
            tracing::info!(
                table = %table,
                remote_id,
                local_id = %candidate.local_id,
                "Merged remote record into local duplicate"
            );
            return Ok(Applied::Merged {
                local_id: candidate.local_id,
            });
        }

        if self.queue.has_unsent_delete(table, remote_id).await? {
            tracing::debug!(table = %table, remote_id, "Ignoring remote change for locally deleted record");
            return Ok(Applied::Skipped(SkipReason::PendingDelete));
        }

        let local_id = self
            .local
            .insert(table.as_str(), incoming.into_document())
            .await?;
        self.tracked.insert(table, remote_id);
        tracing::debug!(table = %table, remote_id, "Inserted remote record");
        Ok(Applied::Inserted { local_id })
    }

    async fn remove(&self, table: Table, remote_id: &str) -> Result<Applied> {
        let Some(local) = self.find_linked(table, remote_id).await? else {
            return Ok(Applied::Skipped(SkipReason::UnknownRecord));
        };
        self.local
            .delete(table.as_str(), &local.local_id)
            .await?;
        self.id_map.forget(table, &local.local_id);
        tracing::debug!(table = %table, remote_id, local_id = %local.local_id, "Deleted local record");
        Ok(Applied::Deleted {
            local_id: local.local_id,
        })
    }

    /// The local record linked to `remote_id`, or stored under it.
    pub async fn find_linked(&self, table: Table, remote_id: &str) -> Result<Option<EntityRecord>> {
        let linked = self
            .local
            .query(table.as_str(), &Query::new().eq(FIELD_REMOTE_ID, remote_id))
            .await?
            .into_iter()
            .next();
        let document = match linked {
            Some(document) => Some(document),
            None => self.local.get_by_id(table.as_str(), remote_id).await?,
        };
        document.map(EntityRecord::try_from).transpose()
    }

    /// An unlinked local record that is most likely the same entity as `incoming`.
    ///
    /// Same owner and fingerprint, not linked to a different remote id, and
    /// either created within the tolerance window or still carrying a
    /// provisional id.
    async fn find_duplicate(
        &self,
        table: Table,
        remote_id: &str,
        incoming: &EntityRecord,
    ) -> Result<Option<EntityRecord>> {
        let Some(fingerprint) = incoming.fingerprint(table) else {
            return Ok(None);
        };

        for document in self.local.get_all(table.as_str()).await? {
            let Ok(candidate) = EntityRecord::try_from(document) else {
                continue;
            };
            let linked_elsewhere = candidate
                .remote_id
                .as_deref()
                .is_some_and(|linked| linked != remote_id);
            if linked_elsewhere || candidate.owner_id != incoming.owner_id {
                continue;
            }
            if candidate.fingerprint(table).as_ref() != Some(&fingerprint) {
                continue;
            }

            let close_in_time = match (candidate.created_at, incoming.created_at) {
                (Some(local), Some(remote)) => (local - remote).abs() <= self.duplicate_window,
                _ => false,
            };
            if close_in_time || is_provisional_id(&candidate.local_id) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Copy remote fields onto `local`, keeping its local id.
    async fn overwrite(
        &self,
        table: Table,
        local: &EntityRecord,
        remote_id: &str,
        incoming: &EntityRecord,
    ) -> Result<()> {
        let mut partial = incoming.fields.clone();
        partial.insert(
            FIELD_REMOTE_ID.to_string(),
            Value::String(remote_id.to_string()),
        );
        partial.insert(
            FIELD_SYNC_STATUS.to_string(),
            Value::String(SyncStatus::Synced.as_str().to_string()),
        );
        if let Some(owner_id) = &incoming.owner_id {
            partial.insert(FIELD_OWNER_ID.to_string(), Value::String(owner_id.clone()));
        }
        if local.created_at.is_none() {
            if let Some(created_at) = incoming.created_at {
                partial.insert(
                    FIELD_CREATED_AT.to_string(),
                    Value::String(format_timestamp(created_at)),
                );
            }
        }
        if let Some(updated_at) = incoming.updated_at.or(local.updated_at) {
            partial.insert(
                FIELD_UPDATED_AT.to_string(),
                Value::String(format_timestamp(updated_at)),
            );
        }

        self.local
            .update(table.as_str(), &local.local_id, partial)
            .await?;
        Ok(())
    }
}

/// Build the record a remote document would become locally, keyed by its remote id.
fn incoming_record(remote_id: &str, data: &Document) -> Result<EntityRecord> {
    let mut document: Document = data
        .iter()
        .filter(|(key, _)| !LOCAL_ONLY_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    document.insert(FIELD_ID.to_string(), Value::String(remote_id.to_string()));

    let mut record = EntityRecord::try_from(document)?;
    record.remote_id = Some(remote_id.to_string());
    record.sync_status = SyncStatus::Synced;
    Ok(record)
}

/// Whether applying `incoming` would roll back a newer local value.
///
/// Older remote data never overwrites an unsynced local edit, and never lowers a
/// guarded quantity below the local one.
fn is_regression(table: Table, local: &EntityRecord, incoming: &EntityRecord) -> bool {
    let (Some(local_at), Some(remote_at)) = (local.updated_at, incoming.updated_at) else {
        return false;
    };
    if local_at <= remote_at {
        return false;
    }
    if local.sync_status == SyncStatus::Pending {
        return true;
    }
    matches!(
        (local.quantity(table), incoming.quantity(table)),
        (Some(local_quantity), Some(remote_quantity)) if remote_quantity < local_quantity
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LibSqlLocalStore;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const REMOTE_ID: &str = "Xk2v9QpLm3RtYb7Wc1Nd";

    struct Fixture {
        local: Arc<LibSqlLocalStore>,
        queue: Arc<OperationQueue>,
        tracked: Arc<TrackedIds>,
        id_map: Arc<IdReconciler>,
        reconciler: Reconciler,
    }

    async fn setup() -> Fixture {
        let local = Arc::new(
            LibSqlLocalStore::open_in_memory(std::time::Duration::ZERO)
                .await
                .unwrap(),
        );
        let queue = Arc::new(OperationQueue::new(local.clone()));
        let tracked = Arc::new(TrackedIds::new(100));
        let id_map = Arc::new(IdReconciler::new());
        let reconciler = Reconciler::new(
            local.clone(),
            queue.clone(),
            tracked.clone(),
            id_map.clone(),
            Duration::from_secs(30),
        );
        Fixture {
            local,
            queue,
            tracked,
            id_map,
            reconciler,
        }
    }

    fn document(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn change(kind: ChangeKind, data: Value) -> DocumentChange {
        DocumentChange::new(kind, REMOTE_ID, document(data))
    }

    fn seconds_ago(seconds: i64) -> String {
        format_timestamp(Utc::now() - chrono::Duration::seconds(seconds))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn added_without_match_inserts_and_tracks() {
        let fx = setup().await;
        let applied = fx
            .reconciler
            .apply_change(
                Table::Products,
                &change(ChangeKind::Added, json!({ "owner_id": "me", "name": "Widget" })),
            )
            .await
            .unwrap();

        assert_eq!(
            applied,
            Applied::Inserted {
                local_id: REMOTE_ID.to_string()
            }
        );
        let stored = fx.local.get_by_id("products", REMOTE_ID).await.unwrap().unwrap();
        assert_eq!(stored.get("remote_id"), Some(&json!(REMOTE_ID)));
        assert_eq!(stored.get("sync_status"), Some(&json!("synced")));
        assert!(fx.tracked.contains(Table::Products, REMOTE_ID));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tracked_added_events_are_echoes() {
        let fx = setup().await;
        fx.tracked.insert(Table::Products, REMOTE_ID);

        let applied = fx
            .reconciler
            .apply_change(
                Table::Products,
                &change(ChangeKind::Added, json!({ "name": "Widget" })),
            )
            .await
            .unwrap();

        assert_eq!(applied, Applied::Skipped(SkipReason::Echo));
        assert!(fx.local.get_all("products").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn linked_record_is_updated_in_place() {
        let fx = setup().await;
        fx.local
            .insert(
                "customers",
                document(json!({
                    "id": "id-local",
                    "remote_id": REMOTE_ID,
                    "name": "Ada",
                    "phone": "1"
                })),
            )
            .await
            .unwrap();

        let applied = fx
            .reconciler
            .apply_change(
                Table::Customers,
                &change(ChangeKind::Added, json!({ "name": "Ada", "phone": "2" })),
            )
            .await
            .unwrap();

        assert_eq!(
            applied,
            Applied::Updated {
                local_id: "id-local".to_string()
            }
        );
        let all = fx.local.get_all("customers").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("phone"), Some(&json!("2")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn provisional_duplicate_is_merged() {
        let fx = setup().await;
        fx.local
            .insert(
                "products",
                document(json!({
                    "id": "id-provisional",
                    "owner_id": "me",
                    "name": "Widget",
                    "sync_status": "pending",
                    "created_at": seconds_ago(5)
                })),
            )
            .await
            .unwrap();

        let applied = fx
            .reconciler
            .apply_change(
                Table::Products,
                &change(
                    ChangeKind::Added,
                    json!({ "owner_id": "me", "name": "Widget", "created_at": seconds_ago(0) }),
                ),
            )
            .await
            .unwrap();

        assert_eq!(
            applied,
            Applied::Merged {
                local_id: "id-provisional".to_string()
            }
        );
        let all = fx.local.get_all("products").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("remote_id"), Some(&json!(REMOTE_ID)));
        assert_eq!(all[0].get("sync_status"), Some(&json!("synced")));
        assert_eq!(
            fx.id_map.resolve(Table::Products, "id-provisional").as_deref(),
            Some(REMOTE_ID)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn records_linked_elsewhere_or_owned_by_others_are_not_merged() {
        let fx = setup().await;
        fx.local
            .insert(
                "categories",
                document(json!({
                    "id": "id-a",
                    "owner_id": "me",
                    "remote_id": "AnotherRemoteId000001",
                    "name": "Tools",
                    "created_at": seconds_ago(1)
                })),
            )
            .await
            .unwrap();
        fx.local
            .insert(
                "categories",
                document(json!({
                    "id": "id-b",
                    "owner_id": "someone-else",
                    "name": "Tools",
                    "created_at": seconds_ago(1)
                })),
            )
            .await
            .unwrap();

        let applied = fx
            .reconciler
            .apply_change(
                Table::Categories,
                &change(
                    ChangeKind::Added,
                    json!({ "owner_id": "me", "name": "Tools", "created_at": seconds_ago(0) }),
                ),
            )
            .await
            .unwrap();

        assert!(matches!(applied, Applied::Inserted { .. }));
        assert_eq!(fx.local.get_all("categories").await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unlinked_duplicate_inside_the_window_is_merged() {
        let fx = setup().await;
        fx.local
            .insert(
                "products",
                document(json!({
                    "id": "a1b2c3d4e5f6a7b8c9d0",
                    "owner_id": "me",
                    "name": "Widget",
                    "sync_status": "pending",
                    "created_at": seconds_ago(5)
                })),
            )
            .await
            .unwrap();

        let applied = fx
            .reconciler
            .apply_change(
                Table::Products,
                &change(
                    ChangeKind::Added,
                    json!({ "owner_id": "me", "name": "Widget", "created_at": seconds_ago(0) }),
                ),
            )
            .await
            .unwrap();

        assert_eq!(
            applied,
            Applied::Merged {
                local_id: "a1b2c3d4e5f6a7b8c9d0".to_string()
            }
        );
        let all = fx.local.get_all("products").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("remote_id"), Some(&json!(REMOTE_ID)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn old_duplicates_outside_the_window_are_kept_apart() {
        let fx = setup().await;
        fx.local
            .insert(
                "locations",
                document(json!({
                    "id": "a1b2c3d4e5f6a7b8c9d0",
                    "owner_id": "me",
                    "name": "Back room",
                    "created_at": seconds_ago(3600)
                })),
            )
            .await
            .unwrap();

        let applied = fx
            .reconciler
            .apply_change(
                Table::Locations,
                &change(
                    ChangeKind::Added,
                    json!({ "owner_id": "me", "name": "Back room", "created_at": seconds_ago(0) }),
                ),
            )
            .await
            .unwrap();
        assert!(matches!(applied, Applied::Inserted { .. }));
        assert_eq!(fx.local.get_all("locations").await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn modified_with_lower_quantity_does_not_regress_newer_local() {
        let fx = setup().await;
        fx.local
            .insert(
                "stock",
                document(json!({
                    "id": "id-stock",
                    "remote_id": REMOTE_ID,
                    "quantity_current": 10,
                    "updated_at": seconds_ago(1)
                })),
            )
            .await
            .unwrap();

        let applied = fx
            .reconciler
            .apply_change(
                Table::Stock,
                &change(
                    ChangeKind::Modified,
                    json!({ "quantity_current": 4, "updated_at": seconds_ago(60) }),
                ),
            )
            .await
            .unwrap();

        assert_eq!(applied, Applied::Skipped(SkipReason::Regression));
        let stored = fx.local.get_by_id("stock", "id-stock").await.unwrap().unwrap();
        assert_eq!(stored.get("quantity_current"), Some(&json!(10)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_remote_quantity_is_applied() {
        let fx = setup().await;
        fx.local
            .insert(
                "stock",
                document(json!({
                    "id": "id-stock",
                    "remote_id": REMOTE_ID,
                    "quantity_current": 10,
                    "updated_at": seconds_ago(60)
                })),
            )
            .await
            .unwrap();
        let remote_updated = seconds_ago(1);

        let applied = fx
            .reconciler
            .apply_change(
                Table::Stock,
                &change(
                    ChangeKind::Modified,
                    json!({ "quantity_current": 4, "updated_at": remote_updated }),
                ),
            )
            .await
            .unwrap();

        assert!(matches!(applied, Applied::Updated { .. }));
        let stored = fx.local.get_by_id("stock", "id-stock").await.unwrap().unwrap();
        assert_eq!(stored.get("quantity_current"), Some(&json!(4)));
        assert_eq!(stored.get("updated_at"), Some(&json!(remote_updated)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removed_deletes_by_remote_id() {
        let fx = setup().await;
        fx.local
            .insert(
                "sales",
                document(json!({ "id": "id-sale", "remote_id": REMOTE_ID })),
            )
            .await
            .unwrap();

        let applied = fx
            .reconciler
            .apply_change(Table::Sales, &change(ChangeKind::Removed, json!({})))
            .await
            .unwrap();
        assert_eq!(
            applied,
            Applied::Deleted {
                local_id: "id-sale".to_string()
            }
        );

        let again = fx
            .reconciler
            .apply_change(Table::Sales, &change(ChangeKind::Removed, json!({})))
            .await
            .unwrap();
        assert_eq!(again, Applied::Skipped(SkipReason::UnknownRecord));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pulled_create_of_known_record_does_not_reinsert() {
        let fx = setup().await;
        fx.local
            .insert(
                "products",
                document(json!({ "id": "id-local", "remote_id": REMOTE_ID, "name": "Widget" })),
            )
            .await
            .unwrap();

        let update = RemoteUpdate {
            table: Table::Products,
            operation: OperationKind::Create,
            remote_id: REMOTE_ID.to_string(),
            data: document(json!({ "name": "Widget" })),
        };
        fx.reconciler.apply_update(&update).await.unwrap();
        assert_eq!(fx.local.get_all("products").await.unwrap().len(), 1);
    }
    #[tokio::test(flavor = "multi_thread")]
    async fn older_remote_data_keeps_unsynced_local_edit() {
        let fx = setup().await;
        fx.local
            .insert(
                "customers",
                document(json!({
                    "id": "id-ada",
                    "remote_id": REMOTE_ID,
                    "name": "Ada",
                    "phone": "2",
                    "sync_status": "pending",
                    "updated_at": seconds_ago(1)
                })),
            )
            .await
            .unwrap();

        let applied = fx
            .reconciler
            .apply_change(
                Table::Customers,
                &change(
                    ChangeKind::Modified,
                    json!({ "name": "Ada", "phone": "1", "updated_at": seconds_ago(60) }),
                ),
            )
            .await
            .unwrap();

        assert_eq!(applied, Applied::Skipped(SkipReason::Regression));
        let stored = fx.local.get_by_id("customers", "id-ada").await.unwrap().unwrap();
        assert_eq!(stored.get("phone"), Some(&json!("2")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn records_awaiting_remote_delete_are_not_resurrected() {
        let fx = setup().await;
        let mut payload = Document::new();
        payload.insert(FIELD_REMOTE_ID.to_string(), json!(REMOTE_ID));
        fx.queue
            .enqueue(
                Table::Refunds,
                "id-refund",
                OperationKind::Delete,
                payload,
                crate::models::Priority::HIGH,
            )
            .await
            .unwrap();

        let update = RemoteUpdate {
            table: Table::Refunds,
            operation: OperationKind::Update,
            remote_id: REMOTE_ID.to_string(),
            data: document(json!({ "amount": 3 })),
        };
        let applied = fx.reconciler.apply_update(&update).await.unwrap();

        assert_eq!(applied, Applied::Skipped(SkipReason::PendingDelete));
        assert!(fx.local.get_all("refunds").await.unwrap().is_empty());
    }
}
