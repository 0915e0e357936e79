//! Realtime change-stream consumers, one per table

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::db::Query;
use crate::error::Result;
use crate::models::{ChangeKind, CurrentUser, DocumentChange, Table, FIELD_OWNER_ID};
use crate::remote::{ChangeEvent, ChangeStream, RemoteStore};
use crate::util::timestamp_now;

use super::events::{EventBus, SyncEvent};
use super::reconcile::Reconciler;

const STOCK_QUANTITY_FIELD: &str = "stock_quantity";
const DEFAULT_LOCATION_ID: &str = "default";
const DEFAULT_QUANTITY_MAX: i64 = 1000;

struct Shared {
    remote: Arc<dyn RemoteStore>,
    reconciler: Arc<Reconciler>,
    events: EventBus,
    ensure_initial_stock: bool,
}

/// Subscribes to every synced table and applies incoming changes locally.
///
/// A table whose subscription fails stays disabled until the next [`start`](Self::start).
pub struct RealtimeListener {
    shared: Arc<Shared>,
    tasks: Mutex<HashMap<Table, JoinHandle<()>>>,
}

impl RealtimeListener {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        reconciler: Arc<Reconciler>,
        events: EventBus,
        ensure_initial_stock: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                remote,
                reconciler,
                events,
                ensure_initial_stock,
            }),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<Table, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe every table for `user`, replacing any running subscriptions.
    ///
    /// Returns the number of tables now being listened to.
    pub async fn start(&self, user: &CurrentUser) -> usize {
        self.stop();
        let scope = user.owner_scope();

        let mut handles = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            match self.shared.remote.subscribe(table, &scope).await {
                Ok(stream) => {
                    let shared = self.shared.clone();
                    let user = user.clone();
                    handles.push((
                        table,
                        tokio::spawn(async move { shared.consume(table, stream, user).await }),
                    ));
                }
                Err(error) => {
                    tracing::warn!(table = %table, "Realtime subscription failed: {error}");
                    self.shared.events.emit(SyncEvent::ListenerStopped {
                        table,
                        message: error.to_string(),
                    });
                }
            }
        }

        let started = handles.len();
        self.tasks().extend(handles);
        tracing::info!(listeners = started, uid = %user.uid, "Realtime listeners started");
        started
    }

    /// Cancel every subscription.
    pub fn stop(&self) {
        let mut tasks = self.tasks();
        if tasks.is_empty() {
            return;
        }
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        tracing::info!("Realtime listeners stopped");
    }

    /// Whether at least one table is still being listened to.
    pub fn is_listening(&self) -> bool {
        self.active_listener_count() > 0
    }

    pub fn active_listener_count(&self) -> usize {
        self.tasks()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Apply one batch of changes for `table`; returns how many touched the local store.
    pub async fn handle_batch(
        &self,
        table: Table,
        changes: &[DocumentChange],
        user: &CurrentUser,
    ) -> usize {
        self.shared.handle_batch(table, changes, user).await
    }
}

impl Drop for RealtimeListener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    async fn consume(self: Arc<Self>, table: Table, mut stream: ChangeStream, user: CurrentUser) {
        while let Some(event) = stream.next().await {
            match event {
                ChangeEvent::Batch(changes) => {
                    self.handle_batch(table, &changes, &user).await;
                }
                ChangeEvent::Error(error) => {
                    tracing::warn!(table = %table, "Realtime listener disabled: {error}");
                    self.events.emit(SyncEvent::ListenerStopped {
                        table,
                        message: error.to_string(),
                    });
                    return;
                }
            }
        }
        tracing::debug!(table = %table, "Change stream closed");
    }

    async fn handle_batch(&self, table: Table, changes: &[DocumentChange], user: &CurrentUser) -> usize {
        let mut applied = 0;
        for change in changes {
            match self.reconciler.apply_change(table, change).await {
                Ok(outcome) if outcome.changed_local() => applied += 1,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        table = %table,
                        remote_id = %change.remote_id,
                        "Failed to apply realtime change: {error}"
                    );
                }
            }

            if table == Table::Products && change.kind != ChangeKind::Removed && self.ensure_initial_stock {
                if let Err(error) = self.ensure_initial_stock(change, user).await {
                    tracing::warn!(product_id = %change.remote_id, "Failed to create initial stock: {error}");
                }
            }
        }

        if applied > 0 {
            tracing::debug!(table = %table, changes = applied, "Applied realtime changes");
            self.events.emit(SyncEvent::TableChanged {
                table,
                changes: applied,
            });
        }
        applied
    }

    /// Give a product announcing `stock_quantity` a stock line if it has none.
    async fn ensure_initial_stock(&self, change: &DocumentChange, user: &CurrentUser) -> Result<()> {
        let Some(quantity) = change
            .data
            .get(STOCK_QUANTITY_FIELD)
            .filter(|value| value.is_number())
        else {
            return Ok(());
        };
        let owner_id = change
            .data
            .get(FIELD_OWNER_ID)
            .and_then(Value::as_str)
            .unwrap_or(&user.account_owner_id);

        let existing = self
            .remote
            .find(
                Table::Stock,
                &Query::new()
                    .eq(FIELD_OWNER_ID, owner_id)
                    .eq("product_id", change.remote_id.as_str()),
            )
            .await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let stock = json!({
            "product_id": change.remote_id,
            "location_id": DEFAULT_LOCATION_ID,
            "quantity_current": quantity,
            "quantity_min": 0,
            "quantity_max": DEFAULT_QUANTITY_MAX,
            "last_movement_date": timestamp_now(),
            "last_movement_type": "initial",
            "owner_id": owner_id,
        });
        let Value::Object(document) = stock else {
            return Ok(());
        };
        let remote_id = self.remote.create(Table::Stock, &document).await?;
        tracing::info!(product_id = %change.remote_id, stock_id = %remote_id, "Created initial stock");
        Ok(())
    }
}
