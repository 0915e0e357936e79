//! Engine façade
//!
//! [`SyncEngine`] wires the queue, pipelines, listener and coordinator together
//! over injected stores, and owns the background scheduler that runs cycles
//! after local writes, on reconnect, when retries come due and periodically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SyncSettings;
use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::identity::IdentityProvider;
use crate::models::{
    document_str, outbound_fields, CurrentUser, Document, Operation, OperationKind, Priority,
    SyncStatus, Table, CURRENT_SCHEMA_VERSION, FIELD_CREATED_AT, FIELD_OWNER_ID, FIELD_REMOTE_ID,
    FIELD_SCHEMA_VERSION, FIELD_SYNC_STATUS, FIELD_UPDATED_AT,
};
use crate::remote::RemoteStore;
use crate::sync::{
    CycleOutcome, EventBus, IdReconciler, OperationQueue, PullPipeline, PushPipeline,
    QueueCounts, RealtimeListener, Reconciler, SyncCoordinator, SyncEvent, SyncMetadata,
    TrackedIds,
};
use crate::util::timestamp_now;

/// Collaborators the engine runs against.
pub struct SyncContext {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub settings: SyncSettings,
}

/// Snapshot returned by [`SyncEngine::sync_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusReport {
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub last_sync: Option<DateTime<Utc>>,
    /// Entries waiting to be pushed, including any being pushed right now
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub errors: Vec<String>,
    pub listening: bool,
    pub active_listeners: usize,
}

/// Offline-first sync engine. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    local: Arc<dyn LocalStore>,
    identity: Arc<dyn IdentityProvider>,
    settings: SyncSettings,
    queue: Arc<OperationQueue>,
    metadata: Arc<SyncMetadata>,
    coordinator: SyncCoordinator,
    listener: RealtimeListener,
    events: EventBus,
    /// Set between `start` and `stop`; automatic triggers only fire while set
    active: AtomicBool,
    destroyed: AtomicBool,
    user: Mutex<Option<CurrentUser>>,
    signals: Arc<Signals>,
    retry_at: Mutex<Option<DateTime<Utc>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// Wake-ups for the scheduler task, shared without keeping the engine alive.
#[derive(Default)]
struct Signals {
    /// Run a cycle as soon as possible
    wake: Notify,
    /// Recompute the deadline without running a cycle
    reschedule: Notify,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .scheduler
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl SyncEngine {
    /// Build an engine over `context`; nothing runs until [`init`](Self::init).
    pub fn new(context: SyncContext) -> Result<Self> {
        let SyncContext {
            local,
            remote,
            identity,
            settings,
        } = context;
        settings.validate()?;

        let events = EventBus::new();
        let queue = Arc::new(OperationQueue::new(local.clone()));
        let metadata = Arc::new(SyncMetadata::new(local.clone()));
        let tracked = Arc::new(TrackedIds::new(settings.tracked_id_capacity));
        let id_map = Arc::new(IdReconciler::new());
        let reconciler = Arc::new(Reconciler::new(
            local.clone(),
            queue.clone(),
            tracked.clone(),
            id_map.clone(),
            settings.duplicate_window,
        ));

        let pull = PullPipeline::new(
            remote.clone(),
            identity.clone(),
            reconciler.clone(),
            metadata.clone(),
            events.clone(),
        );
        let push = PushPipeline::new(
            queue.clone(),
            local.clone(),
            remote.clone(),
            id_map,
            tracked,
            events.clone(),
            settings.clone(),
        );
        let coordinator = SyncCoordinator::new(
            pull,
            push,
            metadata.clone(),
            events.clone(),
            settings.max_recorded_errors,
        );
        let listener = RealtimeListener::new(
            remote,
            reconciler,
            events.clone(),
            settings.ensure_initial_stock,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                local,
                identity,
                settings,
                queue,
                metadata,
                coordinator,
                listener,
                events,
                active: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                user: Mutex::new(None),
                signals: Arc::new(Signals::default()),
                retry_at: Mutex::new(None),
                scheduler: Mutex::new(None),
            }),
        })
    }

    /// Recover interrupted queue entries, restore bookkeeping and start the scheduler.
    pub async fn init(&self) -> Result<()> {
        self.ensure_alive()?;
        let recovered = self.inner.queue.recover_interrupted().await?;
        let last_sync = self.inner.metadata.last_sync().await?;
        self.inner.coordinator.restore_last_sync(last_sync);

        let mut scheduler = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if scheduler.is_none() {
            *scheduler = Some(tokio::spawn(run_scheduler(
                Arc::downgrade(&self.inner),
                self.inner.signals.clone(),
                self.inner.settings.sync_interval,
            )));
        }
        tracing::info!(recovered, last_sync = ?last_sync, "Sync engine initialized");
        Ok(())
    }

    /// Begin syncing for `user_id`: subscribe listeners and enable automatic cycles.
    ///
    /// `user_id` must be the user the identity collaborator reports as signed in.
    pub async fn start(&self, user_id: &str) -> Result<()> {
        self.ensure_alive()?;
        let user = self
            .inner
            .identity
            .current_user()
            .await?
            .filter(|user| user.uid == user_id)
            .ok_or_else(|| Error::Identity(format!("user `{user_id}` is not signed in")))?;

        self.inner.listener.start(&user).await;
        *self
            .inner
            .user
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(user);
        self.inner.active.store(true, Ordering::Release);
        tracing::info!(uid = user_id, "Sync engine started");

        self.trigger();
        Ok(())
    }

    /// Stop automatic cycles and unsubscribe listeners. An in-flight cycle finishes.
    pub fn stop(&self) {
        if self.inner.active.swap(false, Ordering::AcqRel) {
            tracing::info!("Sync engine stopped");
        }
        self.inner.listener.stop();
        *self
            .inner
            .user
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Stop everything for good; later calls fail.
    pub fn destroy(&self) {
        self.stop();
        self.inner.destroyed.store(true, Ordering::Release);
        if let Some(handle) = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        tracing::info!("Sync engine destroyed");
    }

    /// Append an operation to the queue and trigger a cycle when online.
    pub async fn enqueue(
        &self,
        table: Table,
        record_id: &str,
        kind: OperationKind,
        payload: Document,
        priority: Option<Priority>,
    ) -> Result<Operation> {
        self.ensure_alive()?;
        let operation = self
            .inner
            .queue
            .enqueue(table, record_id, kind, payload, priority.unwrap_or_default())
            .await?;
        self.trigger();
        Ok(operation)
    }

    /// Write a new record locally and queue its creation; returns the local id.
    pub async fn create_record(&self, table: Table, fields: Document) -> Result<String> {
        self.ensure_alive()?;
        let owner_id = match document_str(&fields, FIELD_OWNER_ID) {
            Some(owner_id) => owner_id.to_string(),
            None => self.owner_id().await?,
        };

        let now = timestamp_now();
        let mut document = outbound_fields(&fields);
        document.insert(FIELD_OWNER_ID.to_string(), Value::String(owner_id));
        document
            .entry(FIELD_CREATED_AT.to_string())
            .or_insert_with(|| now.clone());
        document.insert(FIELD_UPDATED_AT.to_string(), now);
        let payload = document.clone();

        document.insert(FIELD_REMOTE_ID.to_string(), Value::Null);
        document.insert(
            FIELD_SYNC_STATUS.to_string(),
            Value::String(SyncStatus::Pending.as_str().to_string()),
        );
        document.insert(
            FIELD_SCHEMA_VERSION.to_string(),
            Value::from(CURRENT_SCHEMA_VERSION),
        );

        let local_id = self.inner.local.insert(table.as_str(), document).await?;
        self.enqueue(table, &local_id, OperationKind::Create, payload, None)
            .await?;
        Ok(local_id)
    }

    /// Apply `changes` to a local record and queue the update.
    pub async fn update_record(&self, table: Table, id: &str, changes: Document) -> Result<()> {
        self.ensure_alive()?;
        let Some(existing) = self.inner.local.get_by_id(table.as_str(), id).await? else {
            return Err(Error::NotFound(format!("{table}/{id}")));
        };

        let mut payload = outbound_fields(&changes);
        payload.insert(FIELD_UPDATED_AT.to_string(), timestamp_now());

        let mut partial = payload.clone();
        partial.insert(
            FIELD_SYNC_STATUS.to_string(),
            Value::String(SyncStatus::Pending.as_str().to_string()),
        );
        self.inner
            .local
            .update(table.as_str(), id, partial)
            .await?;

        if let Some(remote_id) = document_str(&existing, FIELD_REMOTE_ID) {
            payload.insert(
                FIELD_REMOTE_ID.to_string(),
                Value::String(remote_id.to_string()),
            );
        }
        self.enqueue(table, id, OperationKind::Update, payload, None)
            .await?;
        Ok(())
    }

    /// Delete a local record and queue the remote delete.
    ///
    /// A record whose create never left the queue is dropped together with its
    /// queue entries instead.
    pub async fn delete_record(&self, table: Table, id: &str) -> Result<()> {
        self.ensure_alive()?;
        let Some(existing) = self.inner.local.get_by_id(table.as_str(), id).await? else {
            return Err(Error::NotFound(format!("{table}/{id}")));
        };
        self.inner.local.delete(table.as_str(), id).await?;

        let discarded = self.inner.queue.discard_unsent(table, id).await?;
        if discarded > 0 {
            tracing::debug!(table = %table, record_id = id, discarded, "Dropped unsent record");
            return Ok(());
        }

        let mut payload = Document::new();
        if let Some(remote_id) = document_str(&existing, FIELD_REMOTE_ID) {
            payload.insert(
                FIELD_REMOTE_ID.to_string(),
                Value::String(remote_id.to_string()),
            );
        }
        self.enqueue(table, id, OperationKind::Delete, payload, None)
            .await?;
        Ok(())
    }

    /// Run a cycle now, waiting for an in-flight one to finish first.
    pub async fn force_sync(&self) -> Result<CycleOutcome> {
        self.ensure_alive()?;
        let outcome = self.inner.coordinator.run_cycle_waiting().await?;
        self.inner.note_outcome(&outcome);
        Ok(outcome)
    }

    pub async fn sync_status(&self) -> Result<SyncStatusReport> {
        let QueueCounts {
            pending,
            syncing,
            failed,
        } = self.inner.queue.counts().await?;
        let coordinator = &self.inner.coordinator;
        Ok(SyncStatusReport {
            is_online: coordinator.is_online(),
            sync_in_progress: coordinator.is_syncing(),
            last_sync: coordinator.last_sync(),
            pending_operations: pending + syncing,
            failed_operations: failed,
            errors: coordinator.errors(),
            listening: self.inner.listener.is_listening(),
            active_listeners: self.inner.listener.active_listener_count(),
        })
    }

    /// Report connectivity changes; coming back online triggers a cycle.
    pub fn set_online(&self, online: bool) {
        if self.inner.coordinator.set_online(online) {
            self.trigger();
        }
    }

    /// Give dead-lettered operations another full retry budget.
    pub async fn retry_failed(&self) -> Result<usize> {
        self.ensure_alive()?;
        let reset = self.inner.queue.retry_failed().await?;
        if reset > 0 {
            self.trigger();
        }
        Ok(reset)
    }

    pub async fn purge_pending_creates(&self, table: Table) -> Result<usize> {
        self.ensure_alive()?;
        self.inner.queue.purge_pending_creates(table).await
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listener.is_listening()
    }

    pub fn active_listener_count(&self) -> usize {
        self.inner.listener.active_listener_count()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }

    pub fn local_store(&self) -> Arc<dyn LocalStore> {
        self.inner.local.clone()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidInput("sync engine has been destroyed".into()));
        }
        Ok(())
    }

    fn trigger(&self) {
        if self.inner.is_active() && self.inner.coordinator.is_online() {
            self.inner.signals.wake.notify_one();
        }
    }

    async fn owner_id(&self) -> Result<String> {
        let started = self
            .inner
            .user
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|user| user.account_owner_id.clone());
        if let Some(owner_id) = started {
            return Ok(owner_id);
        }
        self.inner
            .identity
            .current_user()
            .await?
            .map(|user| user.account_owner_id)
            .ok_or_else(|| Error::Identity("no signed-in user".into()))
    }
}

impl Inner {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.destroyed.load(Ordering::Acquire)
    }

    /// Remember when deferred operations come due.
    fn note_outcome(&self, outcome: &CycleOutcome) {
        let CycleOutcome::Completed(report) = outcome else {
            return;
        };
        *self.retry_at.lock().unwrap_or_else(PoisonError::into_inner) = report.push.next_retry_at;
        if report.push.next_retry_at.is_some() {
            self.signals.reschedule.notify_one();
        }
    }

    fn next_deadline(&self, periodic: Instant) -> Instant {
        let retry_at = *self.retry_at.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(retry_at) = retry_at else {
            return periodic;
        };
        let delay = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        periodic.min(Instant::now() + delay)
    }

    async fn background_cycle(&self) {
        match self.coordinator.run_cycle().await {
            Ok(outcome) => self.note_outcome(&outcome),
            Err(error) => tracing::debug!("Background sync cycle failed: {error}"),
        }
    }
}

/// Runs cycles when woken, when a retry comes due, and every `interval`.
async fn run_scheduler(inner: Weak<Inner>, signals: Arc<Signals>, interval: Duration) {
    let mut periodic = Instant::now() + interval;
    loop {
        let deadline = match inner.upgrade() {
            Some(inner) => inner.next_deadline(periodic),
            None => return,
        };
        let run = tokio::select! {
            () = signals.wake.notified() => true,
            () = signals.reschedule.notified() => false,
            () = tokio::time::sleep_until(deadline) => true,
        };
        if !run {
            continue;
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let now = Instant::now();
        if now >= periodic {
            periodic = now + interval;
        }
        if inner.is_active() {
            inner.background_cycle().await;
        }
    }
}
