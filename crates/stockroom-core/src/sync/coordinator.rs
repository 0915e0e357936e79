//! Single-flight pull-then-push sync cycles

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::Result;

use super::events::{EventBus, SyncEvent};
use super::metadata::SyncMetadata;
use super::pull::{PullPipeline, PullReport};
use super::push::{PushPipeline, PushReport};

/// Why a cycle request did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleSkip {
    Offline,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Skipped(CycleSkip),
}

/// Summary of a finished cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// `None` when nobody was signed in
    pub pull: Option<PullReport>,
    pub push: PushReport,
    pub finished_at: DateTime<Utc>,
}

/// Runs sync cycles, at most one at a time.
pub struct SyncCoordinator {
    pull: PullPipeline,
    push: PushPipeline,
    metadata: Arc<SyncMetadata>,
    events: EventBus,
    in_progress: AtomicBool,
    online: AtomicBool,
    idle: Notify,
    errors: Mutex<VecDeque<String>>,
    max_errors: usize,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

/// Clears the in-progress flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a SyncCoordinator);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.in_progress.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

impl SyncCoordinator {
    pub fn new(
        pull: PullPipeline,
        push: PushPipeline,
        metadata: Arc<SyncMetadata>,
        events: EventBus,
        max_errors: usize,
    ) -> Self {
        Self {
            pull,
            push,
            metadata,
            events,
            in_progress: AtomicBool::new(false),
            online: AtomicBool::new(true),
            idle: Notify::new(),
            errors: Mutex::new(VecDeque::new()),
            max_errors,
            last_sync: Mutex::new(None),
        }
    }

    /// Run one cycle unless offline or another cycle is in flight.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if !self.is_online() {
            tracing::debug!("Offline, skipping sync cycle");
            return Ok(CycleOutcome::Skipped(CycleSkip::Offline));
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync cycle already running");
            return Ok(CycleOutcome::Skipped(CycleSkip::AlreadyRunning));
        }
        let _guard = CycleGuard(self);

        tracing::info!("Sync cycle started");
        self.events.emit(SyncEvent::CycleStarted);
        match self.cycle().await {
            Ok(report) => {
                self.events.emit(SyncEvent::CycleFinished {
                    pulled: report.pull.as_ref().map_or(0, |pull| pull.applied),
                    pushed: report.push.pushed,
                    retried: report.push.retried,
                    failed: report.push.failed,
                });
                tracing::info!(
                    pulled = report.pull.as_ref().map_or(0, |pull| pull.applied),
                    pushed = report.push.pushed,
                    failed = report.push.failed,
                    "Sync cycle finished"
                );
                Ok(CycleOutcome::Completed(report))
            }
            Err(error) => {
                let message = error.to_string();
                self.record_error(message.clone());
                self.events.emit(SyncEvent::CycleFailed {
                    message: message.clone(),
                });
                tracing::error!("Sync cycle failed: {message}");
                Err(error)
            }
        }
    }

    /// Like [`run_cycle`](Self::run_cycle), but waits out an in-flight cycle and then runs a fresh one.
    pub async fn run_cycle_waiting(&self) -> Result<CycleOutcome> {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            match self.run_cycle().await? {
                CycleOutcome::Skipped(CycleSkip::AlreadyRunning) => idle.await,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Pull, then push, then persist bookkeeping.
    ///
    /// A failed pull aborts the cycle before anything is pushed, leaving the
    /// checkpoint and last-sync time where they were.
    async fn cycle(&self) -> Result<CycleReport> {
        let pull = self.pull.run().await.inspect_err(|error| {
            tracing::warn!("Pull failed, aborting cycle: {error}");
        })?;

        let push = self.push.run().await?;
        for message in &push.errors {
            self.record_error(message.clone());
        }

        // stored timestamps keep millisecond precision
        let finished_at = Utc::now().trunc_subsecs(3);
        if let Some(pull) = &pull {
            self.metadata.set_checkpoint(pull.checkpoint).await?;
        }
        self.metadata.set_last_sync(finished_at).await?;
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(finished_at);

        Ok(CycleReport {
            pull,
            push,
            finished_at,
        })
    }

    fn record_error(&self, message: String) {
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        errors.push_back(message);
        while errors.len() > self.max_errors {
            errors.pop_front();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Record connectivity; returns `true` when this call brought the engine back online.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        if was_online != online {
            tracing::info!(online, "Connectivity changed");
            self.events
                .emit(SyncEvent::ConnectivityChanged { online });
        }
        online && !was_online
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Recorded errors, oldest first.
    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_errors(&self) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed the last-sync time from persisted metadata.
    pub fn restore_last_sync(&self, at: Option<DateTime<Utc>>) {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::db::{LibSqlLocalStore, LocalStore};
    use crate::identity::StaticIdentity;
    use crate::models::{Document, OperationKind, Priority, Table};
    use crate::remote::{InMemoryRemoteStore, RemoteStore};
    use crate::sync::id_map::IdReconciler;
    use crate::sync::queue::OperationQueue;
    use crate::sync::reconcile::Reconciler;
    use crate::sync::tracked::TrackedIds;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        local: Arc<LibSqlLocalStore>,
        remote: Arc<InMemoryRemoteStore>,
        queue: Arc<OperationQueue>,
        metadata: Arc<SyncMetadata>,
        coordinator: Arc<SyncCoordinator>,
    }

    async fn setup(settings: SyncSettings) -> Fixture {
        let local = Arc::new(LibSqlLocalStore::open_in_memory(Duration::ZERO).await.unwrap());
        let remote = Arc::new(InMemoryRemoteStore::new());
        let queue = Arc::new(OperationQueue::new(local.clone()));
        let metadata = Arc::new(SyncMetadata::new(local.clone()));
        let tracked = Arc::new(TrackedIds::new(100));
        let id_map = Arc::new(IdReconciler::new());
        let events = EventBus::new();
        let reconciler = Arc::new(Reconciler::new(
            local.clone(),
            queue.clone(),
            tracked.clone(),
            id_map.clone(),
            settings.duplicate_window,
        ));
        let pull = PullPipeline::new(
            remote.clone(),
            Arc::new(StaticIdentity::signed_in("me")),
            reconciler,
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
        let coordinator = Arc::new(SyncCoordinator::new(
            pull,
            push,
            metadata.clone(),
            events,
            settings.max_recorded_errors,
        ));
        Fixture {
            local,
            remote,
            queue,
            metadata,
            coordinator,
        }
    }

    fn document(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cycle_pulls_pushes_and_persists_checkpoint() {
        let fx = setup(SyncSettings::default()).await;
        fx.remote
            .create(Table::Categories, &document(json!({ "name": "Tools", "owner_id": "me" })))
            .await
            .unwrap();
        let id = fx
            .local
            .insert("products", document(json!({ "name": "Widget", "owner_id": "me" })))
            .await
            .unwrap();
        fx.queue
            .enqueue(Table::Products, &id, OperationKind::Create, Document::new(), Priority::HIGH)
            .await
            .unwrap();

        let CycleOutcome::Completed(report) = fx.coordinator.run_cycle().await.unwrap() else {
            panic!("cycle did not run");
        };
        assert_eq!(report.pull.as_ref().map(|pull| pull.applied), Some(1));
        assert_eq!(report.push.pushed, 1);
        assert_eq!(fx.local.get_all("categories").await.unwrap().len(), 1);
        assert_eq!(
            fx.metadata.checkpoint().await.unwrap(),
            report.pull.unwrap().checkpoint
        );
        assert_eq!(fx.metadata.last_sync().await.unwrap(), Some(report.finished_at));
        assert_eq!(fx.coordinator.last_sync(), Some(report.finished_at));
        assert!(!fx.coordinator.is_syncing());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_cycles_are_skipped() {
        let fx = setup(SyncSettings::default()).await;
        assert!(!fx.coordinator.set_online(false));

        let outcome = fx.coordinator.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped(CycleSkip::Offline));
        assert_eq!(fx.remote.call_count("updates_since"), 0);

        assert!(fx.coordinator.set_online(true));
        assert!(!fx.coordinator.set_online(true));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_run_a_single_cycle() {
        let fx = setup(SyncSettings::default()).await;
        let (first, second) = tokio::join!(fx.coordinator.run_cycle(), fx.coordinator.run_cycle());

        let outcomes = [first.unwrap(), second.unwrap()];
        let completed = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, CycleOutcome::Completed(_)))
            .count();
        assert_eq!(completed, 1);
        assert!(outcomes.contains(&CycleOutcome::Skipped(CycleSkip::AlreadyRunning)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiting_request_runs_after_the_in_flight_cycle() {
        let fx = setup(SyncSettings::default()).await;
        let (first, second) = tokio::join!(
            fx.coordinator.run_cycle(),
            fx.coordinator.run_cycle_waiting()
        );
        assert!(matches!(first.unwrap(), CycleOutcome::Completed(_)));
        assert!(matches!(second.unwrap(), CycleOutcome::Completed(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_pull_aborts_the_cycle_before_pushing() {
        let fx = setup(SyncSettings::default()).await;
        let id = fx
            .local
            .insert("products", document(json!({ "name": "Widget", "owner_id": "me" })))
            .await
            .unwrap();
        fx.queue
            .enqueue(Table::Products, &id, OperationKind::Create, Document::new(), Priority::HIGH)
            .await
            .unwrap();
        fx.remote
            .fail_next(crate::remote::RemoteError::Unavailable("connection reset".into()));

        let error = fx.coordinator.run_cycle().await.unwrap_err();
        assert!(error.to_string().contains("connection reset"));

        assert_eq!(fx.remote.call_count("create"), 0);
        assert!(fx.remote.documents(Table::Products).is_empty());
        assert_eq!(fx.queue.list_pending().await.unwrap().len(), 1);

        let errors = fx.coordinator.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("connection reset"));
        assert!(!fx.coordinator.is_syncing());
        assert_eq!(fx.coordinator.last_sync(), None);
        assert_eq!(fx.metadata.last_sync().await.unwrap(), None);
        assert_eq!(
            fx.metadata.checkpoint().await.unwrap(),
            DateTime::<Utc>::UNIX_EPOCH
        );

        // the queued create goes out on the next healthy cycle
        let CycleOutcome::Completed(report) = fx.coordinator.run_cycle().await.unwrap() else {
            panic!("cycle did not run");
        };
        assert_eq!(report.push.pushed, 1);
        assert_eq!(fx.remote.documents(Table::Products).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recorded_errors_are_bounded() {
        let settings = SyncSettings {
            max_recorded_errors: 2,
            ..SyncSettings::default()
        };
        let fx = setup(settings).await;
        for attempt in 0..3 {
            fx.remote
                .fail_next(crate::remote::RemoteError::Unavailable(format!("attempt {attempt}")));
            fx.coordinator.run_cycle().await.unwrap_err();
        }

        let errors = fx.coordinator.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[1].contains("attempt 2"));
    }
}
