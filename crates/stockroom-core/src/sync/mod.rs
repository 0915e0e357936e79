//! Synchronization machinery
//!
//! Local writes land in the [`OperationQueue`] and are drained by the
//! [`PushPipeline`]; remote writes arrive through the [`PullPipeline`] (catch-up)
//! and the [`RealtimeListener`] (live), both applied by the [`Reconciler`].
//! The [`SyncCoordinator`] sequences pull and push into single-flight cycles.

mod coordinator;
mod events;
mod id_map;
mod listener;
mod metadata;
mod pull;
mod push;
mod queue;
mod reconcile;
mod tracked;

pub use coordinator::{CycleOutcome, CycleReport, CycleSkip, SyncCoordinator};
pub use events::{EventBus, SyncEvent};
pub use id_map::IdReconciler;
pub use listener::RealtimeListener;
pub use metadata::{SyncMetadata, METADATA_TABLE};
pub use pull::{PullPipeline, PullReport};
pub use push::{PushPipeline, PushReport};
pub use queue::{OperationQueue, QueueCounts, QUEUE_TABLE};
pub use reconcile::{Applied, Reconciler, SkipReason};
pub use tracked::TrackedIds;
