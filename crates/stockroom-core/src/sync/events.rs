//! Structured engine events

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::Table;

const EVENT_CAPACITY: usize = 256;

/// Something observable happened inside the engine.
///
/// Consumers (UI refresh, CLI `watch`) subscribe through [`EventBus::subscribe`];
/// logging is independent of this channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    CycleStarted,
    CycleFinished {
        pulled: usize,
        pushed: usize,
        retried: usize,
        failed: usize,
    },
    CycleFailed {
        message: String,
    },
    OperationSynced {
        table: Table,
        record_id: String,
        remote_id: Option<String>,
    },
    OperationFailed {
        table: Table,
        record_id: String,
        retry_count: u32,
        message: String,
        dead_lettered: bool,
    },
    /// Local rows of `table` changed because of remote data
    TableChanged {
        table: Table,
        changes: usize,
    },
    ListenerStopped {
        table: Table,
        message: String,
    },
    ConnectivityChanged {
        online: bool,
    },
}

/// Broadcast channel for [`SyncEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped silently when nobody is listening.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}
