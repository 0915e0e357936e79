//! Shared cross-platform state types.

use std::fmt;

use serde::Serialize;

use crate::engine::SyncStatusReport;

/// One-word sync state shown by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    Syncing,
    /// Local writes are waiting to be pushed
    Pending,
    Synced,
    Error,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&SyncStatusReport> for SyncState {
    fn from(report: &SyncStatusReport) -> Self {
        if !report.is_online {
            Self::Offline
        } else if report.sync_in_progress {
            Self::Syncing
        } else if report.failed_operations > 0 {
            Self::Error
        } else if report.pending_operations > 0 {
            Self::Pending
        } else {
            Self::Synced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> SyncStatusReport {
        SyncStatusReport {
            is_online: true,
            sync_in_progress: false,
            last_sync: None,
            pending_operations: 0,
            failed_operations: 0,
            errors: Vec::new(),
            listening: false,
            active_listeners: 0,
        }
    }

    #[test]
    fn offline_wins_over_everything() {
        let status = SyncStatusReport {
            is_online: false,
            sync_in_progress: true,
            failed_operations: 2,
            ..report()
        };
        assert_eq!(SyncState::from(&status), SyncState::Offline);
    }

    #[test]
    fn failures_outrank_pending_work() {
        let status = SyncStatusReport {
            pending_operations: 3,
            failed_operations: 1,
            ..report()
        };
        assert_eq!(SyncState::from(&status), SyncState::Error);
        assert_eq!(SyncState::from(&report()), SyncState::Synced);
    }

    #[test]
    fn pending_work_is_reported() {
        let status = SyncStatusReport {
            pending_operations: 1,
            ..report()
        };
        assert_eq!(SyncState::from(&status).to_string(), "pending");
    }
}
