//! Fetching remote changes since the last checkpoint

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::identity::IdentityProvider;
use crate::models::Table;
use crate::remote::RemoteStore;

use super::events::{EventBus, SyncEvent};
use super::metadata::SyncMetadata;
use super::reconcile::Reconciler;

/// Result of one pull run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub received: usize,
    pub applied: usize,
    pub skipped: usize,
    /// Checkpoint to persist once the whole cycle has succeeded
    pub checkpoint: DateTime<Utc>,
}

/// Applies remote changes recorded after the stored checkpoint.
pub struct PullPipeline {
    remote: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityProvider>,
    reconciler: Arc<Reconciler>,
    metadata: Arc<SyncMetadata>,
    events: EventBus,
}

impl PullPipeline {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        reconciler: Arc<Reconciler>,
        metadata: Arc<SyncMetadata>,
        events: EventBus,
    ) -> Self {
        Self {
            remote,
            identity,
            reconciler,
            metadata,
            events,
        }
    }

    /// Pull and apply changes for the signed-in user.
    ///
    /// Returns `None` when nobody is signed in. The checkpoint is not persisted
    /// here; callers store [`PullReport::checkpoint`] after the cycle succeeds.
    pub async fn run(&self) -> Result<Option<PullReport>> {
        let Some(user) = self.identity.current_user().await? else {
            tracing::debug!("No signed-in user, skipping pull");
            return Ok(None);
        };

        let since = self.metadata.checkpoint().await?;
        let started = Utc::now().trunc_subsecs(3);
        let updates = self
            .remote
            .updates_since(since, &user.owner_scope())
            .await?;

        let mut applied = 0;
        let mut changed: BTreeMap<Table, usize> = BTreeMap::new();
        for update in &updates {
            if self.reconciler.apply_update(update).await?.changed_local() {
                applied += 1;
                *changed.entry(update.table).or_default() += 1;
            }
        }
        for (table, changes) in changed {
            self.events.emit(SyncEvent::TableChanged { table, changes });
        }

        let report = PullReport {
            received: updates.len(),
            applied,
            skipped: updates.len() - applied,
            checkpoint: started,
        };
        tracing::info!(
            since = %since,
            received = report.received,
            applied = report.applied,
            "Pulled remote changes"
        );
        Ok(Some(report))
    }
}
