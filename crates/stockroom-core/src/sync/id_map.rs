//! Local id to remote id resolution

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::models::Table;

/// Remembers which remote id each locally created record received.
///
/// Shared by the push pipeline and the realtime listener; every call completes
/// under one short lock.
#[derive(Debug, Default)]
pub struct IdReconciler {
    links: Mutex<HashMap<(Table, String), String>>,
}

impl IdReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, table: Table, local_id: &str, remote_id: &str) {
        if local_id == remote_id {
            return;
        }
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((table, local_id.to_string()), remote_id.to_string());
        tracing::debug!(table = %table, local_id, remote_id, "Linked local id");
    }

    pub fn resolve(&self, table: Table, local_id: &str) -> Option<String> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(table, local_id.to_string()))
            .cloned()
    }

    pub fn forget(&self, table: Table, local_id: &str) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(table, local_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
