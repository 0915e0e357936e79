//! Recently written remote ids, for echo suppression

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;

use crate::models::Table;

/// Bounded set of `table:remote_id` keys the engine itself just wrote.
///
/// Realtime `added` events for these keys are echoes of our own writes. The
/// oldest keys are evicted once the capacity is reached.
#[derive(Debug)]
pub struct TrackedIds {
    keys: Mutex<LruCache<String, ()>>,
}

impl TrackedIds {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            keys: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(table: Table, remote_id: &str) -> String {
        format!("{table}:{remote_id}")
    }

    pub fn insert(&self, table: Table, remote_id: &str) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(Self::key(table, remote_id), ());
    }

    /// Membership test; does not refresh the key's position.
    pub fn contains(&self, table: Table, remote_id: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&Self::key(table, remote_id))
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
