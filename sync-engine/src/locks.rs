//! Per-record mutual exclusion.
//!
//! Queue workers, local edits and conflict resolution all read-modify-write
//! the same entity rows. Each of them holds the record's lock for the whole
//! read-modify-write so a slow remote call cannot overwrite a newer local
//! edit with a stale copy.
//!
//! Lock order is remote key before entity key.

use dashmap::DashMap;
use std::sync::Arc;
use sync_types::{EntityId, EntityType, RemoteId};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async locks keyed by record.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    /// Create an empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a local entity.
    pub async fn entity(&self, id: EntityId) -> OwnedMutexGuard<()> {
        self.acquire(format!("entity:{}", id)).await
    }

    /// Lock a remote record.
    pub async fn remote(&self, entity_type: EntityType, remote_id: &RemoteId) -> OwnedMutexGuard<()> {
        self.acquire(format!("remote:{}:{}", entity_type, remote_id))
            .await
    }

    async fn acquire(&self, key: String) -> OwnedMutexGuard<()> {
        // Clone out of the map before awaiting; a DashMap shard guard must
        // not be held across the await.
        let lock = Arc::clone(self.locks.entry(key).or_default().value());
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
