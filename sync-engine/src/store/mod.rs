//! Record store for crm-sync-engine.
//!
//! Holds entities, append-only attempt logs and conflict records. Two
//! backends implement [`RecordStore`]: [`MemoryStore`] (concurrent maps) and
//! [`SqliteStore`] (documents plus indexed columns).

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreResult;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use sync_types::{
    Conflict, ConflictId, Direction, Entity, EntityId, EntityType, LogId, LogStatus, RemoteId,
    SyncLog, SyncStatus, Timestamp,
};

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Page number, starting at 1.
    pub page: u32,
    /// Items per page.
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 50 }
    }
}

impl Page {
    /// Build a page request; zero values are raised to 1.
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.max(1),
        }
    }

    /// Items to skip.
    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.limit as usize
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paged<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Page number.
    pub page: u32,
    /// Page size.
    pub limit: u32,
    /// Total matching items.
    pub total: u64,
    /// Total pages.
    pub pages: u64,
}

impl<T> Paged<T> {
    /// Wrap a page of items.
    pub fn new(items: Vec<T>, page: Page, total: u64) -> Self {
        let limit = u64::from(page.limit.max(1));
        Self {
            items,
            page: page.page,
            limit: page.limit,
            total,
            pages: total.div_ceil(limit),
        }
    }

    /// Page through an already filtered and sorted list.
    pub fn slice(all: Vec<T>, page: Page) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(page.offset())
            .take(page.limit as usize)
            .collect();
        Self::new(items, page, total)
    }
}

/// Entity counts by sync status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// In sync.
    pub synced: u64,
    /// Awaiting an outbound sync.
    pub pending: u64,
    /// Blocked on an unresolved conflict.
    pub conflict: u64,
    /// Last sync failed.
    pub error: u64,
}

impl StatusCounts {
    /// Add `n` to the bucket for `status`.
    pub fn add(&mut self, status: SyncStatus, n: u64) {
        match status {
            SyncStatus::Synced => self.synced += n,
            SyncStatus::Pending => self.pending += n,
            SyncStatus::Conflict => self.conflict += n,
            SyncStatus::Error => self.error += n,
        }
    }

    /// Sum of all buckets.
    pub fn total(&self) -> u64 {
        self.synced + self.pending + self.conflict + self.error
    }
}

/// Attempt log counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogCounts {
    /// Still running.
    pub pending: u64,
    /// Finished successfully.
    pub success: u64,
    /// Finished with an error.
    pub failed: u64,
    /// Failed and re-queued by an operator.
    pub retrying: u64,
}

impl LogCounts {
    /// Add `n` to the bucket for `status`.
    pub fn add(&mut self, status: LogStatus, n: u64) {
        match status {
            LogStatus::Pending => self.pending += n,
            LogStatus::Success => self.success += n,
            LogStatus::Failed => self.failed += n,
            LogStatus::Retrying => self.retrying += n,
        }
    }
}

/// Attempt log query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Only this entity type.
    pub entity_type: Option<EntityType>,
    /// Only this status.
    pub status: Option<LogStatus>,
    /// Only this direction.
    pub direction: Option<Direction>,
}

impl LogFilter {
    /// Whether `log` passes the filter.
    pub fn matches(&self, log: &SyncLog) -> bool {
        self.entity_type.map_or(true, |t| t == log.entity_type)
            && self.status.map_or(true, |s| s == log.status)
            && self.direction.map_or(true, |d| d == log.direction)
    }
}

/// Which conflicts to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictListing {
    /// Pending conflicts, highest priority then newest first.
    Unresolved,
    /// Resolved conflicts, most recently resolved first.
    History,
}

/// Conflict query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictQuery {
    /// Pending or resolved.
    pub listing: ConflictListing,
    /// Only this entity type.
    pub entity_type: Option<EntityType>,
}

impl ConflictQuery {
    /// Whether `conflict` belongs in this listing.
    pub fn matches(&self, conflict: &Conflict) -> bool {
        let state = match self.listing {
            ConflictListing::Unresolved => conflict.is_pending(),
            ConflictListing::History => !conflict.is_pending(),
        };
        state && self.entity_type.map_or(true, |t| t == conflict.entity_type)
    }

    /// Sort a list of matching conflicts into listing order.
    pub fn sort(&self, conflicts: &mut [Conflict]) {
        match self.listing {
            ConflictListing::Unresolved => conflicts.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(b.detected_at.cmp(&a.detected_at))
            }),
            ConflictListing::History => {
                conflicts.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at))
            }
        }
    }
}

/// Conflict totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictCounts {
    /// Unresolved conflicts.
    pub pending: u64,
    /// Resolved conflicts.
    pub resolved: u64,
    /// Unresolved conflicts per entity type.
    pub pending_by_type: BTreeMap<EntityType, u64>,
}

/// Trait for record store backends.
///
/// Writes are upserts keyed by id. Backends do not coordinate writes to
/// the same entity; the orchestrator serializes those.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace an entity.
    async fn put_entity(&self, entity: &Entity) -> StoreResult<()>;

    /// Get an entity by local id, including soft-deleted ones.
    async fn get_entity(&self, id: EntityId) -> StoreResult<Option<Entity>>;

    /// Find the entity linked to a remote record.
    async fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> StoreResult<Option<Entity>>;

    /// Live entities in `pending` or `error`, oldest local change first.
    async fn pending_entities(
        &self,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> StoreResult<Vec<Entity>>;

    /// Live entity counts by sync status.
    async fn count_entities(&self, entity_type: EntityType) -> StoreResult<StatusCounts>;

    /// Insert or replace an attempt log.
    async fn put_log(&self, log: &SyncLog) -> StoreResult<()>;

    /// Get an attempt log.
    async fn get_log(&self, id: LogId) -> StoreResult<Option<SyncLog>>;

    /// Attempt logs matching `filter`, newest first.
    async fn list_logs(&self, filter: &LogFilter, page: Page) -> StoreResult<Paged<SyncLog>>;

    /// Attempt log counts by status for logs created at or after `since`.
    async fn count_logs_since(&self, since: Timestamp) -> StoreResult<LogCounts>;

    /// Delete logs in `status` that finished (or, if unfinished, started)
    /// before `before`. Returns the number deleted.
    async fn purge_logs(&self, status: LogStatus, before: Timestamp) -> StoreResult<u64>;

    /// Insert or replace a conflict record.
    async fn put_conflict(&self, conflict: &Conflict) -> StoreResult<()>;

    /// Get a conflict record.
    async fn get_conflict(&self, id: ConflictId) -> StoreResult<Option<Conflict>>;

    /// The unresolved conflict for an entity, if any.
    async fn pending_conflict_for(&self, entity_id: EntityId) -> StoreResult<Option<Conflict>>;

    /// Conflicts matching `query`, in listing order.
    async fn list_conflicts(
        &self,
        query: &ConflictQuery,
        page: Page,
    ) -> StoreResult<Paged<Conflict>>;

    /// Conflict totals.
    async fn conflict_counts(&self) -> StoreResult<ConflictCounts>;
}
