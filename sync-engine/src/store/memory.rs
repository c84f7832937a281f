//! In-memory record store.

use super::{
    ConflictCounts, ConflictQuery, LogCounts, LogFilter, Page, Paged, RecordStore, StatusCounts,
};
use crate::error::StoreResult;
use async_trait::async_trait;
use dashmap::DashMap;
use sync_types::{
    Conflict, ConflictId, Entity, EntityId, EntityType, LogId, LogStatus, RemoteId, SyncLog,
    SyncStatus, Timestamp,
};

/// Record store backed by concurrent maps. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: DashMap<EntityId, Entity>,
    logs: DashMap<LogId, SyncLog>,
    conflicts: DashMap<ConflictId, Conflict>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities, including soft-deleted ones.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of stored attempt logs.
    pub fn log_count(&self) -> usize {
        self.logs.len()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put_entity(&self, entity: &Entity) -> StoreResult<()> {
        self.entities.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn get_entity(&self, id: EntityId) -> StoreResult<Option<Entity>> {
        Ok(self.entities.get(&id).map(|e| e.value().clone()))
    }

    async fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> StoreResult<Option<Entity>> {
        Ok(self
            .entities
            .iter()
            .find(|e| e.entity_type() == entity_type && e.remote_id.as_ref() == Some(remote_id))
            .map(|e| e.value().clone()))
    }

    async fn pending_entities(
        &self,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> StoreResult<Vec<Entity>> {
        let mut pending: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| {
                !e.is_deleted
                    && matches!(
                        e.envelope.sync_status,
                        SyncStatus::Pending | SyncStatus::Error
                    )
                    && entity_type.map_or(true, |t| t == e.entity_type())
            })
            .map(|e| e.value().clone())
            .collect();
        pending.sort_by_key(|e| e.envelope.last_modified_local);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn count_entities(&self, entity_type: EntityType) -> StoreResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for e in self.entities.iter() {
            if !e.is_deleted && e.entity_type() == entity_type {
                counts.add(e.envelope.sync_status, 1);
            }
        }
        Ok(counts)
    }

    async fn put_log(&self, log: &SyncLog) -> StoreResult<()> {
        self.logs.insert(log.id, log.clone());
        Ok(())
    }

    async fn get_log(&self, id: LogId) -> StoreResult<Option<SyncLog>> {
        Ok(self.logs.get(&id).map(|l| l.value().clone()))
    }

    async fn list_logs(&self, filter: &LogFilter, page: Page) -> StoreResult<Paged<SyncLog>> {
        let mut logs: Vec<SyncLog> = self
            .logs
            .iter()
            .filter(|l| filter.matches(l.value()))
            .map(|l| l.value().clone())
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(Paged::slice(logs, page))
    }

    async fn count_logs_since(&self, since: Timestamp) -> StoreResult<LogCounts> {
        let mut counts = LogCounts::default();
        for log in self.logs.iter() {
            if log.created_at >= since {
                counts.add(log.status, 1);
            }
        }
        Ok(counts)
    }

    async fn purge_logs(&self, status: LogStatus, before: Timestamp) -> StoreResult<u64> {
        let before_len = self.logs.len();
        self.logs.retain(|_, log| {
            let finished = log.completed_at.unwrap_or(log.created_at);
            !(log.status == status && finished < before)
        });
        Ok(before_len.saturating_sub(self.logs.len()) as u64)
    }

    async fn put_conflict(&self, conflict: &Conflict) -> StoreResult<()> {
        self.conflicts.insert(conflict.id, conflict.clone());
        Ok(())
    }

    async fn get_conflict(&self, id: ConflictId) -> StoreResult<Option<Conflict>> {
        Ok(self.conflicts.get(&id).map(|c| c.value().clone()))
    }

    async fn pending_conflict_for(&self, entity_id: EntityId) -> StoreResult<Option<Conflict>> {
        Ok(self
            .conflicts
            .iter()
            .find(|c| c.entity_id == entity_id && c.is_pending())
            .map(|c| c.value().clone()))
    }

    async fn list_conflicts(
        &self,
        query: &ConflictQuery,
        page: Page,
    ) -> StoreResult<Paged<Conflict>> {
        let mut conflicts: Vec<Conflict> = self
            .conflicts
            .iter()
            .filter(|c| query.matches(c.value()))
            .map(|c| c.value().clone())
            .collect();
        query.sort(&mut conflicts);
        Ok(Paged::slice(conflicts, page))
    }

    async fn conflict_counts(&self) -> StoreResult<ConflictCounts> {
        let mut counts = ConflictCounts::default();
        for c in self.conflicts.iter() {
            if c.is_pending() {
                counts.pending += 1;
                *counts.pending_by_type.entry(c.entity_type).or_insert(0) += 1;
            } else {
                counts.resolved += 1;
            }
        }
        Ok(counts)
    }
}
