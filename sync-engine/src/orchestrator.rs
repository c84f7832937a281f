//! Sync orchestration.
//!
//! One call synchronizes one record in one direction:
//!
//! - [`SyncOrchestrator::sync_to_remote`]: create, update or archive the
//!   remote copy of a local entity.
//! - [`SyncOrchestrator::sync_from_remote`]: fetch a remote record and
//!   apply it locally, or soft-delete the local copy on a delete event.
//!
//! Every attempt is recorded as a [`SyncLog`] that is opened before any
//! remote call and finalized before the call returns. Conflicts are checked
//! against freshly read state on each attempt, never trusted from enqueue
//! time, since inbound and outbound jobs for the same record can interleave.
//!
//! ## Outcomes
//!
//! | Outcome                | Entity status | Log status |
//! |------------------------|---------------|------------|
//! | written                | `synced`      | `success`  |
//! | conflict recorded      | `conflict`    | `failed`   |
//! | error                  | `error`       | `failed`   |

use crate::conflicts::ConflictService;
use crate::error::{EngineError, Result};
use crate::jobs::InboundEvent;
use crate::locks::KeyedLocks;
use crate::metrics::EngineMetrics;
use crate::notify::{Notifier, SyncNotification};
use crate::store::RecordStore;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync_client::{CrmClient, RemoteError};
use sync_core::{detect_conflict, open_conflict, refresh_conflict, Detection};
use sync_types::{
    now_millis, Conflict, Direction, Entity, EntityId, EntityType, RemoteId, RemoteRecord,
    SyncAction, SyncLog, SyncStatus,
};

/// Error message recorded on attempts stopped by a conflict.
pub const CONFLICT_DETECTED: &str = "Conflict detected";

/// Result of one orchestration attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Written through; the entity as stored afterwards.
    Synced(Entity),
    /// A delete was propagated. `entity_id` is `None` when a remote delete
    /// had no local counterpart.
    Deleted {
        /// Local entity, if one existed.
        entity_id: Option<EntityId>,
    },
    /// Stopped on a conflict; the pending conflict record.
    Conflict(Conflict),
}

impl SyncOutcome {
    /// True if the attempt stopped on a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Runs sync attempts against the store and the remote CRM.
pub struct SyncOrchestrator {
    store: Arc<dyn RecordStore>,
    client: Arc<CrmClient>,
    conflicts: Arc<ConflictService>,
    notifier: Notifier,
    metrics: Arc<EngineMetrics>,
    locks: Arc<KeyedLocks>,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("client", &self.client)
            .field("conflicts", &self.conflicts)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        store: Arc<dyn RecordStore>,
        client: Arc<CrmClient>,
        conflicts: Arc<ConflictService>,
        notifier: Notifier,
        metrics: Arc<EngineMetrics>,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        Self {
            store,
            client,
            conflicts,
            notifier,
            metrics,
            locks,
        }
    }

    /// Push a local entity to the remote CRM.
    ///
    /// Deleted entities are archived remotely, entities without a remote id
    /// are created, all others are updated after a conflict check.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entity does not exist. Any other failure is logged,
    /// the entity is marked `error`, and the error is returned.
    pub async fn sync_to_remote(&self, entity_id: EntityId) -> Result<SyncOutcome> {
        let outcome = {
            let _guard = self.locks.entity(entity_id).await;
            let entity = self
                .store
                .get_entity(entity_id)
                .await?
                .ok_or_else(|| EngineError::not_found("entity", entity_id))?;

            let action = if entity.is_deleted {
                SyncAction::Delete
            } else if entity.remote_id.is_none() {
                SyncAction::Create
            } else {
                SyncAction::Update
            };
            let mut log = SyncLog::open(entity.entity_type(), Direction::ToRemote, action, now_millis())
                .with_entity(entity.id)
                .with_remote_id(entity.remote_id.clone())
                .with_payload(entity.snapshot());
            self.store.put_log(&log).await?;

            match self.push(entity.clone(), &mut log).await {
                Ok(outcome) => outcome,
                Err(err) => return Err(self.fail_attempt(Some(entity), &mut log, err).await),
            }
        };

        self.after_attempt(&outcome).await;
        Ok(outcome)
    }

    async fn push(&self, mut entity: Entity, log: &mut SyncLog) -> Result<SyncOutcome> {
        let entity_type = entity.entity_type();
        match (log.action, entity.remote_id.clone()) {
            (SyncAction::Delete, remote_id) => {
                if let Some(remote_id) = remote_id {
                    match self.client.archive(entity_type, &remote_id).await {
                        Ok(()) => {}
                        Err(RemoteError::NotFound(_)) => {
                            tracing::debug!("{} {} already gone remotely", entity_type, remote_id)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                let now = now_millis();
                entity.record_synced(Direction::ToRemote, None, now);
                self.store.put_entity(&entity).await?;
                log.succeed(None, now)?;
                self.store.put_log(log).await?;
                self.completed(log);
                Ok(SyncOutcome::Deleted {
                    entity_id: Some(entity.id),
                })
            }
            (SyncAction::Create, _) | (_, None) => {
                let record = self.client.create(&entity.data).await?;
                entity.remote_id = Some(record.remote_id.clone());
                log.remote_id = Some(record.remote_id.clone());
                self.write_through(entity, &record, log).await
            }
            (SyncAction::Update, Some(remote_id)) => {
                let current = self.client.get(entity_type, &remote_id).await?;
                if let Some(detection) = detect_conflict(&entity, &current) {
                    return self.record_conflict(entity, &current, &detection, log).await;
                }
                let record = self.client.update(&remote_id, &entity.data).await?;
                self.write_through(entity, &record, log).await
            }
        }
    }

    async fn write_through(
        &self,
        mut entity: Entity,
        record: &RemoteRecord,
        log: &mut SyncLog,
    ) -> Result<SyncOutcome> {
        let now = now_millis();
        entity.record_synced(Direction::ToRemote, Some(record.last_modified), now);
        self.store.put_entity(&entity).await?;
        log.succeed(Some(record.snapshot()), now)?;
        self.store.put_log(log).await?;
        self.completed(log);
        Ok(SyncOutcome::Synced(entity))
    }

    /// Pull a remote record into the local store.
    ///
    /// On `Delete` the local copy (if any) is soft-deleted without a conflict
    /// check and the remote is not contacted.
    pub async fn sync_from_remote(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
        event: InboundEvent,
    ) -> Result<SyncOutcome> {
        let outcome = {
            let _guard = self.locks.remote(entity_type, remote_id).await;
            if event == InboundEvent::Delete {
                self.delete_from_remote(entity_type, remote_id).await?
            } else {
                let mut log = SyncLog::open(
                    entity_type,
                    Direction::FromRemote,
                    SyncAction::Update,
                    now_millis(),
                )
                .with_remote_id(Some(remote_id.clone()));
                self.store.put_log(&log).await?;

                match self.client.get(entity_type, remote_id).await {
                    Ok(record) => self.apply_remote(&record, &mut log).await?,
                    Err(e) => return Err(self.fail_attempt(None, &mut log, e.into()).await),
                }
            }
        };

        self.after_attempt(&outcome).await;
        Ok(outcome)
    }

    /// Apply a record that was already fetched, as a batch poll does.
    pub async fn sync_remote_record(&self, record: &RemoteRecord) -> Result<SyncOutcome> {
        let entity_type = record.data.entity_type();
        let outcome = {
            let _guard = self.locks.remote(entity_type, &record.remote_id).await;
            let mut log = SyncLog::open(
                entity_type,
                Direction::FromRemote,
                SyncAction::Update,
                now_millis(),
            )
            .with_remote_id(Some(record.remote_id.clone()));
            self.store.put_log(&log).await?;
            self.apply_remote(record, &mut log).await?
        };

        self.after_attempt(&outcome).await;
        Ok(outcome)
    }

    /// Caller holds the remote lock.
    async fn apply_remote(&self, record: &RemoteRecord, log: &mut SyncLog) -> Result<SyncOutcome> {
        let entity_type = record.data.entity_type();
        let found = match self
            .store
            .find_by_remote_id(entity_type, &record.remote_id)
            .await
        {
            Ok(found) => found,
            Err(e) => return Err(self.fail_attempt(None, log, e.into()).await),
        };

        let Some(found) = found else {
            return match self.create_from_remote(record, log).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => Err(self.fail_attempt(None, log, e).await),
            };
        };

        let _guard = self.locks.entity(found.id).await;
        let entity = match self.store.get_entity(found.id).await {
            Ok(current) => current.unwrap_or(found),
            Err(e) => return Err(self.fail_attempt(None, log, e.into()).await),
        };
        log.entity_id = Some(entity.id);

        match self.merge_remote(entity.clone(), record, log).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.fail_attempt(Some(entity), log, e).await),
        }
    }

    async fn create_from_remote(
        &self,
        record: &RemoteRecord,
        log: &mut SyncLog,
    ) -> Result<SyncOutcome> {
        let now = now_millis();
        let entity = Entity::from_remote(record, now);
        log.action = SyncAction::Create;
        log.entity_id = Some(entity.id);

        self.store.put_entity(&entity).await?;
        log.succeed(Some(record.snapshot()), now)?;
        self.store.put_log(log).await?;
        tracing::info!(
            "Created {} {} from remote {}",
            entity.entity_type(),
            entity.id,
            record.remote_id
        );
        self.completed(log);
        Ok(SyncOutcome::Synced(entity))
    }

    async fn merge_remote(
        &self,
        mut entity: Entity,
        record: &RemoteRecord,
        log: &mut SyncLog,
    ) -> Result<SyncOutcome> {
        if let Some(detection) = detect_conflict(&entity, record) {
            return self.record_conflict(entity, record, &detection, log).await;
        }

        let now = now_millis();
        entity.adopt_remote(record, now);
        self.store.put_entity(&entity).await?;
        log.succeed(Some(record.snapshot()), now)?;
        self.store.put_log(log).await?;
        self.completed(log);
        Ok(SyncOutcome::Synced(entity))
    }

    /// Caller holds the remote lock.
    async fn delete_from_remote(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Result<SyncOutcome> {
        let mut log = SyncLog::open(
            entity_type,
            Direction::FromRemote,
            SyncAction::Delete,
            now_millis(),
        )
        .with_remote_id(Some(remote_id.clone()));
        self.store.put_log(&log).await?;

        let found = match self.store.find_by_remote_id(entity_type, remote_id).await {
            Ok(found) => found,
            Err(e) => return Err(self.fail_attempt(None, &mut log, e.into()).await),
        };

        let entity_id = match found {
            Some(found) => {
                let _guard = self.locks.entity(found.id).await;
                let mut entity = match self.store.get_entity(found.id).await {
                    Ok(current) => current.unwrap_or(found),
                    Err(e) => return Err(self.fail_attempt(None, &mut log, e.into()).await),
                };
                log.entity_id = Some(entity.id);

                let now = now_millis();
                entity.mark_deleted(now);
                entity.record_synced(Direction::FromRemote, None, now);
                if let Err(e) = self.store.put_entity(&entity).await {
                    return Err(self.fail_attempt(None, &mut log, e.into()).await);
                }
                tracing::info!("Deleted {} {} after remote delete", entity_type, entity.id);
                Some(entity.id)
            }
            None => {
                tracing::debug!(
                    "Remote delete of {} {} has no local copy",
                    entity_type,
                    remote_id
                );
                None
            }
        };

        log.succeed(None, now_millis())?;
        self.store.put_log(&log).await?;
        self.completed(&log);
        Ok(SyncOutcome::Deleted { entity_id })
    }

    /// Record a conflict and stop the attempt. The entity's data is left
    /// untouched; only its status changes.
    async fn record_conflict(
        &self,
        mut entity: Entity,
        remote: &RemoteRecord,
        detection: &Detection,
        log: &mut SyncLog,
    ) -> Result<SyncOutcome> {
        let now = now_millis();
        let conflict = match self.store.pending_conflict_for(entity.id).await? {
            Some(mut existing) => {
                refresh_conflict(&mut existing, &entity, remote, detection, now)?;
                existing
            }
            None => open_conflict(&entity, remote, detection, now),
        };
        self.store.put_conflict(&conflict).await?;

        entity.set_sync_status(SyncStatus::Conflict);
        self.store.put_entity(&entity).await?;

        log.fail(
            CONFLICT_DETECTED,
            Some(format!(
                "conflicting fields: {}",
                conflict.conflicting_fields.join(", ")
            )),
            now,
        )?;
        self.store.put_log(log).await?;

        self.metrics
            .conflicts_detected
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "Conflict {} on {} {} ({}): {:?}",
            conflict.id,
            entity.entity_type(),
            entity.id,
            log.direction,
            conflict.conflicting_fields
        );
        self.notifier.publish(SyncNotification::SyncCompleted {
            entity_type: log.entity_type,
            entity_id: log.entity_id,
            remote_id: log.remote_id.clone(),
            direction: log.direction,
            success: false,
            conflict: true,
        });
        Ok(SyncOutcome::Conflict(conflict))
    }

    fn completed(&self, log: &SyncLog) {
        self.metrics.syncs_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Synced {} {} {} ({}, {}ms)",
            log.entity_type,
            log.entity_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".into()),
            log.direction,
            log.action.as_str(),
            log.duration_ms.unwrap_or(0)
        );
        self.notifier.publish(SyncNotification::SyncCompleted {
            entity_type: log.entity_type,
            entity_id: log.entity_id,
            remote_id: log.remote_id.clone(),
            direction: log.direction,
            success: true,
            conflict: false,
        });
    }

    /// Finalize a failed attempt and hand the error back.
    ///
    /// The log is written failed and the entity (if loaded) marked `error`.
    /// Store failures while doing so are logged, not returned, so the
    /// original error is what the caller sees.
    async fn fail_attempt(
        &self,
        entity: Option<Entity>,
        log: &mut SyncLog,
        err: EngineError,
    ) -> EngineError {
        let now = now_millis();
        if log.fail(err.to_string(), Some(format!("{:?}", err)), now).is_ok() {
            if let Err(e) = self.store.put_log(log).await {
                tracing::error!("Could not record failed sync log {}: {}", log.id, e);
            }
        }
        if let Some(mut entity) = entity {
            entity.set_sync_status(SyncStatus::Error);
            if let Err(e) = self.store.put_entity(&entity).await {
                tracing::error!("Could not mark {} as errored: {}", entity.id, e);
            }
        }

        self.metrics.syncs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            "Sync of {} {} {} failed: {}",
            log.entity_type,
            log.entity_id
                .map(|id| id.to_string())
                .or_else(|| log.remote_id.as_ref().map(|r| r.to_string()))
                .unwrap_or_else(|| "-".into()),
            log.direction,
            err
        );
        self.notifier.publish(SyncNotification::SyncErrored {
            entity_type: log.entity_type,
            entity_id: log.entity_id,
            remote_id: log.remote_id.clone(),
            direction: log.direction,
            error: err.to_string(),
            kind: err.kind(),
        });
        err
    }

    /// Runs with no locks held.
    async fn after_attempt(&self, outcome: &SyncOutcome) {
        if let SyncOutcome::Conflict(conflict) = outcome {
            self.conflicts.apply_policy(conflict).await;
        }
    }
}
