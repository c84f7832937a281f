//! Conflict review and resolution.
//!
//! Detection happens inside the orchestrator; this module owns what comes
//! after: listing pending conflicts, applying a resolution to the entity,
//! and queueing the follow-up outbound sync that carries the resolved data
//! to the remote CRM.
//!
//! A [`ResolutionPolicy`] is consulted once for every newly recorded or
//! re-detected conflict. [`ManualResolution`] leaves it for an operator;
//! [`LastWriterWins`] resolves it on the spot.

use crate::error::{EngineError, Result};
use crate::jobs::{job_key, OutboundJob};
use crate::locks::KeyedLocks;
use crate::metrics::EngineMetrics;
use crate::notify::{Notifier, SyncNotification};
use crate::queue::JobQueue;
use crate::store::{ConflictCounts, ConflictListing, ConflictQuery, Page, Paged, RecordStore};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync_core::{JobPriority, Resolution, COMPARABLE_FIELDS};
use sync_types::{
    now_millis, Conflict, ConflictId, Entity, EntityType, FieldChoice, FieldValue, SyncStatus,
    SYSTEM_ACTOR,
};

/// Decides whether a conflict is resolved without an operator.
pub trait ResolutionPolicy: Send + Sync + fmt::Debug {
    /// Policy name, for logs.
    fn name(&self) -> &'static str;

    /// Resolution to apply right away, or `None` to leave it pending.
    fn decide(&self, conflict: &Conflict) -> Option<Resolution>;
}

/// Leave every conflict for manual review.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualResolution;

impl ResolutionPolicy for ManualResolution {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn decide(&self, _conflict: &Conflict) -> Option<Resolution> {
        None
    }
}

/// Keep whichever side changed last. Ties go to the local side.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ResolutionPolicy for LastWriterWins {
    fn name(&self) -> &'static str {
        "last_writer_wins"
    }

    fn decide(&self, conflict: &Conflict) -> Option<Resolution> {
        let side = if conflict.local_timestamp >= conflict.remote_timestamp {
            FieldChoice::Local
        } else {
            FieldChoice::Remote
        };
        Some(Resolution::Auto(side))
    }
}

/// Conflict listing and resolution.
pub struct ConflictService {
    store: Arc<dyn RecordStore>,
    outbound: Arc<JobQueue<OutboundJob>>,
    policy: Box<dyn ResolutionPolicy>,
    notifier: Notifier,
    metrics: Arc<EngineMetrics>,
    locks: Arc<KeyedLocks>,
}

impl fmt::Debug for ConflictService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ConflictService {
    /// Create a service. Resolved entities are re-queued on `outbound`.
    pub fn new(
        store: Arc<dyn RecordStore>,
        outbound: Arc<JobQueue<OutboundJob>>,
        policy: Box<dyn ResolutionPolicy>,
        notifier: Notifier,
        metrics: Arc<EngineMetrics>,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        Self {
            store,
            outbound,
            policy,
            notifier,
            metrics,
            locks,
        }
    }

    /// Name of the active policy.
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Fetch a conflict.
    pub async fn get(&self, id: ConflictId) -> Result<Conflict> {
        self.store
            .get_conflict(id)
            .await?
            .ok_or_else(|| EngineError::not_found("conflict", id))
    }

    /// Pending conflicts, highest priority first, then most recent.
    pub async fn list_unresolved(
        &self,
        entity_type: Option<EntityType>,
        page: Page,
    ) -> Result<Paged<Conflict>> {
        let query = ConflictQuery {
            listing: ConflictListing::Unresolved,
            entity_type,
        };
        Ok(self.store.list_conflicts(&query, page).await?)
    }

    /// Resolved conflicts, most recently resolved first.
    pub async fn history(
        &self,
        entity_type: Option<EntityType>,
        page: Page,
    ) -> Result<Paged<Conflict>> {
        let query = ConflictQuery {
            listing: ConflictListing::History,
            entity_type,
        };
        Ok(self.store.list_conflicts(&query, page).await?)
    }

    /// Pending and resolved totals.
    pub async fn counts(&self) -> Result<ConflictCounts> {
        Ok(self.store.conflict_counts().await?)
    }

    /// Resolve a pending conflict and write the result back to its entity.
    ///
    /// The entity becomes `pending` and a high-priority outbound sync is
    /// queued to push the resolved data.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the conflict or its entity does not exist
    /// - `Resolution(AlreadyResolved)` on a second resolution
    /// - `Resolution(MissingFieldChoices)` for an incomplete merge
    pub async fn resolve(
        &self,
        id: ConflictId,
        resolution: Resolution,
        resolved_by: &str,
    ) -> Result<Entity> {
        let entity_id = self.get(id).await?.entity_id;
        let _guard = self.locks.entity(entity_id).await;

        // Re-read under the lock; a concurrent resolution may have won.
        let mut conflict = self.get(id).await?;
        let mut entity = self
            .store
            .get_entity(entity_id)
            .await?
            .ok_or_else(|| EngineError::not_found("entity", entity_id))?;

        let now = now_millis();
        let merged = sync_core::resolve(&mut conflict, &resolution, resolved_by, now)?;

        // Comparable fields missing from the resolved snapshot were unset on
        // the chosen side.
        let current = entity.snapshot();
        let mut edits = merged;
        for field in COMPARABLE_FIELDS {
            if current.contains_key(field) && !edits.contains_key(field) {
                edits.insert(field.to_string(), FieldValue::Null);
            }
        }
        entity.edit(&edits, now)?;
        entity.set_sync_status(SyncStatus::Pending);
        entity.envelope.last_synced_at = Some(conflict.remote_timestamp);
        entity.envelope.last_modified_remote = Some(conflict.remote_timestamp);

        self.store.put_conflict(&conflict).await?;
        self.store.put_entity(&entity).await?;

        self.metrics
            .conflicts_resolved
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Conflict {} on {} {} resolved as {} by {}",
            conflict.id,
            conflict.entity_type,
            entity.id,
            conflict.resolution_type,
            resolved_by
        );
        self.notifier.publish(SyncNotification::ConflictResolved {
            conflict_id: conflict.id,
            entity_id: entity.id,
            resolution_type: conflict.resolution_type,
        });

        self.outbound.add(
            job_key(entity.entity_type(), entity.id),
            OutboundJob {
                entity_type: entity.entity_type(),
                entity_id: entity.id,
            },
            JobPriority::High,
        )?;
        Ok(entity)
    }

    /// Give the policy a chance to resolve a freshly recorded conflict.
    ///
    /// Failures are logged; the conflict then stays pending.
    pub async fn apply_policy(&self, conflict: &Conflict) -> Option<Entity> {
        let resolution = self.policy.decide(conflict)?;
        match self.resolve(conflict.id, resolution, SYSTEM_ACTOR).await {
            Ok(entity) => Some(entity),
            Err(e) => {
                tracing::warn!(
                    "{} policy could not resolve conflict {}: {}",
                    self.policy.name(),
                    conflict.id,
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use sync_core::{JobOptions, ResolutionError};
    use sync_types::{Contact, EntityData, FieldChoices, RemoteId, RemoteRecord, ResolutionType};

    struct Fixture {
        store: Arc<MemoryStore>,
        outbound: Arc<JobQueue<OutboundJob>>,
        service: ConflictService,
    }

    fn fixture(policy: Box<dyn ResolutionPolicy>) -> Fixture {
        let metrics = Arc::new(EngineMetrics::default());
        let store = Arc::new(MemoryStore::new());
        let outbound = Arc::new(JobQueue::new(
            "outbound",
            JobOptions::default(),
            Arc::clone(&metrics),
        ));
        let service = ConflictService::new(
            store.clone(),
            Arc::clone(&outbound),
            policy,
            Notifier::new(16, Arc::clone(&metrics)),
            metrics,
            Arc::new(KeyedLocks::new()),
        );
        Fixture {
            store,
            outbound,
            service,
        }
    }

    /// Entity synced at 100, then edited locally (phone, first name) at 200
    /// while the remote changed first name and phone at 300.
    async fn seeded(fx: &Fixture) -> (Entity, Conflict) {
        let mut entity = Entity::new_local(
            EntityData::Contact(
                Contact::new("ada@example.com")
                    .with_name("Ada", "Lovelace")
                    .with_phone("111"),
            ),
            50,
        );
        entity.remote_id = Some(RemoteId::new("1001"));
        entity.envelope.last_synced_at = Some(100);
        entity.envelope.last_modified_local = 200;
        entity.set_sync_status(SyncStatus::Conflict);

        let remote = RemoteRecord {
            remote_id: RemoteId::new("1001"),
            data: EntityData::Contact(Contact::new("ada@example.com").with_name("Augusta", "Lovelace")),
            last_modified: 300,
        };
        let detection = sync_core::detect_conflict(&entity, &remote).unwrap();
        let conflict = sync_core::open_conflict(&entity, &remote, &detection, 400);

        fx.store.put_entity(&entity).await.unwrap();
        fx.store.put_conflict(&conflict).await.unwrap();
        (entity, conflict)
    }

    fn name_of(entity: &Entity) -> Option<String> {
        match &entity.data {
            EntityData::Contact(c) => c.first_name.clone(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn keep_remote_applies_remote_snapshot_and_requeues() {
        let fx = fixture(Box::new(ManualResolution));
        let (before, conflict) = seeded(&fx).await;

        let entity = fx
            .service
            .resolve(conflict.id, Resolution::KeepRemote, "ops")
            .await
            .unwrap();

        assert_eq!(name_of(&entity).as_deref(), Some("Augusta"));
        // Remote had no phone, so the local one is cleared.
        match &entity.data {
            EntityData::Contact(c) => assert!(c.phone.is_none()),
            _ => unreachable!(),
        }
        assert_eq!(entity.envelope.sync_status, SyncStatus::Pending);
        assert_eq!(entity.envelope.version, before.envelope.version + 1);
        assert_eq!(entity.envelope.last_synced_at, Some(300));
        assert_eq!(entity.envelope.last_modified_remote, Some(300));

        let stored = fx.service.get(conflict.id).await.unwrap();
        assert_eq!(stored.resolution_type, ResolutionType::KeepRemote);
        assert_eq!(stored.resolved_by.as_deref(), Some("ops"));
        assert_eq!(fx.outbound.counts().waiting, 1);
    }

    #[tokio::test]
    async fn merged_resolution_takes_chosen_fields() {
        let fx = fixture(Box::new(ManualResolution));
        let (_, conflict) = seeded(&fx).await;

        let mut choices = FieldChoices::new();
        choices.insert("first_name".into(), FieldChoice::Remote);
        choices.insert("phone".into(), FieldChoice::Local);
        let entity = fx
            .service
            .resolve(conflict.id, Resolution::Merged(choices), "ops")
            .await
            .unwrap();

        assert_eq!(name_of(&entity).as_deref(), Some("Augusta"));
        match &entity.data {
            EntityData::Contact(c) => assert_eq!(c.phone.as_deref(), Some("111")),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let fx = fixture(Box::new(ManualResolution));
        let (_, conflict) = seeded(&fx).await;

        fx.service
            .resolve(conflict.id, Resolution::KeepLocal, "ops")
            .await
            .unwrap();
        let err = fx
            .service
            .resolve(conflict.id, Resolution::KeepRemote, "ops")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Resolution(ResolutionError::AlreadyResolved(id)) if id == conflict.id
        ));
        assert_eq!(fx.outbound.counts().waiting, 1);
    }

    #[tokio::test]
    async fn unknown_conflict_is_not_found() {
        let fx = fixture(Box::new(ManualResolution));
        let err = fx
            .service
            .resolve(ConflictId::new(), Resolution::KeepLocal, "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "conflict", .. }));
    }

    #[tokio::test]
    async fn manual_policy_leaves_conflict_pending() {
        let fx = fixture(Box::new(ManualResolution));
        let (_, conflict) = seeded(&fx).await;

        assert!(fx.service.apply_policy(&conflict).await.is_none());
        assert!(fx.service.get(conflict.id).await.unwrap().is_pending());
        assert!(fx.outbound.is_idle());
    }

    #[tokio::test]
    async fn last_writer_wins_takes_the_newer_side() {
        let fx = fixture(Box::new(LastWriterWins));
        let (_, conflict) = seeded(&fx).await;

        let entity = fx.service.apply_policy(&conflict).await.unwrap();

        // Remote (300) is newer than local (200).
        assert_eq!(name_of(&entity).as_deref(), Some("Augusta"));
        let stored = fx.service.get(conflict.id).await.unwrap();
        assert_eq!(stored.resolution_type, ResolutionType::AutoResolved);
        assert_eq!(stored.resolved_by.as_deref(), Some(SYSTEM_ACTOR));

        let counts = fx.service.counts().await.unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.resolved, 1);
    }

    #[test]
    fn last_writer_wins_prefers_local_on_tie() {
        let entity = Entity::new_local(EntityData::Contact(Contact::new("a@x")), 10);
        let remote = RemoteRecord {
            remote_id: RemoteId::new("r"),
            data: EntityData::Contact(Contact::new("b@x")),
            last_modified: 10,
        };
        let detection = sync_core::Detection {
            conflicting_fields: vec!["email".into()],
            local_timestamp: 10,
            remote_timestamp: 10,
        };
        let conflict = sync_core::open_conflict(&entity, &remote, &detection, 20);
        assert_eq!(
            LastWriterWins.decide(&conflict),
            Some(Resolution::Auto(FieldChoice::Local))
        );
    }

    #[tokio::test]
    async fn listings_split_pending_from_history() {
        let fx = fixture(Box::new(ManualResolution));
        let (_, first) = seeded(&fx).await;
        let (_, second) = seeded(&fx).await;
        fx.service
            .resolve(first.id, Resolution::KeepLocal, "ops")
            .await
            .unwrap();

        let pending = fx
            .service
            .list_unresolved(None, Page::default())
            .await
            .unwrap();
        assert_eq!(
            pending.items.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![second.id]
        );
        let history = fx
            .service
            .history(Some(EntityType::Contact), Page::default())
            .await
            .unwrap();
        assert_eq!(history.items.len(), 1);
        assert_eq!(history.items[0].id, first.id);
    }
}
