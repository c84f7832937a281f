//! Engine composition root.
//!
//! [`SyncEngine`] builds every service once (rate-limited client, queues,
//! orchestrator, conflict service, notifier) and hands shared references to
//! the queue workers. It is also the entry point for callers: enqueueing
//! syncs, local edits, conflict resolution and operator views.
//!
//! ```ignore
//! let store = SyncEngine::open_store(&config.storage).await?;
//! let engine = Arc::new(SyncEngine::new(config, store, remote)?);
//! engine.start();
//!
//! let contact = engine.create_local(data).await?;
//! ```

use crate::cleanup::spawn_cleanup_task;
use crate::config::{AutoResolve, Config, StorageBackend, StorageConfig};
use crate::conflicts::{ConflictService, LastWriterWins, ManualResolution, ResolutionPolicy};
use crate::error::{EngineError, Result};
use crate::jobs::{
    job_key, BatchPollHandler, BatchPollJob, InboundEvent, InboundHandler, InboundJob,
    OutboundHandler, OutboundJob, PollTarget, QueueStats, SyncQueues,
};
use crate::locks::KeyedLocks;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::notify::{Notifier, SyncNotification, DEFAULT_CAPACITY};
use crate::orchestrator::SyncOrchestrator;
use crate::store::{
    ConflictCounts, LogCounts, LogFilter, MemoryStore, Page, Paged, RecordStore, SqliteStore,
    StatusCounts,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sync_client::{CrmClient, RateLimitStatus, RateLimiter, RemoteCrm};
use sync_core::{JobId, JobPriority, Resolution};
use sync_types::{
    now_millis, Conflict, ConflictId, Direction, Entity, EntityData, EntityId, EntityType,
    FieldChoices, Fields, LogId, LogStatus, RemoteId, ResolutionType, SyncAction, SyncLog,
    SyncStatus,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const STATS_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Aggregate sync health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Live entities per type, by sync status.
    pub entities: BTreeMap<EntityType, StatusCounts>,
    /// Attempt logs created in the last 24 hours, by status.
    pub logs_last_24h: LogCounts,
}

/// The sync engine.
pub struct SyncEngine {
    config: Config,
    store: Arc<dyn RecordStore>,
    client: Arc<CrmClient>,
    queues: SyncQueues,
    orchestrator: Arc<SyncOrchestrator>,
    conflicts: Arc<ConflictService>,
    locks: Arc<KeyedLocks>,
    notifier: Notifier,
    metrics: Arc<EngineMetrics>,
    started: AtomicBool,
    started_at: Instant,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("queues", &self.queues)
            .field("conflicts", &self.conflicts)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Build an engine. Nothing runs until [`SyncEngine::start`].
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration does not validate.
    pub fn new(
        config: Config,
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteCrm>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::default());
        let notifier = Notifier::new(DEFAULT_CAPACITY, Arc::clone(&metrics));
        let locks = Arc::new(KeyedLocks::new());
        let client = Arc::new(CrmClient::new(
            remote,
            RateLimiter::new(config.rate_limit.max_tokens, config.rate_limit.refill_window()),
            config.retry.policy(),
        ));
        let queues = SyncQueues::new(config.queues.job_options(), Arc::clone(&metrics));

        let policy: Box<dyn ResolutionPolicy> = match config.conflicts.auto_resolve {
            AutoResolve::Manual => Box::new(ManualResolution),
            AutoResolve::LastWriterWins => Box::new(LastWriterWins),
        };
        let conflicts = Arc::new(ConflictService::new(
            Arc::clone(&store),
            Arc::clone(&queues.outbound),
            policy,
            notifier.clone(),
            Arc::clone(&metrics),
            Arc::clone(&locks),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&client),
            Arc::clone(&conflicts),
            notifier.clone(),
            Arc::clone(&metrics),
            Arc::clone(&locks),
        ));

        Ok(Self {
            config,
            store,
            client,
            queues,
            orchestrator,
            conflicts,
            locks,
            notifier,
            metrics,
            started: AtomicBool::new(false),
            started_at: Instant::now(),
            cleanup: Mutex::new(None),
        })
    }

    /// Open the configured record store.
    pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn RecordStore>> {
        let store: Arc<dyn RecordStore> = match config.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Sqlite if config.database.as_os_str() == ":memory:" => {
                Arc::new(SqliteStore::in_memory().await?)
            }
            StorageBackend::Sqlite => Arc::new(SqliteStore::new(&config.database).await?),
        };
        tracing::info!(
            "Record store opened ({:?}, {})",
            config.backend,
            config.database.display()
        );
        Ok(store)
    }

    /// Spawn queue workers, stall reapers and the cleanup task.
    ///
    /// Must be called inside a tokio runtime. Later calls do nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let q = &self.config.queues;
        let stalled_check = q.stalled_check_interval();

        self.queues.outbound.start(
            Arc::new(OutboundHandler::new(
                Arc::clone(&self.orchestrator),
                self.notifier.clone(),
            )),
            q.outbound_concurrency,
            stalled_check,
        );
        self.queues.inbound.start(
            Arc::new(InboundHandler::new(
                Arc::clone(&self.orchestrator),
                self.notifier.clone(),
            )),
            q.inbound_concurrency,
            stalled_check,
        );
        self.queues.batch_poll.start(
            Arc::new(BatchPollHandler::new(
                Arc::clone(&self.orchestrator),
                Arc::clone(&self.client),
                self.notifier.clone(),
                self.config.polling.page_size,
                self.config.polling.entity_types.clone(),
            )),
            q.batch_concurrency,
            stalled_check,
        );

        let handle = spawn_cleanup_task(
            Arc::clone(&self.store),
            self.queues.clone(),
            Arc::clone(&self.locks),
            self.config.cleanup.clone(),
        );
        *self.cleanup.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        tracing::info!(
            "Sync engine started (conflict policy: {})",
            self.conflicts.policy_name()
        );
    }

    /// Stop workers and background tasks. Queued jobs are not run.
    pub fn shutdown(&self) {
        self.queues.shutdown();
        if let Some(handle) = self.cleanup.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        tracing::info!("Sync engine stopped");
    }

    // ---- enqueue ----

    /// Queue an outbound sync.
    pub fn enqueue_outbound(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        priority: JobPriority,
    ) -> Result<JobId> {
        let key = job_key(entity_type, entity_id);
        self.enqueue_outbound_with_key(key, entity_type, entity_id, priority)
    }

    /// Queue an outbound sync under an explicit key.
    ///
    /// # Errors
    ///
    /// `Queue(DuplicateJob)` while a live job uses `key`.
    pub fn enqueue_outbound_with_key(
        &self,
        key: impl Into<String>,
        entity_type: EntityType,
        entity_id: EntityId,
        priority: JobPriority,
    ) -> Result<JobId> {
        let job = OutboundJob {
            entity_type,
            entity_id,
        };
        Ok(self.queues.outbound.add(key, job, priority)?)
    }

    /// Queue an inbound sync.
    pub fn enqueue_inbound(
        &self,
        entity_type: EntityType,
        remote_id: RemoteId,
        event: InboundEvent,
    ) -> Result<JobId> {
        let key = job_key(entity_type, &remote_id);
        self.enqueue_inbound_with_key(key, entity_type, remote_id, event, JobPriority::Normal)
    }

    /// Queue an inbound sync under an explicit key.
    pub fn enqueue_inbound_with_key(
        &self,
        key: impl Into<String>,
        entity_type: EntityType,
        remote_id: RemoteId,
        event: InboundEvent,
        priority: JobPriority,
    ) -> Result<JobId> {
        let job = InboundJob {
            entity_type,
            remote_id,
            event,
        };
        Ok(self.queues.inbound.add(key, job, priority)?)
    }

    /// Queue a full remote scan.
    pub fn enqueue_batch_poll(&self, target: PollTarget) -> Result<JobId> {
        Ok(self.queues.batch_poll.add(
            job_key(target, "poll"),
            BatchPollJob { target },
            JobPriority::Normal,
        )?)
    }

    /// Per-queue job counts.
    pub fn queue_stats(&self) -> QueueStats {
        self.queues.stats()
    }

    /// The engine's queues.
    pub fn queues(&self) -> &SyncQueues {
        &self.queues
    }

    // ---- local mutations ----

    /// Store a new local entity and queue its first push.
    pub async fn create_local(&self, data: EntityData) -> Result<Entity> {
        let entity = Entity::new_local(data, now_millis());
        self.store.put_entity(&entity).await?;
        tracing::info!("Created {} {}", entity.entity_type(), entity.id);
        self.enqueue_outbound(entity.entity_type(), entity.id, JobPriority::High)?;
        Ok(entity)
    }

    /// Apply field edits to a local entity and queue a push.
    ///
    /// # Errors
    ///
    /// `NotFound` for missing or deleted entities, `Validation` for edits
    /// that do not fit the entity.
    pub async fn update_local(&self, id: EntityId, edits: &Fields) -> Result<Entity> {
        let entity = {
            let _guard = self.locks.entity(id).await;
            let mut entity = self.live_entity(id).await?;
            entity.edit(edits, now_millis())?;
            entity.set_sync_status(SyncStatus::Pending);
            self.store.put_entity(&entity).await?;
            entity
        };
        self.enqueue_outbound(entity.entity_type(), entity.id, JobPriority::Normal)?;
        Ok(entity)
    }

    /// Soft-delete a local entity and queue the remote archive.
    pub async fn delete_local(&self, id: EntityId) -> Result<Entity> {
        let entity = {
            let _guard = self.locks.entity(id).await;
            let mut entity = self.live_entity(id).await?;
            entity.mark_deleted(now_millis());
            entity.set_sync_status(SyncStatus::Pending);
            self.store.put_entity(&entity).await?;
            entity
        };
        tracing::info!("Deleted {} {}", entity.entity_type(), entity.id);
        self.enqueue_outbound(entity.entity_type(), entity.id, JobPriority::Normal)?;
        Ok(entity)
    }

    async fn live_entity(&self, id: EntityId) -> Result<Entity> {
        match self.store.get_entity(id).await? {
            Some(entity) if !entity.is_deleted => Ok(entity),
            _ => Err(EngineError::not_found("entity", id)),
        }
    }

    /// Fetch an entity, deleted or not.
    pub async fn get_entity(&self, id: EntityId) -> Result<Entity> {
        self.store
            .get_entity(id)
            .await?
            .ok_or_else(|| EngineError::not_found("entity", id))
    }

    // ---- conflicts ----

    /// Resolve a conflict on behalf of `resolved_by`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Resolution(AlreadyResolved)`,
    /// `Resolution(MissingFieldChoices)` or `Resolution(InvalidResolution)`
    /// for types other than keep_local, keep_remote and merged.
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution_type: ResolutionType,
        field_choices: Option<FieldChoices>,
        resolved_by: &str,
    ) -> Result<Entity> {
        let resolution = Resolution::from_request(resolution_type, field_choices)?;
        self.conflicts.resolve(id, resolution, resolved_by).await
    }

    /// Fetch a conflict.
    pub async fn get_conflict(&self, id: ConflictId) -> Result<Conflict> {
        self.conflicts.get(id).await
    }

    /// Pending conflicts, highest priority first.
    pub async fn list_unresolved(
        &self,
        entity_type: Option<EntityType>,
        page: Page,
    ) -> Result<Paged<Conflict>> {
        self.conflicts.list_unresolved(entity_type, page).await
    }

    /// Resolved conflicts, most recent first.
    pub async fn conflict_history(
        &self,
        entity_type: Option<EntityType>,
        page: Page,
    ) -> Result<Paged<Conflict>> {
        self.conflicts.history(entity_type, page).await
    }

    /// Pending and resolved totals.
    pub async fn conflict_counts(&self) -> Result<ConflictCounts> {
        self.conflicts.counts().await
    }

    // ---- logs and stats ----

    /// Re-queue the record behind a failed attempt at high priority and
    /// mark the log `retrying`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown logs, `Validation` unless the log failed.
    pub async fn retry_log(&self, id: LogId) -> Result<JobId> {
        let mut log = self
            .store
            .get_log(id)
            .await?
            .ok_or_else(|| EngineError::not_found("sync log", id))?;
        if log.status != LogStatus::Failed {
            return Err(EngineError::Validation(
                "only failed syncs can be retried".into(),
            ));
        }

        let job_id = self.requeue(&log)?;
        log.mark_retrying()?;
        self.store.put_log(&log).await?;
        tracing::info!(
            "Retrying sync log {} (retry {})",
            log.id,
            log.retry_count
        );
        Ok(job_id)
    }

    fn requeue(&self, log: &SyncLog) -> Result<JobId> {
        match (log.direction, log.entity_id, &log.remote_id) {
            (Direction::ToRemote, Some(entity_id), _) => {
                self.enqueue_outbound(log.entity_type, entity_id, JobPriority::High)
            }
            (Direction::FromRemote, _, Some(remote_id)) => {
                let event = match log.action {
                    SyncAction::Create => InboundEvent::Create,
                    SyncAction::Update => InboundEvent::Update,
                    SyncAction::Delete => InboundEvent::Delete,
                };
                self.enqueue_inbound_with_key(
                    job_key(log.entity_type, remote_id),
                    log.entity_type,
                    remote_id.clone(),
                    event,
                    JobPriority::High,
                )
            }
            _ => Err(EngineError::Validation(format!(
                "sync log {} has no record to retry",
                log.id
            ))),
        }
    }

    /// Attempt logs, newest first.
    pub async fn list_logs(&self, filter: &LogFilter, page: Page) -> Result<Paged<SyncLog>> {
        Ok(self.store.list_logs(filter, page).await?)
    }

    /// Entities waiting for (or failed at) their next push, oldest edit
    /// first.
    pub async fn pending_entities(
        &self,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        Ok(self.store.pending_entities(entity_type, limit).await?)
    }

    /// Per-type status counts and last-24h log counts.
    pub async fn sync_stats(&self) -> Result<SyncStats> {
        let mut entities = BTreeMap::new();
        for entity_type in EntityType::ALL {
            entities.insert(entity_type, self.store.count_entities(entity_type).await?);
        }
        let logs_last_24h = self
            .store
            .count_logs_since(now_millis() - STATS_WINDOW_MS)
            .await?;
        Ok(SyncStats {
            entities,
            logs_last_24h,
        })
    }

    // ---- control and observability ----

    /// Remote API rate limiter status.
    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.client.rate_limit_status()
    }

    /// Pause every queue.
    pub fn pause_all(&self) {
        self.queues.pause_all();
    }

    /// Resume every queue.
    pub fn resume_all(&self) {
        self.queues.resume_all();
    }

    /// Drop queue history: completed jobs older than `older_than`, failed
    /// jobs older than seven times that.
    pub fn clean_queues(&self, older_than: Duration) -> usize {
        self.queues.clean(older_than)
    }

    /// Subscribe to sync notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.notifier.subscribe()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Time since construction.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Wait until every queue is idle, checking every `poll`.
    pub async fn wait_idle(&self, poll: Duration) {
        while !self.queues.is_idle() {
            tokio::time::sleep(poll).await;
        }
    }
}
