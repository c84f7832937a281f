//! Job payloads and queue handlers.
//!
//! Three queues drive the engine:
//!
//! | Queue       | Payload          | Handler               |
//! |-------------|------------------|-----------------------|
//! | outbound    | [`OutboundJob`]  | [`OutboundHandler`]   |
//! | inbound     | [`InboundJob`]   | [`InboundHandler`]    |
//! | batch-poll  | [`BatchPollJob`] | [`BatchPollHandler`]  |
//!
//! Handlers are thin: they call into the [`SyncOrchestrator`] and turn its
//! errors into job failures so the queue's retry policy applies.

use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::notify::{Notifier, SyncNotification};
use crate::orchestrator::{SyncOrchestrator, SyncOutcome};
use crate::queue::{JobContext, JobHandler, JobQueue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_client::CrmClient;
use sync_core::{JobCounts, JobOptions, JobState};
use sync_types::{now_millis, EntityId, EntityType, RemoteId, ValueError};

/// Local to remote queue.
pub const OUTBOUND_QUEUE: &str = "outbound-sync";
/// Remote to local queue.
pub const INBOUND_QUEUE: &str = "inbound-sync";
/// Full remote scan queue.
pub const BATCH_POLL_QUEUE: &str = "batch-poll";

/// Failed jobs are kept this many times longer than completed ones.
const FAILED_RETENTION_FACTOR: u32 = 7;

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Default uniqueness key: `{entity_type}-{id}-{millis}-{seq}`.
///
/// The timestamp and sequence make every request distinct, so repeated
/// requests for the same record are queued rather than merged.
pub fn job_key(entity_type: impl fmt::Display, id: impl fmt::Display) -> String {
    let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}-{}", entity_type, id, now_millis(), seq)
}

/// Push one local entity to the remote CRM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundJob {
    /// Entity type.
    pub entity_type: EntityType,
    /// Local entity id.
    pub entity_id: EntityId,
}

/// What happened on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundEvent {
    /// Record created remotely.
    Create,
    /// Record changed remotely.
    Update,
    /// Record deleted remotely.
    Delete,
}

impl InboundEvent {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pull one remote record into the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundJob {
    /// Entity type.
    pub entity_type: EntityType,
    /// Remote record id.
    pub remote_id: RemoteId,
    /// Remote event that triggered the job.
    pub event: InboundEvent,
}

/// Which entity types a batch poll scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollTarget {
    /// Every enabled type.
    #[default]
    All,
    /// Contacts only.
    Contact,
    /// Companies only.
    Company,
}

impl PollTarget {
    /// Types to scan, in polling order, limited to `enabled`.
    pub fn entity_types(&self, enabled: &[EntityType]) -> Vec<EntityType> {
        let wanted = |t: &EntityType| match self {
            Self::All => true,
            Self::Contact => *t == EntityType::Contact,
            Self::Company => *t == EntityType::Company,
        };
        EntityType::ALL
            .into_iter()
            .filter(|t| enabled.contains(t) && wanted(t))
            .collect()
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Contact => "contact",
            Self::Company => "company",
        }
    }
}

impl From<EntityType> for PollTarget {
    fn from(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Contact => Self::Contact,
            EntityType::Company => Self::Company,
        }
    }
}

impl FromStr for PollTarget {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            other => other.parse::<EntityType>().map(Self::from),
        }
    }
}

impl fmt::Display for PollTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scan the remote CRM and pull every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchPollJob {
    /// Types to scan.
    pub target: PollTarget,
}

/// Per-type batch poll results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollCounts {
    /// Records applied locally.
    pub synced: u64,
    /// Records that stopped on a conflict.
    pub conflicts: u64,
    /// Records whose sync failed.
    pub errors: u64,
}

/// Job counts of every queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Outbound queue.
    pub outbound: JobCounts,
    /// Inbound queue.
    pub inbound: JobCounts,
    /// Batch-poll queue.
    pub batch_poll: JobCounts,
}

/// The engine's three queues. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncQueues {
    /// Local to remote.
    pub outbound: Arc<JobQueue<OutboundJob>>,
    /// Remote to local.
    pub inbound: Arc<JobQueue<InboundJob>>,
    /// Full remote scans.
    pub batch_poll: Arc<JobQueue<BatchPollJob>>,
}

impl SyncQueues {
    /// Create stopped queues sharing one policy.
    pub fn new(options: JobOptions, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            outbound: Arc::new(JobQueue::new(
                OUTBOUND_QUEUE,
                options.clone(),
                Arc::clone(&metrics),
            )),
            inbound: Arc::new(JobQueue::new(
                INBOUND_QUEUE,
                options.clone(),
                Arc::clone(&metrics),
            )),
            batch_poll: Arc::new(JobQueue::new(BATCH_POLL_QUEUE, options, metrics)),
        }
    }

    /// Per-queue counts.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            outbound: self.outbound.counts(),
            inbound: self.inbound.counts(),
            batch_poll: self.batch_poll.counts(),
        }
    }

    /// Pause every queue.
    pub fn pause_all(&self) {
        self.outbound.pause();
        self.inbound.pause();
        self.batch_poll.pause();
    }

    /// Resume every queue.
    pub fn resume_all(&self) {
        self.outbound.resume();
        self.inbound.resume();
        self.batch_poll.resume();
    }

    /// Drop completed jobs older than `older_than` and failed jobs older
    /// than seven times that. Returns the number of jobs removed.
    pub fn clean(&self, older_than: Duration) -> usize {
        let failed_grace = older_than.saturating_mul(FAILED_RETENTION_FACTOR);
        let mut removed = 0;
        removed += self.outbound.clean(JobState::Completed, older_than);
        removed += self.outbound.clean(JobState::Failed, failed_grace);
        removed += self.inbound.clean(JobState::Completed, older_than);
        removed += self.inbound.clean(JobState::Failed, failed_grace);
        removed += self.batch_poll.clean(JobState::Completed, older_than);
        removed += self.batch_poll.clean(JobState::Failed, failed_grace);
        removed
    }

    /// True when no queue has pending or running work.
    pub fn is_idle(&self) -> bool {
        self.outbound.is_idle() && self.inbound.is_idle() && self.batch_poll.is_idle()
    }

    /// Stop every worker.
    pub fn shutdown(&self) {
        self.outbound.shutdown();
        self.inbound.shutdown();
        self.batch_poll.shutdown();
    }
}

/// Runs outbound jobs.
#[derive(Debug)]
pub struct OutboundHandler {
    orchestrator: Arc<SyncOrchestrator>,
    notifier: Notifier,
}

impl OutboundHandler {
    /// Create a handler.
    pub fn new(orchestrator: Arc<SyncOrchestrator>, notifier: Notifier) -> Self {
        Self {
            orchestrator,
            notifier,
        }
    }
}

#[async_trait]
impl JobHandler<OutboundJob> for OutboundHandler {
    async fn handle(&self, job: &JobContext<OutboundJob>) -> Result<(), EngineError> {
        self.orchestrator
            .sync_to_remote(job.data.entity_id)
            .await
            .map(|_| ())
    }

    fn on_failed(&self, data: &OutboundJob, reason: &str) {
        tracing::error!(
            "Outbound sync of {} {} gave up: {}",
            data.entity_type,
            data.entity_id,
            reason
        );
        self.notifier.publish(SyncNotification::JobFailed {
            queue: OUTBOUND_QUEUE.to_string(),
            entity_type: Some(data.entity_type),
            entity_id: Some(data.entity_id),
            remote_id: None,
            reason: reason.to_string(),
        });
    }
}

/// Runs inbound jobs.
#[derive(Debug)]
pub struct InboundHandler {
    orchestrator: Arc<SyncOrchestrator>,
    notifier: Notifier,
}

impl InboundHandler {
    /// Create a handler.
    pub fn new(orchestrator: Arc<SyncOrchestrator>, notifier: Notifier) -> Self {
        Self {
            orchestrator,
            notifier,
        }
    }
}

#[async_trait]
impl JobHandler<InboundJob> for InboundHandler {
    async fn handle(&self, job: &JobContext<InboundJob>) -> Result<(), EngineError> {
        let data = &job.data;
        self.orchestrator
            .sync_from_remote(data.entity_type, &data.remote_id, data.event)
            .await
            .map(|_| ())
    }

    fn on_failed(&self, data: &InboundJob, reason: &str) {
        tracing::error!(
            "Inbound sync of {} {} ({}) gave up: {}",
            data.entity_type,
            data.remote_id,
            data.event,
            reason
        );
        self.notifier.publish(SyncNotification::JobFailed {
            queue: INBOUND_QUEUE.to_string(),
            entity_type: Some(data.entity_type),
            entity_id: None,
            remote_id: Some(data.remote_id.clone()),
            reason: reason.to_string(),
        });
    }
}

/// Runs batch polls.
#[derive(Debug)]
pub struct BatchPollHandler {
    orchestrator: Arc<SyncOrchestrator>,
    client: Arc<CrmClient>,
    notifier: Notifier,
    page_size: usize,
    enabled: Vec<EntityType>,
}

impl BatchPollHandler {
    /// Create a handler scanning `enabled` types, `page_size` records per
    /// remote call.
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        client: Arc<CrmClient>,
        notifier: Notifier,
        page_size: usize,
        enabled: Vec<EntityType>,
    ) -> Self {
        Self {
            orchestrator,
            client,
            notifier,
            page_size: page_size.max(1),
            enabled,
        }
    }

    /// Scan one type page by page and apply each listed record.
    ///
    /// Records are applied as listed: the page is the remote snapshot for
    /// this scan and is not re-fetched per record. A remote edit landing
    /// between the list call and the apply is picked up by its webhook or
    /// by the next poll, and conflict detection still compares it against
    /// the stored snapshot under the record lock.
    async fn poll_type(
        &self,
        entity_type: EntityType,
        job: &JobContext<BatchPollJob>,
        progress: u8,
    ) -> Result<PollCounts, EngineError> {
        let mut counts = PollCounts::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .client
                .list_page(entity_type, self.page_size, cursor.as_deref())
                .await?;

            for record in &page.records {
                match self.orchestrator.sync_remote_record(record).await {
                    Ok(SyncOutcome::Conflict(_)) => counts.conflicts += 1,
                    Ok(_) => counts.synced += 1,
                    Err(e) => {
                        counts.errors += 1;
                        tracing::warn!(
                            "Batch poll: {} {} failed: {}",
                            entity_type,
                            record.remote_id,
                            e
                        );
                    }
                }
            }
            job.progress(progress);

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl JobHandler<BatchPollJob> for BatchPollHandler {
    async fn handle(&self, job: &JobContext<BatchPollJob>) -> Result<(), EngineError> {
        let types = job.data.target.entity_types(&self.enabled);
        tracing::info!("Batch poll started ({}): {:?}", job.data.target, types);

        let mut counts = BTreeMap::new();
        for (i, entity_type) in types.iter().enumerate() {
            let progress = (i * 100 / types.len()) as u8;
            match self.poll_type(*entity_type, job, progress).await {
                Ok(c) => {
                    tracing::info!(
                        "Batch poll {}: {} synced, {} conflicts, {} errors",
                        entity_type,
                        c.synced,
                        c.conflicts,
                        c.errors
                    );
                    counts.insert(*entity_type, c);
                }
                Err(e) => {
                    tracing::error!("Batch poll aborted on {}: {}", entity_type, e);
                    self.notifier.publish(SyncNotification::BatchPollErrored {
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        self.notifier
            .publish(SyncNotification::BatchPollCompleted { counts });
        Ok(())
    }

    fn on_failed(&self, data: &BatchPollJob, reason: &str) {
        tracing::error!("Batch poll ({}) gave up: {}", data.target, reason);
        self.notifier.publish(SyncNotification::JobFailed {
            queue: BATCH_POLL_QUEUE.to_string(),
            entity_type: None,
            entity_id: None,
            remote_id: None,
            reason: reason.to_string(),
        });
    }
}
