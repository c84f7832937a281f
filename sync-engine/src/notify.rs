//! Observer notifications.
//!
//! The engine publishes a [`SyncNotification`] for every sync outcome,
//! batch poll result, conflict resolution and job that failed for good. Delivery is best-effort over a
//! `tokio::sync::broadcast` channel: publishing never waits, a subscriber that
//! falls behind loses the oldest events, and events published while nobody
//! is subscribed are counted and dropped.

use crate::error::ErrorKind;
use crate::jobs::PollCounts;
use crate::metrics::EngineMetrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync_types::{ConflictId, Direction, EntityId, EntityType, RemoteId, ResolutionType};
use tokio::sync::broadcast;

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// An event for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncNotification {
    /// An orchestration attempt finished without an error.
    ///
    /// `success` is false when the attempt stopped on a conflict.
    SyncCompleted {
        /// Entity type.
        entity_type: EntityType,
        /// Local entity, if one exists.
        entity_id: Option<EntityId>,
        /// Remote record, if known.
        remote_id: Option<RemoteId>,
        /// Which way data flowed.
        direction: Direction,
        /// Whether the write went through.
        success: bool,
        /// Whether a conflict was recorded.
        conflict: bool,
    },
    /// An orchestration attempt failed.
    SyncErrored {
        /// Entity type.
        entity_type: EntityType,
        /// Local entity, if known.
        entity_id: Option<EntityId>,
        /// Remote record, if known.
        remote_id: Option<RemoteId>,
        /// Which way data flowed.
        direction: Direction,
        /// Error message.
        error: String,
        /// Error class.
        kind: ErrorKind,
    },
    /// A batch poll scanned every requested type.
    BatchPollCompleted {
        /// Per-type results.
        counts: BTreeMap<EntityType, PollCounts>,
    },
    /// A batch poll aborted.
    BatchPollErrored {
        /// Error message.
        error: String,
    },
    /// A conflict was resolved.
    ConflictResolved {
        /// Conflict id.
        conflict_id: ConflictId,
        /// Entity the conflict belonged to.
        entity_id: EntityId,
        /// How it was resolved.
        resolution_type: ResolutionType,
    },
    /// A job failed for good: its attempts ran out or it stalled too often.
    JobFailed {
        /// Queue the job ran on.
        queue: String,
        /// Entity type, for single-record jobs.
        entity_type: Option<EntityType>,
        /// Local entity, for outbound jobs.
        entity_id: Option<EntityId>,
        /// Remote record, for inbound jobs.
        remote_id: Option<RemoteId>,
        /// Last failure reason.
        reason: String,
    },
}

/// Publisher side of the notification channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SyncNotification>,
    metrics: Arc<EngineMetrics>,
}

impl Notifier {
    /// Create a notifier with room for `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize, metrics: Arc<EngineMetrics>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, metrics }
    }

    /// Subscribe to future notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.tx.subscribe()
    }

    /// Publish without waiting.
    pub fn publish(&self, notification: SyncNotification) {
        if self.tx.send(notification).is_err() {
            self.metrics
                .notifications_dropped
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Notification dropped: no subscribers");
        }
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed() -> SyncNotification {
        SyncNotification::SyncCompleted {
            entity_type: EntityType::Contact,
            entity_id: Some(EntityId::new()),
            remote_id: None,
            direction: Direction::ToRemote,
            success: true,
            conflict: false,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let notifier = Notifier::new(8, Arc::new(EngineMetrics::default()));
        let mut rx = notifier.subscribe();

        let event = completed();
        notifier.publish(event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn publish_without_subscribers_is_counted() {
        let metrics = Arc::new(EngineMetrics::default());
        let notifier = Notifier::new(8, Arc::clone(&metrics));

        notifier.publish(completed());

        assert_eq!(metrics.snapshot().notifications_dropped, 1);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn notifications_serialize_with_event_tag() {
        let json = serde_json::to_value(SyncNotification::BatchPollErrored {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "batch_poll_errored");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn job_failures_serialize_with_queue_and_reason() {
        let json = serde_json::to_value(SyncNotification::JobFailed {
            queue: "inbound-sync".into(),
            entity_type: Some(EntityType::Company),
            entity_id: None,
            remote_id: Some(RemoteId::new("77")),
            reason: sync_core::STALLED_REASON.into(),
        })
        .unwrap();
        assert_eq!(json["event"], "job_failed");
        assert_eq!(json["queue"], "inbound-sync");
        assert_eq!(json["entity_type"], "company");
        assert_eq!(json["remote_id"], "77");
        assert_eq!(json["reason"], sync_core::STALLED_REASON);
    }
}
