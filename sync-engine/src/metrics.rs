//! Operational counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operational metrics for monitoring engine activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Orchestration attempts that finished successfully.
    pub syncs_succeeded: AtomicU64,
    /// Orchestration attempts that failed with an error.
    pub syncs_failed: AtomicU64,
    /// Conflicts detected (including re-detections of a pending conflict).
    pub conflicts_detected: AtomicU64,
    /// Conflicts resolved, manually or by policy.
    pub conflicts_resolved: AtomicU64,
    /// Jobs completed.
    pub jobs_completed: AtomicU64,
    /// Jobs that failed for good.
    pub jobs_failed: AtomicU64,
    /// Stalls detected by the reapers.
    pub jobs_stalled: AtomicU64,
    /// Notifications published with no subscriber listening.
    pub notifications_dropped: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// See [`EngineMetrics::syncs_succeeded`].
    pub syncs_succeeded: u64,
    /// See [`EngineMetrics::syncs_failed`].
    pub syncs_failed: u64,
    /// See [`EngineMetrics::conflicts_detected`].
    pub conflicts_detected: u64,
    /// See [`EngineMetrics::conflicts_resolved`].
    pub conflicts_resolved: u64,
    /// See [`EngineMetrics::jobs_completed`].
    pub jobs_completed: u64,
    /// See [`EngineMetrics::jobs_failed`].
    pub jobs_failed: u64,
    /// See [`EngineMetrics::jobs_stalled`].
    pub jobs_stalled: u64,
    /// See [`EngineMetrics::notifications_dropped`].
    pub notifications_dropped: u64,
}

impl EngineMetrics {
    /// Read every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            syncs_succeeded: self.syncs_succeeded.load(Ordering::Relaxed),
            syncs_failed: self.syncs_failed.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_stalled: self.jobs_stalled.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
        }
    }
}
