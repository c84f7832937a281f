//! Background retention task.
//!
//! Runs periodically to purge old attempt logs, trim queue history and drop
//! idle per-record locks.

use crate::config::CleanupConfig;
use crate::error::Result;
use crate::jobs::SyncQueues;
use crate::locks::KeyedLocks;
use crate::store::RecordStore;
use std::sync::Arc;
use std::time::Duration;
use sync_types::{now_millis, LogStatus, Timestamp};
use tokio::time::interval;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Successful attempt logs purged.
    pub success_logs: u64,
    /// Failed attempt logs purged.
    pub failed_logs: u64,
    /// Finished jobs dropped from queue history.
    pub jobs: usize,
    /// Idle lock entries dropped.
    pub locks: usize,
}

/// Run one cleanup pass as of `now`.
pub async fn run_cleanup(
    store: &dyn RecordStore,
    queues: &SyncQueues,
    locks: &KeyedLocks,
    config: &CleanupConfig,
    now: Timestamp,
) -> Result<CleanupReport> {
    let success_before = now - i64::from(config.success_log_retention_days) * DAY_MS;
    let failed_before = now - i64::from(config.failed_log_retention_days) * DAY_MS;

    Ok(CleanupReport {
        success_logs: store.purge_logs(LogStatus::Success, success_before).await?,
        failed_logs: store.purge_logs(LogStatus::Failed, failed_before).await?,
        jobs: queues.clean(Duration::from_secs(config.completed_job_retention_secs)),
        locks: locks.prune(),
    })
}

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    store: Arc<dyn RecordStore>,
    queues: SyncQueues,
    locks: Arc<KeyedLocks>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;

            match run_cleanup(store.as_ref(), &queues, &locks, &config, now_millis()).await {
                Ok(report) => {
                    if report.success_logs + report.failed_logs > 0 || report.jobs > 0 {
                        tracing::info!(
                            "Cleanup: purged {} success logs, {} failed logs, {} jobs",
                            report.success_logs,
                            report.failed_logs,
                            report.jobs
                        );
                    } else {
                        tracing::debug!("Cleanup: nothing to purge");
                    }
                }
                Err(e) => {
                    tracing::error!("Cleanup error: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::EngineMetrics;
    use crate::store::MemoryStore;
    use sync_core::JobOptions;
    use sync_types::{Direction, EntityType, SyncAction, SyncLog};

    fn test_cleanup_config() -> CleanupConfig {
        CleanupConfig {
            enabled: true,
            interval_secs: 3600,
            success_log_retention_days: 30,
            failed_log_retention_days: 90,
            completed_job_retention_secs: 86_400,
        }
    }

    async fn log_at(store: &MemoryStore, at: Timestamp, ok: bool) {
        let mut log = SyncLog::open(EntityType::Contact, Direction::ToRemote, SyncAction::Update, at);
        if ok {
            log.succeed(None, at).unwrap();
        } else {
            log.fail("boom", None, at).unwrap();
        }
        store.put_log(&log).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_purges_by_status_and_age() {
        let store = MemoryStore::new();
        let queues = SyncQueues::new(JobOptions::default(), Arc::new(EngineMetrics::default()));
        let now = 1_000 * DAY_MS;

        log_at(&store, now - 31 * DAY_MS, true).await;
        log_at(&store, now - 29 * DAY_MS, true).await;
        log_at(&store, now - 31 * DAY_MS, false).await;
        log_at(&store, now - 91 * DAY_MS, false).await;

        let report = run_cleanup(
            &store,
            &queues,
            &KeyedLocks::new(),
            &test_cleanup_config(),
            now,
        )
        .await
        .unwrap();

        assert_eq!(report.success_logs, 1);
        assert_eq!(report.failed_logs, 1);
        assert_eq!(report.jobs, 0);
        assert_eq!(store.log_count(), 2);
    }

    #[tokio::test]
    async fn cleanup_task_disabled() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let queues = SyncQueues::new(JobOptions::default(), Arc::new(EngineMetrics::default()));
        let config = CleanupConfig {
            enabled: false,
            ..test_cleanup_config()
        };

        let handle = spawn_cleanup_task(store, queues, Arc::new(KeyedLocks::new()), config);

        // Task should complete immediately when disabled
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }
}
