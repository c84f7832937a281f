//! Prometheus metrics endpoint.

use crate::engine::SyncEngine;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;
use std::sync::Arc;
use sync_core::JobCounts;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(engine): Extension<Arc<SyncEngine>>) -> impl IntoResponse {
    let m = engine.metrics();
    let queues = engine.queue_stats();
    let limiter = engine.rate_limit_status();

    // Store query is best effort
    let unresolved = engine
        .conflict_counts()
        .await
        .map(|c| c.pending)
        .unwrap_or(0);

    let mut body = format!(
        r#"# HELP crm_sync_info Engine information
# TYPE crm_sync_info gauge
crm_sync_info{{version="{version}"}} 1

# HELP crm_sync_syncs_succeeded_total Sync attempts that finished successfully
# TYPE crm_sync_syncs_succeeded_total counter
crm_sync_syncs_succeeded_total {syncs_ok}

# HELP crm_sync_syncs_failed_total Sync attempts that failed with an error
# TYPE crm_sync_syncs_failed_total counter
crm_sync_syncs_failed_total {syncs_failed}

# HELP crm_sync_conflicts_detected_total Conflicts detected, re-detections included
# TYPE crm_sync_conflicts_detected_total counter
crm_sync_conflicts_detected_total {detected}

# HELP crm_sync_conflicts_resolved_total Conflicts resolved manually or by policy
# TYPE crm_sync_conflicts_resolved_total counter
crm_sync_conflicts_resolved_total {resolved}

# HELP crm_sync_jobs_completed_total Jobs completed
# TYPE crm_sync_jobs_completed_total counter
crm_sync_jobs_completed_total {jobs_completed}

# HELP crm_sync_jobs_failed_total Jobs that exhausted their attempts
# TYPE crm_sync_jobs_failed_total counter
crm_sync_jobs_failed_total {jobs_failed}

# HELP crm_sync_jobs_stalled_total Stalled jobs detected
# TYPE crm_sync_jobs_stalled_total counter
crm_sync_jobs_stalled_total {jobs_stalled}

# HELP crm_sync_notifications_dropped_total Notifications published with no subscriber
# TYPE crm_sync_notifications_dropped_total counter
crm_sync_notifications_dropped_total {dropped}

# HELP crm_sync_conflicts_unresolved Conflicts waiting for an operator
# TYPE crm_sync_conflicts_unresolved gauge
crm_sync_conflicts_unresolved {unresolved}

# HELP crm_sync_rate_limit_tokens Remote API tokens available
# TYPE crm_sync_rate_limit_tokens gauge
crm_sync_rate_limit_tokens {tokens}

# HELP crm_sync_rate_limit_queue_length Callers waiting for a remote API token
# TYPE crm_sync_rate_limit_queue_length gauge
crm_sync_rate_limit_queue_length {waiters}

# HELP crm_sync_queue_jobs Jobs per queue and state
# TYPE crm_sync_queue_jobs gauge
"#,
        version = env!("CARGO_PKG_VERSION"),
        syncs_ok = m.syncs_succeeded,
        syncs_failed = m.syncs_failed,
        detected = m.conflicts_detected,
        resolved = m.conflicts_resolved,
        jobs_completed = m.jobs_completed,
        jobs_failed = m.jobs_failed,
        jobs_stalled = m.jobs_stalled,
        dropped = m.notifications_dropped,
        tokens = limiter.available_tokens,
        waiters = limiter.queue_length,
    );

    write_queue(&mut body, engine.queues().outbound.name(), &queues.outbound);
    write_queue(&mut body, engine.queues().inbound.name(), &queues.inbound);
    write_queue(&mut body, engine.queues().batch_poll.name(), &queues.batch_poll);

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

fn write_queue(body: &mut String, queue: &str, counts: &JobCounts) {
    for (state, n) in [
        ("waiting", counts.waiting),
        ("active", counts.active),
        ("delayed", counts.delayed),
        ("completed", counts.completed),
        ("failed", counts.failed),
    ] {
        // Writing to a String cannot fail
        let _ = writeln!(
            body,
            "crm_sync_queue_jobs{{queue=\"{queue}\",state=\"{state}\"}} {n}"
        );
    }
}
