//! Health check endpoint.

use crate::engine::SyncEngine;
use axum::{http::StatusCode, Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Engine version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
    /// Conflicts waiting for an operator.
    pub unresolved_conflicts: u64,
}

/// Health check handler.
///
/// Reports `degraded` with 503 when the record store cannot be read.
pub async fn health_handler(
    Extension(engine): Extension<Arc<SyncEngine>>,
) -> (StatusCode, Json<HealthStatus>) {
    let (code, status, unresolved) = match engine.conflict_counts().await {
        Ok(counts) => (StatusCode::OK, "ok", counts.pending),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", 0)
        }
    };

    (
        code,
        Json(HealthStatus {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: engine.uptime().as_secs(),
            unresolved_conflicts: unresolved,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            uptime_seconds: 3600,
            unresolved_conflicts: 4,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"unresolved_conflicts\":4"));
    }
}
