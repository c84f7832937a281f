//! HTTP endpoints for crm-sync-engine.
//!
//! Provides health checks and Prometheus metrics.

pub mod health;
mod metrics;

use crate::engine::SyncEngine;
use axum::{routing::get, Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
///
/// `/metrics` is only routed when `http.metrics_enabled` is set.
pub fn build_router(engine: Arc<SyncEngine>) -> Router {
    let mut router = Router::new().route("/health", get(health::health_handler));
    if engine.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(engine))
}

/// Serve the router on `addr` until the task is dropped.
pub async fn serve(engine: Arc<SyncEngine>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(engine)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CleanupConfig, Config, HttpConfig};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sync_client::MockRemote;
    use tower::util::ServiceExt;

    fn test_engine(metrics_enabled: bool) -> Arc<SyncEngine> {
        let config = Config {
            http: HttpConfig {
                metrics_enabled,
                ..HttpConfig::default()
            },
            cleanup: CleanupConfig {
                enabled: false,
                ..CleanupConfig::default()
            },
            ..Config::default()
        };
        Arc::new(
            SyncEngine::new(
                config,
                Arc::new(MemoryStore::new()),
                Arc::new(MockRemote::new()),
            )
            .unwrap(),
        )
    }

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = build_router(test_engine(true));
        assert_eq!(get_status(app, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let app = build_router(test_engine(true));
        assert_eq!(get_status(app, "/metrics").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_can_be_disabled() {
        let app = build_router(test_engine(false));
        assert_eq!(get_status(app, "/metrics").await, StatusCode::NOT_FOUND);
    }
}
