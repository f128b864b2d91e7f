//! HTTP surface of the collector engine
//!
//! Serves `/metrics` in the Prometheus text exposition format and a
//! `/health` probe. Each scrape is bounded by a deadline; sub-collector
//! cancellation below that deadline is handled inside the engine.

use crate::engine::CollectorEngine;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Content type of the text exposition format v0.0.4.
const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct AppState {
    engine: Arc<CollectorEngine>,
    scrape_timeout: Duration,
}

/// Build the exporter router.
pub fn router(engine: Arc<CollectorEngine>, scrape_timeout: Duration) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(AppState { engine, scrape_timeout })
}

/// Serve the exporter until the process is shut down.
pub async fn serve(engine: Arc<CollectorEngine>, address: &str, scrape_timeout: Duration) -> crate::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(address, "Starting CEEMS exporter");

    axum::serve(listener, router(engine, scrape_timeout))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match tokio::time::timeout(state.scrape_timeout, state.engine.scrape()).await {
        Ok(Ok(body)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "Scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "scrape failed\n").into_response()
        }
        Err(_) => {
            error!(timeout = ?state.scrape_timeout, "Scrape deadline exceeded");
            (StatusCode::SERVICE_UNAVAILABLE, "scrape deadline exceeded\n").into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::CgroupManager;
    use crate::config::CgroupConfig;
    use crate::engine::Collector;
    use crate::exposition::Sample;
    use crate::Result;
    use axum::body::Body;
    use axum::http::Request;
    use ceems_core::ResourceManagerKind;
    use std::fs;
    use std::path::PathBuf;
    use tower::ServiceExt;

    struct OneSample;

    impl Collector for OneSample {
        fn name(&self) -> &'static str {
            "one"
        }

        fn collect(&self, _cgroups: &[crate::cgroups::Cgroup]) -> Result<Vec<Sample>> {
            Ok(vec![Sample::counter("one_total", "one", 1.0)])
        }
    }

    fn test_engine() -> (tempfile::TempDir, Arc<CollectorEngine>) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu\n").unwrap();
        let leaf = dir.path().join("slurm/uid_1000/job_1");
        fs::create_dir_all(&leaf).unwrap();
        fs::write(leaf.join("cgroup.procs"), "1\n").unwrap();

        let config = CgroupConfig {
            root: dir.path().to_path_buf(),
            procfs_root: PathBuf::from("/proc"),
            uuid_sidecar_dir: None,
            uuid_env_var: None,
        };
        let manager = CgroupManager::new(ResourceManagerKind::Slurm, &config).unwrap();

        let engine = Arc::new(CollectorEngine::from_parts(
            manager,
            vec![Arc::new(OneSample)],
            Duration::from_secs(5),
        ));
        (dir, engine)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_metrics_endpoint() {
        let (_dir, engine) = test_engine();
        let app = router(engine, Duration::from_secs(10));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.contains("version=0.0.4"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("one_total 1"));
        assert!(text.contains("ceems_scrape_collector_success"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health_endpoint() {
        let (_dir, engine) = test_engine();
        let app = router(engine, Duration::from_secs(10));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
