//! TSDB backend replicas
//!
//! A [`Backend`] is one replica behind the load balancer. Liveness and
//! in-flight connection counts are atomics so the append-only pool can
//! be iterated lock-free. The retention period is cached from the
//! backend's status endpoint with a stale-tolerant policy: a failed
//! refresh never clears the last known value, keeping routing decisions
//! stable across control-plane flaps.

use ceems_core::parse_duration;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shape of the TSDB status endpoint response.
#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    data: HashMap<String, String>,
}

/// One backend replica.
pub struct Backend {
    url: String,
    alive: AtomicBool,
    active_connections: AtomicU64,
    retention: RwLock<Option<Duration>>,
}

impl Backend {
    /// Create a backend for `url` (e.g. `http://tsdb-0:9090`). Backends
    /// start out alive; the first probe corrects that if needed.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            alive: AtomicBool::new(true),
            active_connections: AtomicU64::new(0),
            retention: RwLock::new(None),
        }
    }

    /// Base URL of this backend.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the last probe succeeded.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Record a probe or proxy outcome.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    /// Number of requests currently proxied to this backend.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// RAII accounting for one proxied request: increments on creation,
    /// decrements on drop, so the decrement runs on every exit path.
    pub fn connection_guard(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    /// Last known retention period, if any probe ever succeeded.
    pub fn retention_period(&self) -> Option<Duration> {
        *self.retention.read()
    }

    /// Overwrite the cached retention period.
    pub fn set_retention(&self, retention: Duration) {
        *self.retention.write() = Some(retention);
    }

    /// Probe the status endpoint: returns liveness and refreshes the
    /// retention cache on success. Failures leave the cache untouched.
    pub async fn refresh_status(&self, client: &reqwest::Client) -> bool {
        let url = format!("{}/api/v1/status/runtimeinfo", self.url);

        let response = match client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(backend = %self.url, error = %e, "Backend probe failed");
                return false;
            }
        };

        if !response.status().is_success() {
            debug!(backend = %self.url, status = %response.status(), "Backend probe returned error status");
            return false;
        }

        match response.json::<StatusResponse>().await {
            Ok(status) if status.status == "success" => {
                if let Some(raw) = status.data.get("storageRetention") {
                    if let Some(retention) = parse_retention(raw) {
                        self.set_retention(retention);
                    }
                }
                true
            }
            Ok(_) => {
                // Endpoint reachable but unhealthy payload: alive, cache kept
                true
            }
            Err(e) => {
                debug!(backend = %self.url, error = %e, "Malformed status payload, keeping cached retention");
                true
            }
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("url", &self.url)
            .field("alive", &self.is_alive())
            .field("active_connections", &self.active_connections())
            .field("retention", &self.retention_period())
            .finish()
    }
}

/// See [`Backend::connection_guard`].
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        // Saturating: a spurious double-drop must not wrap the counter
        let _ = self
            .backend
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

/// Extract the duration component from a retention string. TSDBs report
/// either a plain duration (`30d`) or a combined size/time policy
/// (`30d or 10GiB`); only the duration part matters for routing.
pub fn parse_retention(raw: &str) -> Option<Duration> {
    raw.split(" or ")
        .find_map(|component| parse_duration(component.trim()).ok())
}
