//! Cluster-keyed backend pools
//!
//! The backend slice of a pool is append-only after startup, so
//! selection iterates it lock-free; liveness and connection counts live
//! in atomics on the backends themselves.

use crate::backend::Backend;
use crate::strategy::{Strategy, TimeWindow};
use crate::{LbError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Backends of one cluster.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    rr_counter: AtomicUsize,
}

impl BackendPool {
    /// Create a pool over a fixed backend set.
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends,
            rr_counter: AtomicUsize::new(0),
        }
    }

    /// All backends, dead or alive.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Choose a backend per the strategy. Only alive backends are
    /// candidates: no request selects a dead backend while any alive
    /// backend exists.
    pub fn select(&self, strategy: Strategy, window: Option<TimeWindow>) -> Option<Arc<Backend>> {
        let alive: Vec<&Arc<Backend>> = self.backends.iter().filter(|b| b.is_alive()).collect();
        if alive.is_empty() {
            return None;
        }

        let chosen = match strategy {
            Strategy::RoundRobin => {
                let index = self.rr_counter.fetch_add(1, Ordering::Relaxed) % alive.len();
                alive[index]
            }
            Strategy::LeastConnection => {
                // min_by_key is stable: the lowest index wins ties
                alive
                    .iter()
                    .min_by_key(|b| b.active_connections())
                    .copied()?
            }
            Strategy::ResourceBased => match window {
                Some(window) => self.select_by_retention(&alive, window),
                // No window derivable from the request: fall back
                None => {
                    let index = self.rr_counter.fetch_add(1, Ordering::Relaxed) % alive.len();
                    alive[index]
                }
            },
        };

        debug!(backend = %chosen.url(), %strategy, "Selected backend");
        Some(Arc::clone(chosen))
    }

    /// Backend whose retention covers the window, preferring the
    /// longest retention. When none covers it, the longest-retention
    /// backend still holds the most of the requested range.
    fn select_by_retention<'a>(
        &self,
        alive: &[&'a Arc<Backend>],
        window: TimeWindow,
    ) -> &'a Arc<Backend> {
        let needed = window.lookback();

        alive
            .iter()
            .filter(|b| b.retention_period().map(|r| r >= needed).unwrap_or(false))
            .max_by_key(|b| b.retention_period())
            .or_else(|| alive.iter().max_by_key(|b| b.retention_period()))
            .copied()
            .unwrap_or(alive[0])
    }

    /// First alive backend other than `exclude`, for single-retry
    /// failover after a transport error.
    pub fn next_candidate(&self, exclude: &Arc<Backend>) -> Option<Arc<Backend>> {
        self.backends
            .iter()
            .find(|b| b.is_alive() && !Arc::ptr_eq(b, exclude))
            .cloned()
    }
}

/// All pools, keyed by cluster id.
pub struct ClusterPools {
    pools: HashMap<String, BackendPool>,
    strategy: Strategy,
}

impl ClusterPools {
    /// Build pools from `(cluster id, backend urls)` pairs.
    pub fn new(
        clusters: impl IntoIterator<Item = (String, Vec<String>)>,
        strategy: Strategy,
    ) -> Result<Self> {
        let mut pools = HashMap::new();

        for (cluster_id, urls) in clusters {
            if urls.is_empty() {
                return Err(LbError::Configuration(format!(
                    "cluster {} has no backends",
                    cluster_id
                )));
            }

            let backends = urls.into_iter().map(|url| Arc::new(Backend::new(url))).collect();

            if pools.insert(cluster_id.clone(), BackendPool::new(backends)).is_some() {
                return Err(LbError::Configuration(format!(
                    "duplicate cluster id {}",
                    cluster_id
                )));
            }
        }

        if pools.is_empty() {
            return Err(LbError::Configuration("no clusters configured".to_string()));
        }

        Ok(Self { pools, strategy })
    }

    /// Configured selection strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pool of one cluster.
    pub fn pool(&self, cluster_id: &str) -> Option<&BackendPool> {
        self.pools.get(cluster_id)
    }

    /// The only configured cluster id, used when a request carries no
    /// routing header.
    pub fn single_cluster_id(&self) -> Option<&str> {
        if self.pools.len() == 1 {
            self.pools.keys().next().map(String::as_str)
        } else {
            None
        }
    }

    /// Every backend across all clusters, for the liveness prober.
    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.pools
            .values()
            .flat_map(|pool| pool.backends().iter().cloned())
            .collect()
    }
}
