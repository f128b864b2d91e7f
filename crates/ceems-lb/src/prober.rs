//! Background backend liveness probing
//!
//! Polls every backend's status endpoint at a fixed interval, probing
//! different backends concurrently. One failed probe marks a backend
//! dead, one success marks it alive again, so liveness changes are
//! observable no later than one interval after the condition. The same
//! probe refreshes the retention cache as a side effect.

use crate::pool::ClusterPools;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Spawn the prober task. Runs until the process exits.
pub fn spawn_prober(
    pools: Arc<ClusterPools>,
    interval: Duration,
    probe_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(probe_timeout).build() {
            Ok(client) => client,
            Err(e) => {
                // Never probing would leave every backend frozen alive
                panic!("failed to build probe client: {}", e);
            }
        };

        info!(?interval, "Starting backend liveness prober");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let probes = pools.all_backends().into_iter().map(|backend| {
                let client = client.clone();
                async move {
                    let was_alive = backend.is_alive();
                    let alive = backend.refresh_status(&client).await;
                    backend.set_alive(alive);

                    if was_alive != alive {
                        debug!(backend = %backend.url(), alive, "Backend liveness changed");
                    }
                }
            });

            join_all(probes).await;
        }
    })
}
