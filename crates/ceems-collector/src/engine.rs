//! Scrape orchestration
//!
//! One scrape: enumerate live compute-unit cgroups, run every enabled
//! sub-collector concurrently against that snapshot, join their outputs
//! and serialize the union. A sub-collector exceeding its timeout is
//! cancelled and its partial output dropped; per-collector duration and
//! success self-metrics are appended unconditionally.

use crate::cgroups::{Cgroup, CgroupManager};
use crate::config::CollectorConfig;
use crate::exposition::{encode, Sample};
use crate::gpu::GpuResolver;
use crate::ipmi::IpmiCollector;
use crate::perf::PerfCollector;
use crate::resource::{new_resource_manager, ResourceManager};
use crate::{hostname, CollectorError, Result};
use ceems_core::NAMESPACE;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One sub-collector in the scrape pipeline.
///
/// `collect` runs on a blocking thread; implementations are free to do
/// file and subprocess I/O. Outputs within one scrape carry no defined
/// ordering: consumers must treat the metrics as a set.
pub trait Collector: Send + Sync {
    /// Short name used in self-metric labels and flags.
    fn name(&self) -> &'static str;

    /// Produce samples scoped to the given compute units.
    fn collect(&self, cgroups: &[Cgroup]) -> Result<Vec<Sample>>;
}

impl Collector for PerfCollector {
    fn name(&self) -> &'static str {
        "perf"
    }

    fn collect(&self, cgroups: &[Cgroup]) -> Result<Vec<Sample>> {
        PerfCollector::collect(self, cgroups)
    }
}

impl Collector for IpmiCollector {
    fn name(&self) -> &'static str {
        "ipmi_dcmi"
    }

    fn collect(&self, _cgroups: &[Cgroup]) -> Result<Vec<Sample>> {
        Ok(IpmiCollector::collect(self))
    }
}

/// Emits unit metadata: ownership labels from the resource manager
/// adapter and GPU ordinal ownership from the resolver.
pub struct UnitsCollector {
    manager: String,
    hostname: String,
    resource_manager: Arc<dyn ResourceManager>,
    gpu_resolver: Option<GpuResolver>,
}

impl UnitsCollector {
    /// Create the metadata collector.
    pub fn new(
        manager: String,
        hostname: String,
        resource_manager: Arc<dyn ResourceManager>,
        gpu_resolver: Option<GpuResolver>,
    ) -> Self {
        Self {
            manager,
            hostname,
            resource_manager,
            gpu_resolver,
        }
    }
}

impl Collector for UnitsCollector {
    fn name(&self) -> &'static str {
        "units"
    }

    fn collect(&self, cgroups: &[Cgroup]) -> Result<Vec<Sample>> {
        let mut samples = Vec::new();

        // GPU map comes from the adapter when the scheduler publishes
        // one, otherwise from the resolver side channel
        let mut gpu_map = self.resource_manager.fetch_gpu_map().unwrap_or_default();
        if gpu_map.is_empty() {
            if let Some(resolver) = &self.gpu_resolver {
                match resolver.resolve() {
                    Ok(map) => gpu_map = map,
                    Err(e) => debug!(error = %e, "GPU ownership resolution failed"),
                }
            }
        }

        for cgroup in cgroups {
            let props = self
                .resource_manager
                .fetch_props(&cgroup.uuid, cgroup)
                .unwrap_or_default();

            samples.push(
                Sample::gauge(
                    format!("{}_compute_unit_info", NAMESPACE),
                    "Metadata of an active compute unit",
                    1.0,
                )
                .with_label("manager", self.manager.clone())
                .with_label("hostname", self.hostname.clone())
                .with_label("uuid", cgroup.uuid.clone())
                .with_label("username", props.user.clone().unwrap_or_default())
                .with_label("project", props.project.clone().unwrap_or_default()),
            );

            samples.push(
                Sample::gauge(
                    format!("{}_compute_unit_procs", NAMESPACE),
                    "Number of processes in the compute unit cgroup",
                    cgroup.procs.len() as f64,
                )
                .with_label("manager", self.manager.clone())
                .with_label("hostname", self.hostname.clone())
                .with_label("uuid", cgroup.uuid.clone()),
            );
        }

        for (ordinal, uuid) in gpu_map {
            // Only report GPUs owned by a unit we actually observed
            if !cgroups.iter().any(|c| c.uuid == uuid) {
                continue;
            }

            samples.push(
                Sample::gauge(
                    format!("{}_compute_unit_gpu_index_flag", NAMESPACE),
                    "GPU ordinal to compute unit ownership",
                    1.0,
                )
                .with_label("manager", self.manager.clone())
                .with_label("hostname", self.hostname.clone())
                .with_label("uuid", uuid)
                .with_label("index", ordinal.to_string()),
            );
        }

        Ok(samples)
    }
}

/// The scrape pipeline: cgroup discovery plus the enabled sub-collectors.
pub struct CollectorEngine {
    cgroup_manager: CgroupManager,
    collectors: Vec<Arc<dyn Collector>>,
    collector_timeout: Duration,
}

impl CollectorEngine {
    /// Build the engine from configuration, constructing every enabled
    /// sub-collector. An explicitly enabled collector that cannot be
    /// constructed (missing capability, bad sysctl) is a startup error.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let host = hostname();
        let manager_kind = config.resource_manager.kind;
        let cgroup_manager = CgroupManager::new(manager_kind, &config.cgroups)?;

        let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();

        let resource_manager = new_resource_manager(&config.resource_manager)?;
        let gpu_resolver = if config.gpu.enabled {
            Some(GpuResolver::new(&config.gpu)?)
        } else {
            None
        };
        collectors.push(Arc::new(UnitsCollector::new(
            manager_kind.to_string(),
            host.clone(),
            resource_manager,
            gpu_resolver,
        )));

        if config.perf.any_enabled() {
            let perf = PerfCollector::new(
                host.clone(),
                manager_kind.to_string(),
                config.perf.clone(),
                &config.cgroups.procfs_root,
                cgroup_manager.ignore_proc_regex(),
            )?;
            collectors.push(Arc::new(perf));
        }

        if config.ipmi.enabled {
            collectors.push(Arc::new(IpmiCollector::new(host.clone(), &config.ipmi)?));
        }

        info!(
            collectors = ?collectors.iter().map(|c| c.name()).collect::<Vec<_>>(),
            "Initialized collector engine"
        );

        Ok(Self {
            cgroup_manager,
            collectors,
            collector_timeout: Duration::from_secs(config.collector_timeout_seconds),
        })
    }

    /// Assemble an engine from parts; used by tests and embedders.
    pub fn from_parts(
        cgroup_manager: CgroupManager,
        collectors: Vec<Arc<dyn Collector>>,
        collector_timeout: Duration,
    ) -> Self {
        Self {
            cgroup_manager,
            collectors,
            collector_timeout,
        }
    }

    /// Run one scrape and serialize the result into the Prometheus text
    /// format.
    pub async fn scrape(self: &Arc<Self>) -> Result<String> {
        let engine = Arc::clone(self);
        let cgroups = tokio::task::spawn_blocking(move || engine.cgroup_manager.discover())
            .await
            .map_err(|e| CollectorError::Other(anyhow::anyhow!("discovery task failed: {}", e)))??;

        debug!(units = cgroups.len(), "Discovered compute unit cgroups");
        let cgroups = Arc::new(cgroups);

        let mut tasks = Vec::with_capacity(self.collectors.len());

        for collector in &self.collectors {
            let name = collector.name();
            let collector = Arc::clone(collector);
            let cgroups = Arc::clone(&cgroups);
            let timeout = self.collector_timeout;

            tasks.push(tokio::spawn(async move {
                let start = Instant::now();
                let outcome = tokio::time::timeout(
                    timeout,
                    tokio::task::spawn_blocking(move || collector.collect(&cgroups)),
                )
                .await;

                let duration = start.elapsed();

                let samples = match outcome {
                    Ok(Ok(Ok(samples))) => Some(samples),
                    Ok(Ok(Err(e))) => {
                        warn!(collector = name, error = %e, "Sub-collector failed");
                        None
                    }
                    Ok(Err(e)) => {
                        warn!(collector = name, error = %e, "Sub-collector panicked");
                        None
                    }
                    Err(_) => {
                        warn!(collector = name, ?timeout, "Sub-collector timed out, dropping output");
                        None
                    }
                };

                (name, duration, samples)
            }));
        }

        let mut samples = Vec::new();

        for task in tasks {
            let (name, duration, output) = task
                .await
                .map_err(|e| CollectorError::Other(anyhow::anyhow!("collector task failed: {}", e)))?;

            let success = output.is_some();
            if let Some(collected) = output {
                samples.extend(collected);
            }

            samples.push(
                Sample::gauge(
                    format!("{}_scrape_collector_duration_seconds", NAMESPACE),
                    "Duration of a sub-collector scrape",
                    duration.as_secs_f64(),
                )
                .with_label("collector", name),
            );
            samples.push(
                Sample::gauge(
                    format!("{}_scrape_collector_success", NAMESPACE),
                    "Whether a sub-collector succeeded",
                    if success { 1.0 } else { 0.0 },
                )
                .with_label("collector", name),
            );
        }

        encode(&samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CgroupConfig;
    use ceems_core::ResourceManagerKind;
    use std::fs;
    use std::path::PathBuf;

    struct StaticCollector {
        name: &'static str,
        samples: Vec<Sample>,
    }

    impl Collector for StaticCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn collect(&self, _cgroups: &[Cgroup]) -> Result<Vec<Sample>> {
            Ok(self.samples.clone())
        }
    }

    struct FailingCollector;

    impl Collector for FailingCollector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn collect(&self, _cgroups: &[Cgroup]) -> Result<Vec<Sample>> {
            Err(CollectorError::Subprocess("tool vanished".to_string()))
        }
    }

    struct SlowCollector;

    impl Collector for SlowCollector {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn collect(&self, _cgroups: &[Cgroup]) -> Result<Vec<Sample>> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(vec![Sample::gauge("should_not_appear", "late output", 1.0)])
        }
    }

    fn test_manager() -> (tempfile::TempDir, CgroupManager) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu\n").unwrap();
        let leaf = dir.path().join("slurm/uid_1000/job_1481508");
        fs::create_dir_all(&leaf).unwrap();
        fs::write(leaf.join("cgroup.procs"), "42\n43\n").unwrap();

        let config = CgroupConfig {
            root: dir.path().to_path_buf(),
            procfs_root: PathBuf::from("/proc"),
            uuid_sidecar_dir: None,
            uuid_env_var: None,
        };
        let manager = CgroupManager::new(ResourceManagerKind::Slurm, &config).unwrap();
        (dir, manager)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scrape_merges_collectors() {
        let (_dir, manager) = test_manager();

        let engine = Arc::new(CollectorEngine::from_parts(
            manager,
            vec![
                Arc::new(StaticCollector {
                    name: "alpha",
                    samples: vec![Sample::counter("alpha_total", "alpha", 1.0)],
                }),
                Arc::new(StaticCollector {
                    name: "beta",
                    samples: vec![Sample::counter("beta_total", "beta", 2.0)],
                }),
            ],
            Duration::from_secs(5),
        ));

        let out = engine.scrape().await.unwrap();

        assert!(out.contains("alpha_total 1"));
        assert!(out.contains("beta_total 2"));
        assert!(out.contains(r#"ceems_scrape_collector_success{collector="alpha"} 1"#));
        assert!(out.contains(r#"ceems_scrape_collector_success{collector="beta"} 1"#));
        assert!(out.contains("ceems_scrape_collector_duration_seconds"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_collector_keeps_others() {
        let (_dir, manager) = test_manager();

        let engine = Arc::new(CollectorEngine::from_parts(
            manager,
            vec![
                Arc::new(StaticCollector {
                    name: "alpha",
                    samples: vec![Sample::counter("alpha_total", "alpha", 1.0)],
                }),
                Arc::new(FailingCollector),
            ],
            Duration::from_secs(5),
        ));

        let out = engine.scrape().await.unwrap();

        assert!(out.contains("alpha_total 1"));
        assert!(out.contains(r#"ceems_scrape_collector_success{collector="failing"} 0"#));
        assert!(out.contains(r#"ceems_scrape_collector_success{collector="alpha"} 1"#));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timed_out_collector_output_dropped() {
        let (_dir, manager) = test_manager();

        let engine = Arc::new(CollectorEngine::from_parts(
            manager,
            vec![Arc::new(SlowCollector)],
            Duration::from_millis(50),
        ));

        let out = engine.scrape().await.unwrap();

        assert!(!out.contains("should_not_appear"));
        assert!(out.contains(r#"ceems_scrape_collector_success{collector="slow"} 0"#));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_units_collector_emits_metadata() {
        use crate::resource::MockAdapter;
        use ceems_core::JobProps;

        let (_dir, manager) = test_manager();

        let adapter = MockAdapter::new()
            .with_props(
                "1481508",
                JobProps {
                    user: Some("usr2".to_string()),
                    project: Some("acc2".to_string()),
                    gpu_ordinals: vec![0, 1],
                    ..Default::default()
                },
            )
            .with_gpu(0, "1481508")
            .with_gpu(1, "1481508");

        let units = UnitsCollector::new(
            "slurm".to_string(),
            "n1".to_string(),
            Arc::new(adapter),
            None,
        );

        let engine = Arc::new(CollectorEngine::from_parts(
            manager,
            vec![Arc::new(units)],
            Duration::from_secs(5),
        ));

        let out = engine.scrape().await.unwrap();

        assert!(out.contains("ceems_compute_unit_info"));
        assert!(out.contains(r#"username="usr2""#));
        assert!(out.contains(r#"project="acc2""#));
        assert!(out.contains(r#"uuid="1481508""#));
        assert!(out.contains("ceems_compute_unit_gpu_index_flag"));
        assert!(out.contains(r#"index="0""#));
        assert!(out.contains(r#"index="1""#));
        assert!(out.contains(r#"ceems_compute_unit_procs{"#));
    }
}
