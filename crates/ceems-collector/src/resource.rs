//! Resource manager adapters
//!
//! Adapters enrich discovered cgroups with scheduler metadata: owner,
//! account, GPU ordinals, QoS and partition. Adapters are read-only and
//! idempotent; they never mutate scheduler state. A missing props file
//! for a known UUID yields an empty [`JobProps`], never an error, so the
//! unit is still exported, just without ownership labels.

use crate::cgroups::Cgroup;
use crate::config::ResourceManagerConfig;
use crate::{CollectorError, Result};
use ceems_core::{JobProps, ResourceManagerKind};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Reads job properties and GPU ownership from one resource manager.
///
/// Selection is static per process: the adapter is constructed once at
/// startup from configuration.
pub trait ResourceManager: Send + Sync {
    /// Scheduler metadata for the unit backing `cgroup`.
    fn fetch_props(&self, uuid: &str, cgroup: &Cgroup) -> Result<JobProps>;

    /// Map of GPU ordinal to owning unit UUID, when the scheduler
    /// publishes one. Adapters without GPU knowledge return an empty map.
    fn fetch_gpu_map(&self) -> Result<HashMap<u32, String>>;
}

/// Build the adapter selected by configuration.
pub fn new_resource_manager(config: &ResourceManagerConfig) -> Result<Arc<dyn ResourceManager>> {
    match (config.kind, config.use_procfs) {
        // Without a props directory the SLURM environment is the only
        // metadata source left
        (ResourceManagerKind::Slurm, false) => match config.props_dir.clone() {
            Some(props_dir) => Ok(Arc::new(SlurmFileAdapter::new(props_dir))),
            None => Ok(Arc::new(SlurmProcAdapter::new())),
        },
        (ResourceManagerKind::Slurm, true) => Ok(Arc::new(SlurmProcAdapter::new())),
        (ResourceManagerKind::Openstack, _) => {
            let props_dir = config.props_dir.clone().ok_or_else(|| {
                CollectorError::configuration("openstack adapter requires props_dir")
            })?;
            Ok(Arc::new(OpenStackAdapter::new(props_dir)))
        }
        (kind, _) => Err(CollectorError::configuration(format!(
            "no adapter available for resource manager {}",
            kind
        ))),
    }
}

/// Parse the `key=value` job property notation written by scheduler
/// prolog hooks, e.g. `user=usr2,account=acc2,gpu=0,1`.
///
/// Values may themselves contain commas (GPU ordinal lists); a token
/// without `=` continues the previous value.
fn parse_props(raw: &str) -> JobProps {
    let mut pairs: Vec<(String, String)> = Vec::new();

    for token in raw.trim().split(',') {
        match token.split_once('=') {
            Some((key, value)) => pairs.push((key.trim().to_string(), value.trim().to_string())),
            None => {
                if let Some(last) = pairs.last_mut() {
                    last.1.push(',');
                    last.1.push_str(token.trim());
                }
            }
        }
    }

    let mut props = JobProps::default();

    for (key, value) in pairs {
        match key.as_str() {
            "user" => props.user = Some(value),
            "account" | "project" => props.project = Some(value),
            "gpu" | "gpus" => {
                props.gpu_ordinals = value
                    .split(',')
                    .filter_map(|v| v.trim().parse::<u32>().ok())
                    .collect()
            }
            "qos" => props.qos = Some(value),
            "partition" => props.partition = Some(value),
            _ => {}
        }
    }

    props
}

/// SLURM adapter backed by per-UUID files a prolog script writes into a
/// configured directory.
pub struct SlurmFileAdapter {
    props_dir: PathBuf,
}

impl SlurmFileAdapter {
    /// Create an adapter reading `props_dir/job_<uuid>` (falling back to
    /// `props_dir/<uuid>`).
    pub fn new(props_dir: PathBuf) -> Self {
        Self { props_dir }
    }
}

impl ResourceManager for SlurmFileAdapter {
    fn fetch_props(&self, uuid: &str, _cgroup: &Cgroup) -> Result<JobProps> {
        let candidates = [
            self.props_dir.join(format!("job_{}", uuid)),
            self.props_dir.join(uuid),
        ];

        for path in candidates {
            match fs::read_to_string(&path) {
                Ok(raw) => return Ok(parse_props(&raw)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Unreadable props file");
                    continue;
                }
            }
        }

        Ok(JobProps::default())
    }

    fn fetch_gpu_map(&self) -> Result<HashMap<u32, String>> {
        Ok(HashMap::new())
    }
}

/// SLURM adapter reading `SLURM_*` variables from the environment of the
/// unit's processes. Requires the trace capabilities the perf env filter
/// already holds.
pub struct SlurmProcAdapter;

impl SlurmProcAdapter {
    /// Create the procfs-backed adapter.
    pub fn new() -> Self {
        Self
    }
}

impl Default for SlurmProcAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager for SlurmProcAdapter {
    fn fetch_props(&self, uuid: &str, cgroup: &Cgroup) -> Result<JobProps> {
        let mut props = JobProps::default();

        for proc in &cgroup.procs {
            // Only trust processes that actually belong to this unit
            match proc.env_var("SLURM_JOB_ID") {
                Some(job_id) if job_id == uuid => {}
                _ => continue,
            }

            props.user = proc.env_var("SLURM_JOB_USER");
            props.project = proc.env_var("SLURM_JOB_ACCOUNT");
            props.qos = proc.env_var("SLURM_JOB_QOS");
            props.partition = proc.env_var("SLURM_JOB_PARTITION");

            if let Some(ordinals) = proc.env_var("SLURM_JOB_GPUS") {
                props.gpu_ordinals = ordinals
                    .split(',')
                    .filter_map(|v| v.trim().parse::<u32>().ok())
                    .collect();
            }

            break;
        }

        Ok(props)
    }

    fn fetch_gpu_map(&self) -> Result<HashMap<u32, String>> {
        Ok(HashMap::new())
    }
}

/// OpenStack nova adapter reading per-instance property files.
pub struct OpenStackAdapter {
    props_dir: PathBuf,
}

impl OpenStackAdapter {
    /// Create an adapter reading `props_dir/<instance-uuid>`.
    pub fn new(props_dir: PathBuf) -> Self {
        Self { props_dir }
    }
}

impl ResourceManager for OpenStackAdapter {
    fn fetch_props(&self, uuid: &str, _cgroup: &Cgroup) -> Result<JobProps> {
        match fs::read_to_string(self.props_dir.join(uuid)) {
            Ok(raw) => Ok(parse_props(&raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobProps::default()),
            Err(e) => {
                debug!(uuid, error = %e, "Unreadable instance props file");
                Ok(JobProps::default())
            }
        }
    }

    fn fetch_gpu_map(&self) -> Result<HashMap<u32, String>> {
        Ok(HashMap::new())
    }
}

/// Fixed-response adapter for tests.
#[derive(Debug, Default)]
pub struct MockAdapter {
    props: HashMap<String, JobProps>,
    gpu_map: HashMap<u32, String>,
}

impl MockAdapter {
    /// Empty mock returning default props for everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register props for a UUID.
    pub fn with_props(mut self, uuid: impl Into<String>, props: JobProps) -> Self {
        self.props.insert(uuid.into(), props);
        self
    }

    /// Register a GPU ownership entry.
    pub fn with_gpu(mut self, ordinal: u32, uuid: impl Into<String>) -> Self {
        self.gpu_map.insert(ordinal, uuid.into());
        self
    }
}

impl ResourceManager for MockAdapter {
    fn fetch_props(&self, uuid: &str, _cgroup: &Cgroup) -> Result<JobProps> {
        Ok(self.props.get(uuid).cloned().unwrap_or_default())
    }

    fn fetch_gpu_map(&self) -> Result<HashMap<u32, String>> {
        Ok(self.gpu_map.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn dummy_cgroup(uuid: &str) -> Cgroup {
        Cgroup {
            path: PathBuf::from(format!("/sys/fs/cgroup/slurm/uid_1000/job_{}", uuid)),
            uuid: uuid.to_string(),
            procs: vec![],
        }
    }

    #[test]
    fn test_parse_props_basic() {
        let props = parse_props("user=usr2,account=acc2,qos=normal,partition=gpu");
        assert_eq!(props.user.as_deref(), Some("usr2"));
        assert_eq!(props.project.as_deref(), Some("acc2"));
        assert_eq!(props.qos.as_deref(), Some("normal"));
        assert_eq!(props.partition.as_deref(), Some("gpu"));
    }

    #[test]
    fn test_parse_props_gpu_list_with_commas() {
        let props = parse_props("user=usr2,account=acc2,gpu=0,1");
        assert_eq!(props.user.as_deref(), Some("usr2"));
        assert_eq!(props.gpu_ordinals, vec![0, 1]);
    }

    #[test]
    fn test_parse_props_empty() {
        assert!(parse_props("").is_empty());
        assert!(parse_props("   \n").is_empty());
    }

    #[test]
    fn test_slurm_file_adapter() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("job_1481508"),
            "user=usr2,account=acc2,gpu=0,1\n",
        )
        .unwrap();

        let adapter = SlurmFileAdapter::new(dir.path().to_path_buf());

        let props = adapter
            .fetch_props("1481508", &dummy_cgroup("1481508"))
            .unwrap();
        assert_eq!(props.user.as_deref(), Some("usr2"));
        assert_eq!(props.project.as_deref(), Some("acc2"));
        assert_eq!(props.gpu_ordinals, vec![0, 1]);
    }

    #[test]
    fn test_missing_props_file_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SlurmFileAdapter::new(dir.path().to_path_buf());

        let props = adapter
            .fetch_props("9999999", &dummy_cgroup("9999999"))
            .unwrap();
        assert!(props.is_empty());
    }

    #[test]
    fn test_fetch_props_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("job_1"), "user=usr1,account=acc1\n").unwrap();

        let adapter = SlurmFileAdapter::new(dir.path().to_path_buf());
        let cgroup = dummy_cgroup("1");

        let first = adapter.fetch_props("1", &cgroup).unwrap();
        let second = adapter.fetch_props("1", &cgroup).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_mock_adapter() {
        let adapter = MockAdapter::new()
            .with_props(
                "1481508",
                JobProps {
                    user: Some("usr2".to_string()),
                    ..Default::default()
                },
            )
            .with_gpu(0, "1481508")
            .with_gpu(1, "1481508");

        let props = adapter
            .fetch_props("1481508", &dummy_cgroup("1481508"))
            .unwrap();
        assert_eq!(props.user.as_deref(), Some("usr2"));

        let gpu_map = adapter.fetch_gpu_map().unwrap();
        assert_eq!(gpu_map.get(&0).map(String::as_str), Some("1481508"));
        assert_eq!(gpu_map.get(&1).map(String::as_str), Some("1481508"));
    }

    #[test]
    fn test_adapter_factory() {
        // SLURM without a props dir falls back to the procfs adapter
        let config = ResourceManagerConfig {
            kind: ResourceManagerKind::Slurm,
            props_dir: None,
            use_procfs: false,
        };
        assert!(new_resource_manager(&config).is_ok());

        // OpenStack strictly requires the nova sidecar directory
        let config = ResourceManagerConfig {
            kind: ResourceManagerKind::Openstack,
            props_dir: None,
            use_procfs: false,
        };
        assert!(new_resource_manager(&config).is_err());
    }
}
