//! Configuration for the collector engine

use crate::{CollectorError, Result};
use ceems_core::ResourceManagerKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete configuration for the collector engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Address the /metrics endpoint binds to
    pub listen_address: String,

    /// Identifier of the cluster this node belongs to
    pub cluster_id: String,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Cgroup discovery configuration
    pub cgroups: CgroupConfig,

    /// Resource manager adapter configuration
    pub resource_manager: ResourceManagerConfig,

    /// GPU ownership resolution configuration
    pub gpu: GpuConfig,

    /// Perf counter collector configuration
    pub perf: PerfConfig,

    /// IPMI DCMI power collector configuration
    pub ipmi: IpmiConfig,

    /// Per-sub-collector timeout (seconds); a sub-collector exceeding it
    /// is cancelled and its partial output dropped
    pub collector_timeout_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

/// Cgroup discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Cgroup filesystem root: `/sys/fs/cgroup` for the unified
    /// hierarchy, `/sys/fs/cgroup/<controller>` for legacy
    pub root: PathBuf,

    /// procfs mount point
    pub procfs_root: PathBuf,

    /// Directory of scheduler-written files mapping cgroup leaf names to
    /// unit UUIDs, when the sidecar mapping strategy is enabled
    pub uuid_sidecar_dir: Option<PathBuf>,

    /// Environment variable carrying the unit UUID, when the environ
    /// mapping strategy is enabled
    pub uuid_env_var: Option<String>,
}

/// Resource manager adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceManagerConfig {
    /// Which resource manager schedules work on this node
    pub kind: ResourceManagerKind,

    /// Directory of per-UUID job property files (file-backed adapters)
    pub props_dir: Option<PathBuf>,

    /// Read job properties from `/proc/<pid>/environ` instead of files
    pub use_procfs: bool,
}

/// GPU ownership resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuConfig {
    /// Enable GPU ownership resolution
    pub enabled: bool,

    /// Vendor query command emitting `index, uuid` CSV rows
    pub smi_command: Option<String>,

    /// Directory with one file per GPU ordinal naming the owning UUID
    pub sidecar_dir: Option<PathBuf>,
}

/// Perf counter collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfConfig {
    /// Collect hardware events (cycles, instructions, branches, cache)
    pub hardware_events: bool,

    /// Collect software events (faults, context switches, migrations)
    pub software_events: bool,

    /// Collect hardware cache events (L1/LL/TLB/BPU hits and misses)
    pub cache_events: bool,

    /// Profile a cgroup only when at least one of its processes carries
    /// an environment variable with one of these prefixes. Empty means
    /// profile everything.
    pub target_env_vars: Vec<String>,
}

impl PerfConfig {
    /// True when any perf profiler family is enabled.
    pub fn any_enabled(&self) -> bool {
        self.hardware_events || self.software_events || self.cache_events
    }
}

/// IPMI DCMI power collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpmiConfig {
    /// Enable the power collector
    pub enabled: bool,

    /// IPMI DCMI command reporting system power statistics. Use full
    /// paths to executables.
    pub command: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9010".to_string(),
            cluster_id: "default".to_string(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
            cgroups: CgroupConfig {
                root: PathBuf::from("/sys/fs/cgroup"),
                procfs_root: PathBuf::from("/proc"),
                uuid_sidecar_dir: None,
                uuid_env_var: None,
            },
            resource_manager: ResourceManagerConfig {
                kind: ResourceManagerKind::Slurm,
                props_dir: None,
                use_procfs: false,
            },
            gpu: GpuConfig {
                enabled: false,
                smi_command: Some("/usr/bin/nvidia-smi --query-gpu=index,uuid --format=csv,noheader".to_string()),
                sidecar_dir: None,
            },
            perf: PerfConfig {
                hardware_events: false,
                software_events: false,
                cache_events: false,
                target_env_vars: Vec::new(),
            },
            ipmi: IpmiConfig {
                enabled: true,
                command: "/usr/sbin/ipmi-dcmi --get-system-power-statistics".to_string(),
            },
            collector_timeout_seconds: 10,
        }
    }
}

impl CollectorConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| CollectorError::configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !self.cgroups.root.is_absolute() {
            return Err(CollectorError::configuration(format!(
                "cgroup root must be absolute: {}",
                self.cgroups.root.display()
            )));
        }

        if !self.cgroups.procfs_root.is_absolute() {
            return Err(CollectorError::configuration(format!(
                "procfs root must be absolute: {}",
                self.cgroups.procfs_root.display()
            )));
        }

        if self.gpu.enabled && self.gpu.smi_command.is_none() && self.gpu.sidecar_dir.is_none() {
            return Err(CollectorError::configuration(
                "GPU resolution enabled but neither smi_command nor sidecar_dir set",
            ));
        }

        if self.ipmi.enabled && self.ipmi.command.trim().is_empty() {
            return Err(CollectorError::configuration("empty IPMI command"));
        }

        if self.collector_timeout_seconds == 0 {
            return Err(CollectorError::configuration("collector timeout must be non-zero"));
        }

        Ok(())
    }
}
