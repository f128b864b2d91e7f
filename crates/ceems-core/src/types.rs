//! Core type definitions for CEEMS

use serde::{Deserialize, Serialize};
use std::fmt;

/// The resource manager a compute unit was scheduled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceManagerKind {
    /// SLURM batch jobs and job steps
    Slurm,
    /// OpenStack nova instances
    Openstack,
    /// Kubernetes pods
    K8s,
}

impl std::str::FromStr for ResourceManagerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slurm" => Ok(ResourceManagerKind::Slurm),
            "openstack" => Ok(ResourceManagerKind::Openstack),
            "k8s" => Ok(ResourceManagerKind::K8s),
            _ => Err(format!("Unknown resource manager: {}", s)),
        }
    }
}

impl fmt::Display for ResourceManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceManagerKind::Slurm => write!(f, "slurm"),
            ResourceManagerKind::Openstack => write!(f, "openstack"),
            ResourceManagerKind::K8s => write!(f, "k8s"),
        }
    }
}

/// Scheduler metadata attached to a compute unit.
///
/// All fields are optional: a missing props file for a known unit yields
/// an empty `JobProps`, never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProps {
    /// Owning user
    pub user: Option<String>,

    /// Owning project or account
    pub project: Option<String>,

    /// Ordinals of GPUs allocated to the unit
    pub gpu_ordinals: Vec<u32>,

    /// Quality of service class
    pub qos: Option<String>,

    /// Scheduler partition
    pub partition: Option<String>,
}

impl JobProps {
    /// True when no scheduler metadata was recovered for the unit.
    pub fn is_empty(&self) -> bool {
        self.user.is_none()
            && self.project.is_none()
            && self.gpu_ordinals.is_empty()
            && self.qos.is_none()
            && self.partition.is_none()
    }
}

/// An atomic, schedulable workload: a SLURM job or step, an OpenStack
/// instance or a k8s pod.
///
/// `(cluster_id, uuid, started_at)` is globally unique. A unit is created
/// when first observed in cgroup enumeration, updated on every scrape and
/// terminal when its cgroup disappears with an end time recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeUnit {
    /// Unit identifier assigned by the scheduler
    pub uuid: String,

    /// Identifier of the cluster the unit runs on
    pub cluster_id: String,

    /// Resource manager that scheduled the unit
    pub manager: ResourceManagerKind,

    /// Scheduler metadata
    pub props: JobProps,

    /// Number of CPUs allocated
    pub cpus: u64,

    /// Bytes of memory allocated
    pub mem_bytes: u64,

    /// Unix timestamp (ms) the unit started, if known
    pub started_at: Option<i64>,

    /// Unix timestamp (ms) the unit ended; `None` while running
    pub ended_at: Option<i64>,
}

impl ComputeUnit {
    /// Create a unit first observed in cgroup enumeration.
    pub fn new(uuid: impl Into<String>, cluster_id: impl Into<String>, manager: ResourceManagerKind) -> Self {
        Self {
            uuid: uuid.into(),
            cluster_id: cluster_id.into(),
            manager,
            props: JobProps::default(),
            cpus: 0,
            mem_bytes: 0,
            started_at: None,
            ended_at: None,
        }
    }

    /// True while the unit's cgroup is still present.
    pub fn is_running(&self) -> bool {
        self.ended_at.is_none()
    }
}
