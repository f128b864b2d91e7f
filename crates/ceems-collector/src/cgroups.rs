//! Compute-unit cgroup discovery
//!
//! Every compute unit maps to one leaf directory in the cgroup
//! filesystem. The manager walks the configured root, accepts leaves
//! whose path carries the scheduler marker (e.g. `slurm/uid_*/job_*`),
//! reads the processes inside each leaf and derives the stable unit UUID
//! from the path, a scheduler-written sidecar file or process
//! environments, in that precedence order.

use crate::config::CgroupConfig;
use crate::{CollectorError, Result};
use ceems_core::ResourceManagerKind;
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Cap on directory nesting below the cgroup root; the scheduler
/// hierarchies of interest are at most a handful of levels deep.
const MAX_WALK_DEPTH: usize = 8;

/// A process observed inside a compute-unit cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcInfo {
    /// Kernel process id
    pub pid: i32,
}

impl ProcInfo {
    /// Command line of the process, joined with spaces. Empty when the
    /// process exited or the kernel hides it.
    pub fn cmdline(&self) -> String {
        procfs::process::Process::new(self.pid)
            .and_then(|p| p.cmdline())
            .map(|parts| parts.join(" "))
            .unwrap_or_default()
    }

    /// Environment of the process as raw `KEY=VALUE` strings. Reading a
    /// foreign process environment requires ptrace capability.
    pub fn environ(&self) -> Result<Vec<String>> {
        let env = procfs::process::Process::new(self.pid)?.environ()?;

        Ok(env
            .into_iter()
            .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
            .collect())
    }

    /// Value of one environment variable, if present.
    pub fn env_var(&self, name: &str) -> Option<String> {
        let env = procfs::process::Process::new(self.pid).ok()?.environ().ok()?;
        env.get(std::ffi::OsStr::new(name))
            .map(|v| v.to_string_lossy().into_owned())
    }
}

/// One live compute-unit cgroup and its process membership.
///
/// Invariant: every pid in `procs` was listed in this cgroup's procs file
/// at observation time; stale pids are evicted on every scrape because
/// discovery re-reads membership from scratch.
#[derive(Debug, Clone)]
pub struct Cgroup {
    /// Absolute path of the leaf directory
    pub path: PathBuf,

    /// Stable unit identifier derived for this cgroup
    pub uuid: String,

    /// Processes currently inside the cgroup
    pub procs: Vec<ProcInfo>,
}

/// Whether the kernel exposes the unified (v2) or a legacy per-controller
/// (v1) hierarchy under the configured root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    /// cgroup v2: membership in `cgroup.procs`
    Unified,
    /// cgroup v1: membership in the controller's `tasks` file
    Legacy,
}

impl CgroupMode {
    fn procs_file(&self) -> &'static str {
        match self {
            CgroupMode::Unified => "cgroup.procs",
            CgroupMode::Legacy => "tasks",
        }
    }
}

/// Discovers active compute-unit cgroups for one resource manager.
pub struct CgroupManager {
    root: PathBuf,
    mode: CgroupMode,
    manager: ResourceManagerKind,
    /// Substring marking a leaf as a compute-unit cgroup
    marker: &'static str,
    /// Extracts the UUID from the cgroup path
    path_regex: Regex,
    /// Matches scheduler helper processes that must never be profiled
    ignore_proc_regex: Option<Regex>,
    uuid_sidecar_dir: Option<PathBuf>,
    uuid_env_var: Option<String>,
}

impl CgroupManager {
    /// Create a manager for `kind` rooted at the configured cgroup fs.
    ///
    /// Fails when the root is missing or unreadable: permission problems
    /// on cgroupfs are fatal at startup.
    pub fn new(kind: ResourceManagerKind, config: &CgroupConfig) -> Result<Self> {
        fs::read_dir(&config.root).map_err(|e| {
            CollectorError::configuration(format!(
                "cannot read cgroup root {}: {}",
                config.root.display(),
                e
            ))
        })?;

        let mode = if config.root.join("cgroup.controllers").exists() {
            CgroupMode::Unified
        } else {
            CgroupMode::Legacy
        };

        let (marker, path_pattern, ignore_pattern) = match kind {
            ResourceManagerKind::Slurm => (
                "job_",
                r"job_(?P<uuid>\d+)",
                Some(r"(slurmstepd|sleep \d+|munged?)"),
            ),
            ResourceManagerKind::Openstack => (
                "instance-",
                r"instance-(?P<uuid>[0-9a-fA-F-]+)",
                None,
            ),
            ResourceManagerKind::K8s => (
                "pod",
                r"pod(?P<uuid>[0-9a-fA-F][0-9a-fA-F_-]+)",
                Some(r"(pause|containerd-shim)"),
            ),
        };

        let path_regex = Regex::new(path_pattern)
            .map_err(|e| CollectorError::configuration(format!("bad uuid pattern: {}", e)))?;
        let ignore_proc_regex = ignore_pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| CollectorError::configuration(format!("bad ignore pattern: {}", e)))?;

        debug!(root = %config.root.display(), ?mode, manager = %kind, "Initialized cgroup manager");

        Ok(Self {
            root: config.root.clone(),
            mode,
            manager: kind,
            marker,
            path_regex,
            ignore_proc_regex,
            uuid_sidecar_dir: config.uuid_sidecar_dir.clone(),
            uuid_env_var: config.uuid_env_var.clone(),
        })
    }

    /// Label value identifying the resource manager on emitted metrics.
    pub fn manager(&self) -> ResourceManagerKind {
        self.manager
    }

    /// Hierarchy mode detected at startup.
    pub fn mode(&self) -> CgroupMode {
        self.mode
    }

    /// Regex behind [`Self::ignore_proc`], for collectors that evaluate
    /// the predicate inside a security context.
    pub fn ignore_proc_regex(&self) -> Option<Regex> {
        self.ignore_proc_regex.clone()
    }

    /// Predicate matching scheduler helper processes (step daemons,
    /// sleep keepalives) that the env-var filter must always pass over.
    pub fn ignore_proc(&self, cmdline: &str) -> bool {
        self.ignore_proc_regex
            .as_ref()
            .map(|re| re.is_match(cmdline))
            .unwrap_or(false)
    }

    /// Enumerate the leaf cgroups of live compute units together with
    /// their process membership.
    ///
    /// Transient errors on individual units (a cgroup removed mid-walk, a
    /// process exited between listing and read) skip that unit only.
    pub fn discover(&self) -> Result<Vec<Cgroup>> {
        let mut leaves = Vec::new();
        self.walk(&self.root, 0, &mut leaves)?;

        let mut cgroups = Vec::with_capacity(leaves.len());

        for path in leaves {
            let procs = match self.read_procs(&path) {
                Ok(procs) => procs,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable cgroup");
                    continue;
                }
            };

            let Some(uuid) = self.derive_uuid(&path, &procs) else {
                debug!(path = %path.display(), "No UUID derivable for cgroup");
                continue;
            };

            cgroups.push(Cgroup { path, uuid, procs });
        }

        Ok(cgroups)
    }

    /// Depth-first walk collecting marked leaves. Descent stops at an
    /// accepted leaf, so nested job substructure (steps, slices) is
    /// folded into its unit.
    fn walk(&self, dir: &Path, depth: usize, out: &mut Vec<PathBuf>) -> Result<()> {
        if depth > MAX_WALK_DEPTH {
            return Ok(());
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            // The subtree vanished between listing and descent
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if depth > 0 => {
                debug!(dir = %dir.display(), error = %e, "Skipping unreadable cgroup subtree");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let name = entry.file_name();
            if name.to_string_lossy().contains(self.marker) {
                out.push(path);
                // SkipDir semantics: do not descend below an accepted leaf
                continue;
            }

            self.walk(&path, depth + 1, out)?;
        }

        Ok(())
    }

    /// Read pids from the membership file of a leaf. Pids that exited
    /// between listing and read simply fail later procfs lookups and are
    /// skipped by consumers.
    fn read_procs(&self, path: &Path) -> Result<Vec<ProcInfo>> {
        let raw = fs::read_to_string(path.join(self.mode.procs_file()))?;

        Ok(raw
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .map(|pid| ProcInfo { pid })
            .collect())
    }

    /// Derive the unit UUID for a leaf cgroup.
    ///
    /// Precedence when several strategies are configured: sidecar file,
    /// then path regex, then process environ. When multiple processes
    /// yield different UUIDs the lexicographically smallest wins and the
    /// conflict is logged.
    fn derive_uuid(&self, path: &Path, procs: &[ProcInfo]) -> Option<String> {
        if let Some(dir) = &self.uuid_sidecar_dir {
            if let Some(name) = path.file_name() {
                if let Ok(raw) = fs::read_to_string(dir.join(name)) {
                    let uuid = raw.trim().to_string();
                    if !uuid.is_empty() {
                        return Some(uuid);
                    }
                }
            }
        }

        if let Some(captures) = self.path_regex.captures(&path.to_string_lossy()) {
            if let Some(uuid) = captures.name("uuid") {
                return Some(uuid.as_str().to_string());
            }
        }

        if let Some(var) = &self.uuid_env_var {
            let candidates: BTreeSet<String> =
                procs.iter().filter_map(|p| p.env_var(var)).collect();

            if candidates.len() > 1 {
                warn!(
                    path = %path.display(),
                    candidates = ?candidates,
                    "Processes in one cgroup disagree on unit UUID, taking smallest"
                );
            }

            // BTreeSet iterates in lexicographic order
            return candidates.into_iter().next();
        }

        None
    }
}

/// Drop cgroups (and processes within them) that do not carry any of the
/// target environment variable prefixes. Processes matching the
/// manager's ignore predicate are never used as evidence. An empty
/// target list disables filtering.
pub fn filter_cgroups_by_env(
    cgroups: Vec<Cgroup>,
    target_env_vars: &[String],
    ignore_proc: impl Fn(&str) -> bool,
) -> Vec<Cgroup> {
    if target_env_vars.is_empty() {
        return cgroups;
    }

    let mut filtered = Vec::new();

    for mut cgroup in cgroups {
        let matching: Vec<ProcInfo> = cgroup
            .procs
            .iter()
            .copied()
            .filter(|proc| {
                let cmdline = proc.cmdline();
                if cmdline.is_empty() || ignore_proc(&cmdline) {
                    return false;
                }

                match proc.environ() {
                    Ok(environ) => environ.iter().any(|env| {
                        target_env_vars.iter().any(|target| env.starts_with(target.as_str()))
                    }),
                    Err(_) => false,
                }
            })
            .collect();

        if !matching.is_empty() {
            cgroup.procs = matching;
            filtered.push(cgroup);
        }
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CgroupConfig;
    use std::fs;

    fn fake_cgroupfs(unified: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        if unified {
            fs::write(root.join("cgroup.controllers"), "cpu memory pids\n").unwrap();
        }

        let procs_file = if unified { "cgroup.procs" } else { "tasks" };

        for (job, pids) in [("1481508", "42\n43\n"), ("1481509", "77\n")] {
            let leaf = root.join("slurm").join("uid_1000").join(format!("job_{}", job));
            fs::create_dir_all(&leaf).unwrap();
            fs::write(leaf.join(procs_file), pids).unwrap();

            // Nested step directory below the leaf must not be reported
            let step = leaf.join("step_0");
            fs::create_dir_all(&step).unwrap();
            fs::write(step.join(procs_file), "99\n").unwrap();
        }

        // Non-job system cgroup is ignored
        let sys = root.join("system.slice");
        fs::create_dir_all(&sys).unwrap();
        fs::write(sys.join(procs_file), "1\n").unwrap();

        dir
    }

    fn manager_for(root: &Path) -> CgroupManager {
        let config = CgroupConfig {
            root: root.to_path_buf(),
            procfs_root: PathBuf::from("/proc"),
            uuid_sidecar_dir: None,
            uuid_env_var: None,
        };
        CgroupManager::new(ResourceManagerKind::Slurm, &config).unwrap()
    }

    #[test]
    fn test_discover_unified() {
        let dir = fake_cgroupfs(true);
        let manager = manager_for(dir.path());
        assert_eq!(manager.mode(), CgroupMode::Unified);

        let mut cgroups = manager.discover().unwrap();
        cgroups.sort_by(|a, b| a.uuid.cmp(&b.uuid));

        assert_eq!(cgroups.len(), 2);
        assert_eq!(cgroups[0].uuid, "1481508");
        assert_eq!(
            cgroups[0].procs.iter().map(|p| p.pid).collect::<Vec<_>>(),
            vec![42, 43]
        );
        assert_eq!(cgroups[1].uuid, "1481509");
        assert_eq!(cgroups[1].procs.len(), 1);
    }

    #[test]
    fn test_discover_legacy() {
        let dir = fake_cgroupfs(false);
        let manager = manager_for(dir.path());
        assert_eq!(manager.mode(), CgroupMode::Legacy);

        let cgroups = manager.discover().unwrap();
        assert_eq!(cgroups.len(), 2);
    }

    #[test]
    fn test_leaf_descent_stops_at_marker() {
        let dir = fake_cgroupfs(true);
        let manager = manager_for(dir.path());

        let cgroups = manager.discover().unwrap();
        // step_0 subdirectories were not reported as units
        assert!(cgroups.iter().all(|c| !c.path.ends_with("step_0")));
    }

    #[test]
    fn test_uuid_from_sidecar_wins_over_path() {
        let dir = fake_cgroupfs(true);

        let sidecar = tempfile::tempdir().unwrap();
        fs::write(sidecar.path().join("job_1481508"), "aaaa-bbbb\n").unwrap();

        let config = CgroupConfig {
            root: dir.path().to_path_buf(),
            procfs_root: PathBuf::from("/proc"),
            uuid_sidecar_dir: Some(sidecar.path().to_path_buf()),
            uuid_env_var: None,
        };
        let manager = CgroupManager::new(ResourceManagerKind::Slurm, &config).unwrap();

        let mut uuids: Vec<String> =
            manager.discover().unwrap().into_iter().map(|c| c.uuid).collect();
        uuids.sort();

        // job_1481508 mapped through its sidecar file, the other falls
        // back to the path regex
        assert_eq!(uuids, vec!["1481509", "aaaa-bbbb"]);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let config = CgroupConfig {
            root: PathBuf::from("/nonexistent/cgroup/root"),
            procfs_root: PathBuf::from("/proc"),
            uuid_sidecar_dir: None,
            uuid_env_var: None,
        };
        assert!(CgroupManager::new(ResourceManagerKind::Slurm, &config).is_err());
    }

    #[test]
    fn test_ignore_proc_predicate() {
        let dir = fake_cgroupfs(true);
        let manager = manager_for(dir.path());

        assert!(manager.ignore_proc("slurmstepd: [1481508.batch]"));
        assert!(manager.ignore_proc("sleep 100000"));
        assert!(!manager.ignore_proc("/usr/bin/python3 train.py"));
    }

    #[test]
    fn test_env_filter_disabled_when_no_targets() {
        let cgroups = vec![Cgroup {
            path: PathBuf::from("/sys/fs/cgroup/slurm/uid_1000/job_1"),
            uuid: "1".to_string(),
            procs: vec![ProcInfo { pid: 1 }],
        }];

        let filtered = filter_cgroups_by_env(cgroups.clone(), &[], |_| false);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].procs.len(), 1);
    }
}
