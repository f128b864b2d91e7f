//! Per-PID perf counter profiling
//!
//! Multiplexes hardware, software and hardware-cache `perf_event`
//! profilers per process. Profilers are opened when a PID first appears
//! in an active cgroup and closed when it leaves the active set, both
//! inside a `CAP_PERFMON` security context. Kernel-multiplexed counters
//! are rescaled per interval from `(value, time_enabled, time_running)`
//! deltas, which keeps exported counters monotone and wraparound-safe.

use crate::cgroups::{filter_cgroups_by_env, Cgroup};
use crate::config::PerfConfig;
use crate::exposition::Sample;
use crate::{CollectorError, Result};
use ceems_core::NAMESPACE;
use ceems_security::{Capability, SecurityContext};
use parking_lot::Mutex;
use perf_event::events::{Cache, CacheOp, CacheResult, Hardware, Software, WhichCache};
use perf_event::{Builder, Counter};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hardware events exported by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareEvent {
    CpuCycles,
    Instructions,
    BranchInstructions,
    BranchMisses,
    CacheRefs,
    CacheMisses,
    RefCpuCycles,
}

impl HardwareEvent {
    /// All hardware events, in exposition order.
    pub const ALL: [HardwareEvent; 7] = [
        HardwareEvent::CpuCycles,
        HardwareEvent::Instructions,
        HardwareEvent::BranchInstructions,
        HardwareEvent::BranchMisses,
        HardwareEvent::CacheRefs,
        HardwareEvent::CacheMisses,
        HardwareEvent::RefCpuCycles,
    ];

    fn metric_name(&self) -> &'static str {
        match self {
            HardwareEvent::CpuCycles => "cpucycles_total",
            HardwareEvent::Instructions => "instructions_total",
            HardwareEvent::BranchInstructions => "branch_instructions_total",
            HardwareEvent::BranchMisses => "branch_misses_total",
            HardwareEvent::CacheRefs => "cache_refs_total",
            HardwareEvent::CacheMisses => "cache_misses_total",
            HardwareEvent::RefCpuCycles => "ref_cpucycles_total",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            HardwareEvent::CpuCycles => "Number of CPU cycles (frequency scaled)",
            HardwareEvent::Instructions => "Number of CPU instructions",
            HardwareEvent::BranchInstructions => "Number of CPU branch instructions",
            HardwareEvent::BranchMisses => "Number of CPU branch misses",
            HardwareEvent::CacheRefs => "Number of cache references (non frequency scaled)",
            HardwareEvent::CacheMisses => "Number of cache misses",
            HardwareEvent::RefCpuCycles => "Number of CPU cycles",
        }
    }

    fn event(&self) -> Hardware {
        match self {
            HardwareEvent::CpuCycles => Hardware::CPU_CYCLES,
            HardwareEvent::Instructions => Hardware::INSTRUCTIONS,
            HardwareEvent::BranchInstructions => Hardware::BRANCH_INSTRUCTIONS,
            HardwareEvent::BranchMisses => Hardware::BRANCH_MISSES,
            HardwareEvent::CacheRefs => Hardware::CACHE_REFERENCES,
            HardwareEvent::CacheMisses => Hardware::CACHE_MISSES,
            HardwareEvent::RefCpuCycles => Hardware::REF_CPU_CYCLES,
        }
    }
}

/// Software events exported by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftwareEvent {
    PageFaults,
    ContextSwitches,
    CpuMigrations,
    MinorFaults,
    MajorFaults,
}

impl SoftwareEvent {
    /// All software events, in exposition order.
    pub const ALL: [SoftwareEvent; 5] = [
        SoftwareEvent::PageFaults,
        SoftwareEvent::ContextSwitches,
        SoftwareEvent::CpuMigrations,
        SoftwareEvent::MinorFaults,
        SoftwareEvent::MajorFaults,
    ];

    fn metric_name(&self) -> &'static str {
        match self {
            SoftwareEvent::PageFaults => "page_faults_total",
            SoftwareEvent::ContextSwitches => "context_switches_total",
            SoftwareEvent::CpuMigrations => "cpu_migrations_total",
            SoftwareEvent::MinorFaults => "minor_faults_total",
            SoftwareEvent::MajorFaults => "major_faults_total",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            SoftwareEvent::PageFaults => "Number of page faults",
            SoftwareEvent::ContextSwitches => "Number of context switches",
            SoftwareEvent::CpuMigrations => "Number of CPU process migrations",
            SoftwareEvent::MinorFaults => "Number of minor page faults",
            SoftwareEvent::MajorFaults => "Number of major page faults",
        }
    }

    fn event(&self) -> Software {
        match self {
            SoftwareEvent::PageFaults => Software::PAGE_FAULTS,
            SoftwareEvent::ContextSwitches => Software::CONTEXT_SWITCHES,
            SoftwareEvent::CpuMigrations => Software::CPU_MIGRATIONS,
            SoftwareEvent::MinorFaults => Software::PAGE_FAULTS_MIN,
            SoftwareEvent::MajorFaults => Software::PAGE_FAULTS_MAJ,
        }
    }
}

/// Hardware cache events exported by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEvent {
    L1dReadHits,
    L1dReadMisses,
    L1dWriteHits,
    L1iReadMisses,
    TlbInstrReadHits,
    TlbInstrReadMisses,
    LlReadHits,
    LlReadMisses,
    LlWriteHits,
    LlWriteMisses,
    BpuReadHits,
    BpuReadMisses,
}

impl CacheEvent {
    /// All cache events, in exposition order.
    pub const ALL: [CacheEvent; 12] = [
        CacheEvent::L1dReadHits,
        CacheEvent::L1dReadMisses,
        CacheEvent::L1dWriteHits,
        CacheEvent::L1iReadMisses,
        CacheEvent::TlbInstrReadHits,
        CacheEvent::TlbInstrReadMisses,
        CacheEvent::LlReadHits,
        CacheEvent::LlReadMisses,
        CacheEvent::LlWriteHits,
        CacheEvent::LlWriteMisses,
        CacheEvent::BpuReadHits,
        CacheEvent::BpuReadMisses,
    ];

    fn metric_name(&self) -> &'static str {
        match self {
            CacheEvent::L1dReadHits => "cache_l1d_read_hits_total",
            CacheEvent::L1dReadMisses => "cache_l1d_read_misses_total",
            CacheEvent::L1dWriteHits => "cache_l1d_write_hits_total",
            CacheEvent::L1iReadMisses => "cache_l1_instr_read_misses_total",
            CacheEvent::TlbInstrReadHits => "cache_tlb_instr_read_hits_total",
            CacheEvent::TlbInstrReadMisses => "cache_tlb_instr_read_misses_total",
            CacheEvent::LlReadHits => "cache_ll_read_hits_total",
            CacheEvent::LlReadMisses => "cache_ll_read_misses_total",
            CacheEvent::LlWriteHits => "cache_ll_write_hits_total",
            CacheEvent::LlWriteMisses => "cache_ll_write_misses_total",
            CacheEvent::BpuReadHits => "cache_bpu_read_hits_total",
            CacheEvent::BpuReadMisses => "cache_bpu_read_misses_total",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            CacheEvent::L1dReadHits => "Number L1 data cache read hits",
            CacheEvent::L1dReadMisses => "Number L1 data cache read misses",
            CacheEvent::L1dWriteHits => "Number L1 data cache write hits",
            CacheEvent::L1iReadMisses => "Number instruction L1 instruction read misses",
            CacheEvent::TlbInstrReadHits => "Number instruction TLB read hits",
            CacheEvent::TlbInstrReadMisses => "Number instruction TLB read misses",
            CacheEvent::LlReadHits => "Number last level read hits",
            CacheEvent::LlReadMisses => "Number last level read misses",
            CacheEvent::LlWriteHits => "Number last level write hits",
            CacheEvent::LlWriteMisses => "Number last level write misses",
            CacheEvent::BpuReadHits => "Number BPU read hits",
            CacheEvent::BpuReadMisses => "Number BPU read misses",
        }
    }

    fn event(&self) -> Cache {
        let (which, operation, result) = match self {
            CacheEvent::L1dReadHits => (WhichCache::L1D, CacheOp::READ, CacheResult::ACCESS),
            CacheEvent::L1dReadMisses => (WhichCache::L1D, CacheOp::READ, CacheResult::MISS),
            CacheEvent::L1dWriteHits => (WhichCache::L1D, CacheOp::WRITE, CacheResult::ACCESS),
            CacheEvent::L1iReadMisses => (WhichCache::L1I, CacheOp::READ, CacheResult::MISS),
            CacheEvent::TlbInstrReadHits => (WhichCache::ITLB, CacheOp::READ, CacheResult::ACCESS),
            CacheEvent::TlbInstrReadMisses => (WhichCache::ITLB, CacheOp::READ, CacheResult::MISS),
            CacheEvent::LlReadHits => (WhichCache::LL, CacheOp::READ, CacheResult::ACCESS),
            CacheEvent::LlReadMisses => (WhichCache::LL, CacheOp::READ, CacheResult::MISS),
            CacheEvent::LlWriteHits => (WhichCache::LL, CacheOp::WRITE, CacheResult::ACCESS),
            CacheEvent::LlWriteMisses => (WhichCache::LL, CacheOp::WRITE, CacheResult::MISS),
            CacheEvent::BpuReadHits => (WhichCache::BPU, CacheOp::READ, CacheResult::ACCESS),
            CacheEvent::BpuReadMisses => (WhichCache::BPU, CacheOp::READ, CacheResult::MISS),
        };
        Cache { which, operation, result }
    }
}

/// One multiplexed counter reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCounter {
    /// Raw counter value
    pub value: u64,
    /// Nanoseconds the event was enabled
    pub time_enabled: u64,
    /// Nanoseconds the event was actually counting on a PMU
    pub time_running: u64,
}

/// Extrapolate the per-interval contribution of a multiplexed counter.
///
/// `Δvalue × (Δtime_enabled / Δtime_running)` when the counter ran this
/// interval, plain `Δvalue` otherwise. Deltas use wrapping subtraction,
/// so a counter wrapping the 64-bit boundary still yields the correct
/// increment. Rescaling per interval instead of rescaling the absolute
/// counter avoids accumulating the multiplexing ratio's drift.
pub fn scale_counter(last: RawCounter, current: RawCounter) -> f64 {
    let delta_enabled = current.time_enabled.wrapping_sub(last.time_enabled);
    let delta_running = current.time_running.wrapping_sub(last.time_running);
    let delta_value = current.value.wrapping_sub(last.value) as i64;

    if delta_running > 0 {
        ((delta_enabled as f64 / delta_running as f64) * delta_value as f64).round()
    } else {
        delta_value as f64
    }
}

/// Open profilers of one PID.
struct PidCounters {
    hw: Vec<(HardwareEvent, Counter)>,
    sw: Vec<(SoftwareEvent, Counter)>,
    cache: Vec<(CacheEvent, Counter)>,
}

impl PidCounters {
    fn is_empty(&self) -> bool {
        self.hw.is_empty() && self.sw.is_empty() && self.cache.is_empty()
    }

    /// Best-effort disable before the fds are closed on drop.
    fn disable_all(&mut self) {
        for (_, counter) in self.hw.iter_mut() {
            let _ = counter.disable();
        }
        for (_, counter) in self.sw.iter_mut() {
            let _ = counter.disable();
        }
        for (_, counter) in self.cache.iter_mut() {
            let _ = counter.disable();
        }
    }
}

type RawTable = HashMap<i32, HashMap<&'static str, RawCounter>>;
type ScaledTable = HashMap<i32, HashMap<&'static str, f64>>;

/// Per-PID perf counter collector.
///
/// State machine per PID: a newly observed PID in an active cgroup gets
/// its profilers opened; a PID absent from the active set has them
/// closed at the end of the scrape; reads in between do not transition.
pub struct PerfCollector {
    hostname: String,
    manager: String,
    opts: PerfConfig,
    ignore_proc_regex: Option<Regex>,
    profilers: Arc<Mutex<HashMap<i32, PidCounters>>>,
    last_raw: Mutex<RawTable>,
    last_scaled: Mutex<ScaledTable>,
    /// Opens and closes perf fds; requires CAP_PERFMON
    profiler_ctx: Arc<SecurityContext>,
    /// Reads foreign process environs; requires trace capabilities
    filter_ctx: Option<Arc<SecurityContext>>,
}

/// Refuse to start when the paranoid sysctl forbids counter access even
/// with `CAP_PERFMON`. Debian and Ubuntu patch values 3 and 4 into the
/// kernel for exactly that purpose.
pub fn check_paranoid(procfs_root: &Path) -> Result<()> {
    let path = procfs_root.join("sys/kernel/perf_event_paranoid");
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        CollectorError::capability(format!(
            "cannot read {}, perf_event_open unsupported: {}",
            path.display(),
            e
        ))
    })?;

    let paranoid: i32 = raw
        .trim()
        .parse()
        .map_err(|_| CollectorError::parse(format!("malformed paranoid value: {}", raw.trim())))?;

    if paranoid > 2 {
        return Err(CollectorError::capability(format!(
            "perf_event_open is not possible with perf_event_paranoid={}, set it to at most 2",
            paranoid
        )));
    }

    Ok(())
}

impl PerfCollector {
    /// Create the collector. Fails when no profiler family is enabled,
    /// when the paranoid sysctl forbids counter access or when the
    /// required capabilities are not in the permitted set.
    pub fn new(
        hostname: String,
        manager: String,
        opts: PerfConfig,
        procfs_root: &Path,
        ignore_proc_regex: Option<Regex>,
    ) -> Result<Self> {
        if !opts.any_enabled() {
            return Err(CollectorError::configuration("no perf profiler family enabled"));
        }

        check_paranoid(procfs_root)?;

        let profiler_ctx = Arc::new(SecurityContext::new(
            "perf_profilers",
            vec![Capability::CAP_PERFMON],
        )?);

        let filter_ctx = if opts.target_env_vars.is_empty() {
            None
        } else {
            Some(Arc::new(SecurityContext::new(
                "perf_proc_filter",
                vec![Capability::CAP_SYS_PTRACE, Capability::CAP_DAC_READ_SEARCH],
            )?))
        };

        Ok(Self {
            hostname,
            manager,
            opts,
            ignore_proc_regex,
            profilers: Arc::new(Mutex::new(HashMap::new())),
            last_raw: Mutex::new(HashMap::new()),
            last_scaled: Mutex::new(HashMap::new()),
            profiler_ctx,
            filter_ctx,
        })
    }

    /// Run one collection pass over the discovered cgroups.
    pub fn collect(&self, cgroups: &[Cgroup]) -> Result<Vec<Sample>> {
        let cgroups = if self.opts.target_env_vars.is_empty() {
            cgroups.to_vec()
        } else {
            self.filter_procs(cgroups.to_vec())?
        };

        let active_pids = self.open_profilers(&cgroups)?;
        self.close_profilers(active_pids.clone())?;

        if cgroups.is_empty() {
            return Ok(Vec::new());
        }

        let samples = self.read_counters(&cgroups);

        // Evict snapshot slots of PIDs that left the active set so the
        // tables stay bounded under PID churn
        let active: HashSet<i32> = active_pids.into_iter().collect();
        self.last_raw.lock().retain(|pid, _| active.contains(pid));
        self.last_scaled.lock().retain(|pid, _| active.contains(pid));

        Ok(samples)
    }

    /// Release every profiler, e.g. on shutdown.
    pub fn stop(&self) -> Result<()> {
        self.close_profilers(Vec::new())
    }

    /// Filter cgroup processes by target env vars inside the trace
    /// security context.
    fn filter_procs(&self, cgroups: Vec<Cgroup>) -> Result<Vec<Cgroup>> {
        let Some(ctx) = &self.filter_ctx else {
            return Ok(cgroups);
        };

        let targets = self.opts.target_env_vars.clone();
        let ignore_regex = self.ignore_proc_regex.clone();

        let filtered = ctx.exec(move || {
            filter_cgroups_by_env(cgroups, &targets, |cmdline| {
                ignore_regex
                    .as_ref()
                    .map(|re| re.is_match(cmdline))
                    .unwrap_or(false)
            })
        })?;

        if filtered.is_empty() {
            debug!("No cgroups left for profiling after env var filter");
        }

        Ok(filtered)
    }

    /// Open profilers for PIDs not seen before; returns the active PID
    /// set of this scrape.
    fn open_profilers(&self, cgroups: &[Cgroup]) -> Result<Vec<i32>> {
        let cgroups = cgroups.to_vec();
        let profilers = Arc::clone(&self.profilers);
        let opts = self.opts.clone();

        let active = self.profiler_ctx.exec(move || {
            let mut profilers = profilers.lock();
            let mut active = Vec::new();

            for cgroup in &cgroups {
                for proc in &cgroup.procs {
                    let pid = proc.pid;
                    active.push(pid);

                    if profilers.contains_key(&pid) {
                        continue;
                    }

                    let counters = open_pid_counters(pid, &opts);
                    if counters.is_empty() {
                        debug!(pid, cmd = %proc.cmdline(), "No perf profilers opened for process");
                    } else {
                        profilers.insert(pid, counters);
                    }
                }
            }

            active
        })?;

        Ok(active)
    }

    /// Close and drop profilers of PIDs no longer active.
    fn close_profilers(&self, active_pids: Vec<i32>) -> Result<()> {
        let profilers = Arc::clone(&self.profilers);
        let active: HashSet<i32> = active_pids.into_iter().collect();

        self.profiler_ctx.exec(move || {
            let mut profilers = profilers.lock();
            let stale: Vec<i32> = profilers
                .keys()
                .filter(|pid| !active.contains(pid))
                .copied()
                .collect();

            for pid in stale {
                if let Some(mut counters) = profilers.remove(&pid) {
                    counters.disable_all();
                    // Dropping the counters closes the perf fds
                }
            }
        })?;

        Ok(())
    }

    /// Read all open counters and aggregate scaled contributions per
    /// compute unit. Profile reads need no elevation.
    fn read_counters(&self, cgroups: &[Cgroup]) -> Vec<Sample> {
        let mut profilers = self.profilers.lock();
        let mut last_raw = self.last_raw.lock();
        let mut last_scaled = self.last_scaled.lock();

        let mut samples = Vec::new();

        for cgroup in cgroups {
            // metric name -> (help, aggregated value)
            let mut unit_counters: HashMap<&'static str, (&'static str, f64)> = HashMap::new();

            for proc in &cgroup.procs {
                let pid = proc.pid;
                let Some(counters) = profilers.get_mut(&pid) else {
                    continue;
                };

                let raw_slots = last_raw.entry(pid).or_default();
                let scaled_slots = last_scaled.entry(pid).or_default();

                // Hardware and cache counters are kernel-multiplexed and
                // go through delta rescaling
                for (event, counter) in counters.hw.iter_mut() {
                    if let Some(current) = read_raw(counter, pid) {
                        let metric = event.metric_name();
                        let scaled = accumulate_scaled(raw_slots, scaled_slots, metric, current);
                        unit_counters.entry(metric).or_insert((event.help(), 0.0)).1 += scaled;
                    }
                }

                for (event, counter) in counters.cache.iter_mut() {
                    if let Some(current) = read_raw(counter, pid) {
                        let metric = event.metric_name();
                        let scaled = accumulate_scaled(raw_slots, scaled_slots, metric, current);
                        unit_counters.entry(metric).or_insert((event.help(), 0.0)).1 += scaled;
                    }
                }

                // Software counters are never multiplexed; export the
                // absolute kernel value
                for (event, counter) in counters.sw.iter_mut() {
                    match counter.read() {
                        Ok(value) => {
                            unit_counters
                                .entry(event.metric_name())
                                .or_insert((event.help(), 0.0))
                                .1 += value as f64;
                        }
                        Err(e) => debug!(pid, error = %e, "Software counter read failed"),
                    }
                }
            }

            for (metric, (help, value)) in unit_counters {
                if value > 0.0 {
                    samples.push(
                        Sample::counter(format!("{}_perf_{}", NAMESPACE, metric), help, value)
                            .with_label("manager", self.manager.clone())
                            .with_label("hostname", self.hostname.clone())
                            .with_label("uuid", cgroup.uuid.clone()),
                    );
                }
            }
        }

        samples
    }
}

/// Read one multiplexed counter; a failed read (the process just exited)
/// is skipped.
fn read_raw(counter: &mut Counter, pid: i32) -> Option<RawCounter> {
    match counter.read_count_and_time() {
        Ok(reading) => Some(RawCounter {
            value: reading.count,
            time_enabled: reading.time_enabled,
            time_running: reading.time_running,
        }),
        Err(e) => {
            debug!(pid, error = %e, "Counter read failed");
            None
        }
    }
}

/// Fold one reading into the per-PID snapshot tables, returning the new
/// running scaled sum for this `(pid, metric)`.
fn accumulate_scaled(
    raw_slots: &mut HashMap<&'static str, RawCounter>,
    scaled_slots: &mut HashMap<&'static str, f64>,
    metric: &'static str,
    current: RawCounter,
) -> f64 {
    let last = raw_slots.get(metric).copied().unwrap_or_default();
    let scaled = scaled_slots.get(metric).copied().unwrap_or(0.0) + scale_counter(last, current);

    raw_slots.insert(metric, current);
    scaled_slots.insert(metric, scaled);

    scaled
}

/// Open the enabled profiler families for one PID. Individual event
/// failures are logged and skipped; the kernel may not expose every
/// event on every system.
fn open_pid_counters(pid: i32, opts: &PerfConfig) -> PidCounters {
    let mut counters = PidCounters {
        hw: Vec::new(),
        sw: Vec::new(),
        cache: Vec::new(),
    };

    if opts.hardware_events {
        for event in HardwareEvent::ALL {
            match open_counter(pid, event.event()) {
                Ok(counter) => counters.hw.push((event, counter)),
                Err(e) => debug!(pid, event = ?event, error = %e, "Failed to open hardware profiler"),
            }
        }
    }

    if opts.software_events {
        for event in SoftwareEvent::ALL {
            match open_counter(pid, event.event()) {
                Ok(counter) => counters.sw.push((event, counter)),
                Err(e) => debug!(pid, event = ?event, error = %e, "Failed to open software profiler"),
            }
        }
    }

    if opts.cache_events {
        for event in CacheEvent::ALL {
            match open_counter(pid, event.event()) {
                Ok(counter) => counters.cache.push((event, counter)),
                Err(e) => {
                    debug!(pid, event = ?event, error = %e, "Failed to open cache profiler");
                }
            }
        }
    }

    if counters.is_empty() {
        warn!(pid, "Could not open any perf profiler for process");
    }

    counters
}

fn open_counter(pid: i32, event: impl Into<perf_event::events::Event>) -> std::io::Result<Counter> {
    let mut counter = Builder::new().observe_pid(pid).kind(event).build()?;
    counter.enable()?;
    Ok(counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_counter_full_ratio() {
        // Counter ran half the enabled time: contribution doubles
        let last = RawCounter { value: 1000, time_enabled: 1_000_000, time_running: 1_000_000 };
        let current = RawCounter { value: 1500, time_enabled: 3_000_000, time_running: 2_000_000 };

        assert_eq!(scale_counter(last, current), 1000.0);
    }

    #[test]
    fn test_scale_counter_not_multiplexed_is_identity() {
        // time_enabled == time_running: scale factor exactly 1
        let last = RawCounter { value: 100, time_enabled: 1_000, time_running: 1_000 };
        let current = RawCounter { value: 400, time_enabled: 5_000, time_running: 5_000 };

        assert_eq!(scale_counter(last, current), 300.0);
    }

    #[test]
    fn test_scale_counter_zero_running_delta() {
        // No running time this interval: contribution is the plain delta
        let last = RawCounter { value: 100, time_enabled: 1_000, time_running: 1_000 };
        let current = RawCounter { value: 130, time_enabled: 2_000, time_running: 1_000 };

        assert_eq!(scale_counter(last, current), 30.0);
    }

    #[test]
    fn test_scale_counter_wraparound() {
        // Counter wrapped the 64-bit boundary; two's complement
        // subtraction recovers the true increment
        let last = RawCounter { value: u64::MAX - 10, time_enabled: 1_000, time_running: 1_000 };
        let current = RawCounter { value: 20, time_enabled: 2_000, time_running: 2_000 };

        assert_eq!(scale_counter(last, current), 31.0);
    }

    #[test]
    fn test_scale_counter_rounds_to_whole() {
        let last = RawCounter::default();
        let current = RawCounter { value: 10, time_enabled: 3, time_running: 2 };

        // 10 * 3/2 = 15.0 exactly; 10 * 4/3 = 13.33.. rounds to 13
        assert_eq!(scale_counter(last, current), 15.0);

        let current = RawCounter { value: 10, time_enabled: 4, time_running: 3 };
        assert_eq!(scale_counter(last, current), 13.0);
    }

    #[test]
    fn test_accumulate_scaled_is_monotone() {
        let mut raw = HashMap::new();
        let mut scaled = HashMap::new();

        let readings = [
            RawCounter { value: 100, time_enabled: 1_000, time_running: 1_000 },
            RawCounter { value: 250, time_enabled: 2_000, time_running: 2_000 },
            // Multiplexing kicks in
            RawCounter { value: 300, time_enabled: 3_000, time_running: 2_500 },
            RawCounter { value: 300, time_enabled: 4_000, time_running: 2_500 },
        ];

        let mut previous = 0.0;
        for reading in readings {
            let sum = accumulate_scaled(&mut raw, &mut scaled, "cpucycles_total", reading);
            assert!(sum >= previous, "scaled sum regressed: {} < {}", sum, previous);
            previous = sum;
        }
    }

    #[test]
    fn test_event_metric_names_are_clean() {
        for event in HardwareEvent::ALL {
            let name = event.metric_name();
            assert_eq!(crate::exposition::sanitize_metric_name(name), name);
        }
        for event in SoftwareEvent::ALL {
            let name = event.metric_name();
            assert_eq!(crate::exposition::sanitize_metric_name(name), name);
        }
        for event in CacheEvent::ALL {
            let name = event.metric_name();
            assert_eq!(crate::exposition::sanitize_metric_name(name), name);
        }
    }

    #[test]
    fn test_check_paranoid() {
        let root = tempfile::tempdir().unwrap();
        let sys_kernel = root.path().join("sys/kernel");
        std::fs::create_dir_all(&sys_kernel).unwrap();

        std::fs::write(sys_kernel.join("perf_event_paranoid"), "2\n").unwrap();
        assert!(check_paranoid(root.path()).is_ok());

        std::fs::write(sys_kernel.join("perf_event_paranoid"), "-1\n").unwrap();
        assert!(check_paranoid(root.path()).is_ok());

        std::fs::write(sys_kernel.join("perf_event_paranoid"), "3\n").unwrap();
        assert!(check_paranoid(root.path()).is_err());
    }

    #[test]
    fn test_check_paranoid_missing_file() {
        let root = tempfile::tempdir().unwrap();
        assert!(check_paranoid(root.path()).is_err());
    }
}
