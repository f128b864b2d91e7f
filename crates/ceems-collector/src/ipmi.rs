//! IPMI DCMI baseboard power telemetry
//!
//! Invokes the vendor DCMI tool and parses its fixed-shape text output
//! into current/min/max watt readings. The tool tends to fail
//! intermittently on busy BMCs, so the last successful reading is cached
//! and served whenever a scrape fails. The way the tool is executed is
//! probed once at startup and frozen for the process lifetime: direct
//! exec, `sudo`-wrapped, then a setuid fork using file capabilities.

use crate::config::IpmiConfig;
use crate::exposition::Sample;
use crate::{CollectorError, Result};
use ceems_core::NAMESPACE;
use ceems_security::{Capability, SecurityContext};
use nix::unistd::{Gid, Uid};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// Expected output per the DCMI spec:
//   Current Power                        : 164 Watts
//   Minimum Power over sampling duration : 48 watts
//   Maximum Power over sampling duration : 361 watts
//   Average Power over sampling duration : 157 watts
//   Time Stamp                           : 12/29/2023 - 08:58:00
//   Statistics reporting time period     : 1473439000 milliseconds
//   Power Measurement                    : Active
static MEASUREMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Power Measurement\s*:\s*(?P<value>Active|Not\sAvailable).*").expect("static regex")
});

static READING_REGEXES: LazyLock<[(&'static str, Regex); 3]> = LazyLock::new(|| {
    [
        (
            "current",
            Regex::new(r"^Current Power\s*:\s*(?P<value>[0-9.]+)\s*[wW]atts.*").expect("static regex"),
        ),
        (
            "min",
            Regex::new(r"^Minimum Power over sampling duration\s*:\s*(?P<value>[0-9.]+)\s*[wW]atts.*")
                .expect("static regex"),
        ),
        (
            "max",
            Regex::new(r"^Maximum Power over sampling duration\s*:\s*(?P<value>[0-9.]+)\s*[wW]atts.*")
                .expect("static regex"),
        ),
    ]
});

const SUDO_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const SUDO_SCRAPE_TIMEOUT: Duration = Duration::from_secs(1);

/// How the DCMI tool is executed, frozen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// The process can run the tool directly
    Native,
    /// The tool runs under `sudo`
    Sudo,
    /// The tool runs in a fork with uid/gid 0 via file capabilities
    Cap,
    /// No mode worked; scrapes serve the cached reading only
    None,
}

/// Baseboard power collector.
pub struct IpmiCollector {
    hostname: String,
    program: String,
    args: Vec<String>,
    exec_mode: ExecMode,
    cached: Mutex<HashMap<&'static str, f64>>,
    setuid_ctx: Option<Arc<SecurityContext>>,
}

impl IpmiCollector {
    /// Create the collector, probing the execution fallback chain once.
    ///
    /// Construction never fails on an unusable tool: the collector is
    /// still registered and serves cached (initially zero) readings, so
    /// a BMC that comes back later starts producing samples again.
    pub fn new(hostname: String, config: &IpmiConfig) -> Result<Self> {
        let mut parts = config.command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| CollectorError::configuration("empty IPMI command"))?;
        let args: Vec<String> = parts.collect();

        let mut setuid_ctx = None;

        let exec_mode = if execute(&program, &args).is_ok() {
            ExecMode::Native
        } else if program != "sudo" && probe_sudo(&program, &args) {
            ExecMode::Sudo
        } else if let Some(ctx) = probe_setuid(&program, &args) {
            setuid_ctx = Some(ctx);
            ExecMode::Cap
        } else {
            warn!(command = %config.command, "No working execution mode for IPMI tool, serving cached readings only");
            ExecMode::None
        };

        info!(?exec_mode, command = %config.command, "Initialized IPMI DCMI collector");

        Ok(Self {
            hostname,
            program,
            args,
            exec_mode,
            cached: Mutex::new(HashMap::new()),
            setuid_ctx,
        })
    }

    /// Execution mode frozen at startup.
    pub fn exec_mode(&self) -> ExecMode {
        self.exec_mode
    }

    /// Run one collection pass.
    pub fn collect(&self) -> Vec<Sample> {
        let readings = self
            .run_tool()
            .and_then(|output| parse_power_readings(&output));

        self.samples_from(readings)
    }

    /// Emit samples from a parse result, refreshing the cache on success
    /// and serving it on failure.
    fn samples_from(&self, readings: Result<HashMap<&'static str, f64>>) -> Vec<Sample> {
        let mut cached = self.cached.lock();

        let readings = match readings {
            Ok(readings) => {
                *cached = readings.clone();
                readings
            }
            Err(e) => {
                debug!(error = %e, cached = ?*cached, "IPMI reading failed, serving cached values");
                cached.clone()
            }
        };

        let mut samples = Vec::with_capacity(readings.len());
        for (kind, value) in readings {
            if value <= 0.0 {
                continue;
            }

            let (name, help) = match kind {
                "current" => ("current_watts_total", "Current power consumption in watts"),
                "min" => ("min_watts_total", "Minimum power consumption in watts"),
                "max" => ("max_watts_total", "Maximum power consumption in watts"),
                _ => continue,
            };

            samples.push(
                Sample::counter(format!("{}_ipmi_dcmi_{}", NAMESPACE, name), help, value)
                    .with_label("hostname", self.hostname.clone()),
            );
        }

        samples
    }

    fn run_tool(&self) -> Result<String> {
        match self.exec_mode {
            ExecMode::Native => execute(&self.program, &self.args),
            ExecMode::Sudo => {
                let mut sudo_args = vec![self.program.clone()];
                sudo_args.extend(self.args.iter().cloned());
                execute_with_timeout("sudo", &sudo_args, SUDO_SCRAPE_TIMEOUT)
            }
            ExecMode::Cap => {
                let ctx = self.setuid_ctx.as_ref().ok_or_else(|| {
                    CollectorError::capability("setuid context missing for cap exec mode")
                })?;
                let program = self.program.clone();
                let args = self.args.clone();
                ctx.exec(move || execute_as_root(&program, &args))?
            }
            ExecMode::None => Err(CollectorError::Subprocess(format!(
                "no permission to execute {}",
                self.program
            ))),
        }
    }
}

/// Parse DCMI output into current/min/max watts.
///
/// The output must carry an `Active` power measurement line and all
/// three sampled power lines; anything else (including the explicit
/// `Not Available` state) yields an error and the caller serves its
/// cache.
pub fn parse_power_readings(output: &str) -> Result<HashMap<&'static str, f64>> {
    let state = output
        .lines()
        .find_map(|line| MEASUREMENT_REGEX.captures(line.trim_end()))
        .and_then(|captures| captures.name("value"))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| CollectorError::parse("no power measurement line in IPMI output"))?;

    if state != "Active" {
        return Err(CollectorError::parse("IPMI power readings not active"));
    }

    let mut readings = HashMap::with_capacity(3);

    for (kind, regex) in READING_REGEXES.iter() {
        let value = output
            .lines()
            .find_map(|line| regex.captures(line.trim_end()))
            .and_then(|captures| captures.name("value"))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .ok_or_else(|| {
                CollectorError::parse(format!("missing {} power line in IPMI output", kind))
            })?;

        readings.insert(*kind, value);
    }

    Ok(readings)
}

fn execute(program: &str, args: &[String]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| CollectorError::Subprocess(format!("{}: {}", program, e)))?;

    if !output.status.success() {
        return Err(CollectorError::Subprocess(format!(
            "{} exited with {}",
            program, output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command with a wall-clock timeout; `sudo` may hang on a
/// password prompt when the user has no NOPASSWD rule.
fn execute_with_timeout(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| CollectorError::Subprocess(format!("{}: {}", program, e)))?;

    let start = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stdout = String::new();
                if let Some(mut pipe) = child.stdout.take() {
                    use std::io::Read;
                    let _ = pipe.read_to_string(&mut stdout);
                }

                if !status.success() {
                    return Err(CollectorError::Subprocess(format!(
                        "{} exited with {}",
                        program, status
                    )));
                }

                return Ok(stdout);
            }
            Ok(None) if start.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CollectorError::Subprocess(format!("{} timed out", program)));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                return Err(CollectorError::Subprocess(format!("{}: {}", program, e)));
            }
        }
    }
}

/// Fork the tool with uid/gid 0; succeeds when the binary carries the
/// setuid file capabilities.
fn execute_as_root(program: &str, args: &[String]) -> Result<String> {
    let mut command = Command::new(program);
    command.args(args);

    unsafe {
        command.pre_exec(|| {
            nix::unistd::setgid(Gid::from_raw(0)).map_err(std::io::Error::from)?;
            nix::unistd::setuid(Uid::from_raw(0)).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let output = command
        .output()
        .map_err(|e| CollectorError::Subprocess(format!("{}: {}", program, e)))?;

    if !output.status.success() {
        return Err(CollectorError::Subprocess(format!(
            "{} exited with {}",
            program, output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn probe_sudo(program: &str, args: &[String]) -> bool {
    let mut sudo_args = vec!["-n".to_string(), program.to_string()];
    sudo_args.extend(args.iter().cloned());
    execute_with_timeout("sudo", &sudo_args, SUDO_PROBE_TIMEOUT).is_ok()
}

fn probe_setuid(program: &str, args: &[String]) -> Option<Arc<SecurityContext>> {
    let ctx = SecurityContext::new(
        "ipmi_setuid",
        vec![Capability::CAP_SETUID, Capability::CAP_SETGID],
    )
    .ok()?;

    let program = program.to_string();
    let args = args.to_vec();
    match ctx.exec(move || execute_as_root(&program, &args)) {
        Ok(Ok(_)) => Some(Arc::new(ctx)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIVE_OUTPUT: &str = "\
Current Power                        : 164 Watts
Minimum Power over sampling duration : 48 watts
Maximum Power over sampling duration : 361 watts
Average Power over sampling duration : 157 watts
Time Stamp                           : 12/29/2023 - 08:58:00
Statistics reporting time period     : 1473439000 milliseconds
Power Measurement                    : Active
";

    const NOT_AVAILABLE_OUTPUT: &str = "\
Power Measurement                    : Not Available
";

    fn collector() -> IpmiCollector {
        IpmiCollector {
            hostname: "n1".to_string(),
            program: "/bin/false".to_string(),
            args: vec![],
            exec_mode: ExecMode::None,
            cached: Mutex::new(HashMap::new()),
            setuid_ctx: None,
        }
    }

    #[test]
    fn test_parse_active_output() {
        let readings = parse_power_readings(ACTIVE_OUTPUT).unwrap();
        assert_eq!(readings["current"], 164.0);
        assert_eq!(readings["min"], 48.0);
        assert_eq!(readings["max"], 361.0);
    }

    #[test]
    fn test_parse_not_available() {
        assert!(parse_power_readings(NOT_AVAILABLE_OUTPUT).is_err());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_power_readings("").is_err());
        assert!(parse_power_readings("DCMI command failed\n").is_err());
        // Active but missing sampled power lines
        assert!(parse_power_readings("Power Measurement : Active\n").is_err());
    }

    #[test]
    fn test_success_refreshes_cache_and_emits() {
        let c = collector();

        let samples = c.samples_from(parse_power_readings(ACTIVE_OUTPUT));
        assert_eq!(samples.len(), 3);

        let current = samples
            .iter()
            .find(|s| s.name == "ceems_ipmi_dcmi_current_watts_total")
            .unwrap();
        assert_eq!(current.value, 164.0);
        assert!(current.labels.contains(&("hostname".to_string(), "n1".to_string())));

        assert_eq!(c.cached.lock()["current"], 164.0);
    }

    #[test]
    fn test_failure_serves_cache() {
        let c = collector();

        // Prime the cache
        c.samples_from(parse_power_readings(ACTIVE_OUTPUT));

        // Failed read serves the previous values unchanged
        let samples = c.samples_from(parse_power_readings(NOT_AVAILABLE_OUTPUT));
        assert_eq!(samples.len(), 3);
        assert_eq!(c.cached.lock()["max"], 361.0);
    }

    #[test]
    fn test_empty_cache_emits_nothing() {
        let c = collector();

        let samples = c.samples_from(parse_power_readings(NOT_AVAILABLE_OUTPUT));
        assert!(samples.is_empty());
        assert!(c.cached.lock().is_empty());
    }
}
