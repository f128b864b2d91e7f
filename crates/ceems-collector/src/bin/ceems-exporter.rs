//! Main binary for the CEEMS exporter

use ceems_collector::engine::CollectorEngine;
use ceems_collector::{server, CollectorConfig};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ceems-exporter")]
#[command(about = "Prometheus exporter attributing per-compute-unit resource, energy and performance metrics")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address for the /metrics endpoint
    #[arg(long = "web.listen-address", value_name = "ADDR")]
    listen_address: Option<String>,

    /// Cgroup filesystem root
    #[arg(long = "path.cgroupfs", value_name = "DIR")]
    cgroupfs_path: Option<PathBuf>,

    /// procfs mount point
    #[arg(long = "path.procfs", value_name = "DIR")]
    procfs_path: Option<PathBuf>,

    /// Enable collection of perf hardware events
    #[arg(long = "collector.perf.hardware-events")]
    perf_hardware_events: bool,

    /// Enable collection of perf software events
    #[arg(long = "collector.perf.software-events")]
    perf_software_events: bool,

    /// Enable collection of perf hardware cache events
    #[arg(long = "collector.perf.hardware-cache-events")]
    perf_cache_events: bool,

    /// Profile only processes carrying one of these environment variable
    /// prefixes; may be repeated
    #[arg(long = "collector.perf.env-var", value_name = "PREFIX")]
    perf_env_vars: Vec<String>,

    /// Disable the IPMI DCMI power collector (enabled by default)
    #[arg(long = "no-collector.ipmi.dcmi")]
    no_ipmi: bool,

    /// IPMI DCMI command reporting system power statistics
    #[arg(long = "collector.ipmi.dcmi.cmd", value_name = "CMD")]
    ipmi_command: Option<String>,

    /// Enable GPU ownership resolution
    #[arg(long = "collector.gpu")]
    gpu: bool,

    /// Log level
    #[arg(long = "log.level", value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text, json)
    #[arg(long = "log.format", value_name = "FORMAT", default_value = "text")]
    log_format: String,
}

impl Cli {
    /// Fold CLI overrides into the loaded or default configuration.
    fn apply(&self, config: &mut CollectorConfig) {
        if let Some(address) = &self.listen_address {
            config.listen_address = address.clone();
        }
        if let Some(root) = &self.cgroupfs_path {
            config.cgroups.root = root.clone();
        }
        if let Some(root) = &self.procfs_path {
            config.cgroups.procfs_root = root.clone();
        }

        config.perf.hardware_events |= self.perf_hardware_events;
        config.perf.software_events |= self.perf_software_events;
        config.perf.cache_events |= self.perf_cache_events;
        if !self.perf_env_vars.is_empty() {
            config.perf.target_env_vars = self.perf_env_vars.clone();
        }

        if self.no_ipmi {
            config.ipmi.enabled = false;
        }
        if let Some(command) = &self.ipmi_command {
            config.ipmi.command = command.clone();
        }

        config.gpu.enabled |= self.gpu;

        config.logging.level = self.log_level.clone();
        config.logging.format = self.log_format.clone();
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match CollectorConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load configuration {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => CollectorConfig::default(),
    };

    cli.apply(&mut config);
    init_logging(&config.logging.level, &config.logging.format);

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    // An explicitly enabled collector that cannot start (missing path,
    // insufficient capabilities) is an unrecoverable startup error
    let engine = match CollectorEngine::new(&config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %e, "Failed to initialize collector engine");
            return ExitCode::FAILURE;
        }
    };

    // Leave headroom over the per-collector timeout so self-metrics of a
    // timed-out collector still make it into the response
    let scrape_timeout = Duration::from_secs(config.collector_timeout_seconds + 2);

    match server::serve(engine, &config.listen_address, scrape_timeout).await {
        Ok(()) => {
            info!("CEEMS exporter stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Exporter failed");
            ExitCode::FAILURE
        }
    }
}
