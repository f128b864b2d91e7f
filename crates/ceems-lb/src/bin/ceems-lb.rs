//! Main binary for the CEEMS load balancer

use ceems_api::{AdminUsers, DbOracle, GrafanaClient, HttpOracle, OwnershipOracle};
use ceems_lb::config::OwnershipConfig;
use ceems_lb::middleware::AuthState;
use ceems_lb::prober::spawn_prober;
use ceems_lb::proxy::Proxy;
use ceems_lb::server::{serve, LbState};
use ceems_lb::{ClusterPools, LbConfig, Strategy};
use ceems_core::CLUSTER_ID_HEADER;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ceems-lb")]
#[command(about = "Access-controlled load balancer for sharded TSDB backends")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Address the proxy binds to
    #[arg(long = "web.listen-address", value_name = "ADDR")]
    listen_address: Option<String>,

    /// Backend selection strategy
    #[arg(long, value_name = "STRATEGY")]
    strategy: Option<Strategy>,

    /// Log level
    #[arg(long = "log.level", value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text, json)
    #[arg(long = "log.format", value_name = "FORMAT", default_value = "text")]
    log_format: String,
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

    init_logging(&cli.log_level, &cli.log_format);

    let mut config = match LbConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Some(address) = cli.listen_address {
        config.listen_address = address;
    }
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy;
    }

    let pools = match ClusterPools::new(
        config
            .clusters
            .iter()
            .map(|c| (c.id.clone(), c.backends.clone())),
        config.strategy,
    ) {
        Ok(pools) => Arc::new(pools),
        Err(e) => {
            error!(error = %e, "Failed to build backend pools");
            return ExitCode::FAILURE;
        }
    };

    let oracle: Arc<dyn OwnershipOracle> = match &config.auth.ownership {
        OwnershipConfig::Api { url } => match HttpOracle::new(url, &config.identity_header) {
            Ok(oracle) => Arc::new(oracle),
            Err(e) => {
                error!(error = %e, "Failed to create ownership client");
                return ExitCode::FAILURE;
            }
        },
        OwnershipConfig::Db { path } => match DbOracle::open(path) {
            Ok(oracle) => Arc::new(oracle),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to open collaborator database");
                return ExitCode::FAILURE;
            }
        },
    };

    let mut admins = AdminUsers::new(config.auth.admin_users.iter().cloned());
    let mut refresh_interval = None;

    if let Some(grafana_config) = &config.auth.grafana {
        match GrafanaClient::new(
            &grafana_config.url,
            grafana_config.team_id,
            grafana_config.api_token.clone(),
        ) {
            Ok(client) => {
                admins = admins.with_grafana(client);
                refresh_interval =
                    Some(Duration::from_secs(grafana_config.refresh_interval_seconds));
            }
            Err(e) => {
                error!(error = %e, "Failed to create Grafana client");
                return ExitCode::FAILURE;
            }
        }
    }

    let admins = Arc::new(admins);
    if let Some(interval) = refresh_interval {
        Arc::clone(&admins).spawn_refresher(interval);
    }

    let probe_interval = Duration::from_secs(config.probe_interval_seconds);
    spawn_prober(Arc::clone(&pools), probe_interval, probe_interval.min(Duration::from_secs(5)));

    let state = LbState::new(
        Arc::clone(&pools),
        Arc::new(Proxy::new(Duration::from_secs(config.request_timeout_seconds))),
        CLUSTER_ID_HEADER.to_string(),
    );
    let auth = Arc::new(AuthState {
        oracle,
        admins,
        identity_header: config.identity_header.clone(),
    });

    info!(
        strategy = %config.strategy,
        clusters = config.clusters.len(),
        "CEEMS load balancer configured"
    );

    match serve(state, auth, &config.listen_address).await {
        Ok(()) => {
            info!("CEEMS load balancer stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Load balancer failed");
            ExitCode::FAILURE
        }
    }
}
