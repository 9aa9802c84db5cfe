use clap::Parser;
use scf_core::config::{Config, DEFAULT_CONFIG_FILE};
use scf_endpoint::connection::{self, ExitReason};
use scf_endpoint::{health, hotreload, logging};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "scf-endpoint")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "")]
    hub_url: String,
    #[arg(long, default_value = "")]
    identity: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = resolve_config_path(args.config.clone());
    let mut config = match Config::load(config_path.as_deref()) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("config_error: {err}");
            std::process::exit(1);
        }
    };
    if !args.hub_url.trim().is_empty() {
        config.endpoint.hub_url = args.hub_url.clone();
    }
    if !args.identity.trim().is_empty() {
        config.endpoint.identity = args.identity.clone();
    }
    if !args.log_dir.trim().is_empty() {
        config.log.dir = PathBuf::from(&args.log_dir);
    }

    let logs = logging::init(&config.log, args.debug);
    info!(
        event = "endpoint_start",
        identity = %config.endpoint.identity,
        hub_url = %config.endpoint.hub_url,
        pid = std::process::id()
    );

    let hot_reload_enabled = config.hot_reload.enabled;
    let (endpoint, mut outbound_rx) = scf_endpoint::build(config, config_path, logs);

    tokio::spawn(health::run(
        endpoint.health.clone(),
        endpoint.config.clone(),
        endpoint.outbound.clone(),
    ));
    if hot_reload_enabled {
        tokio::spawn(hotreload::watch(
            endpoint.hotreload.clone(),
            endpoint.config.clone(),
        ));
    }

    match connection::run(endpoint, &mut outbound_rx).await {
        ExitReason::Evicted => {
            error!(event = "endpoint_exit", reason = "evicted");
            std::process::exit(1);
        }
        ExitReason::OutboundClosed => {
            error!(event = "endpoint_exit", reason = "outbound_closed");
            std::process::exit(1);
        }
    }
}

fn resolve_config_path(flag: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path);
    }
    if let Ok(value) = std::env::var("SCF_CONFIG") {
        if !value.trim().is_empty() {
            return Some(PathBuf::from(value));
        }
    }
    let default = PathBuf::from(DEFAULT_CONFIG_FILE);
    if default.exists() {
        return Some(default);
    }
    None
}
