use clap::Parser;
use scf_core::config::Config;
use scf_core::wire::DEFAULT_MAX_FRAME_BYTES;
use scf_hub::state::HubState;
use scf_hub::{plugins, socket};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scf-hub")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "")]
    host: String,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "config_error", error = %err);
            return;
        }
    };
    if !args.host.trim().is_empty() {
        config.hub.host = args.host.clone();
    }
    if let Some(port) = args.port {
        config.hub.port = port;
    }

    let addr: SocketAddr = match format!("{}:{}", config.hub.host, config.hub.port).parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, host = %config.hub.host, port = config.hub.port);
            return;
        }
    };

    let hub = Arc::new(HubState::new(config).with_max_frame_bytes(args.max_frame_bytes));
    hub.commands.reload(&plugins::catalog());
    socket::start_stale_reaper(hub.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %addr);
            return;
        }
    };

    info!(event = "hub_start", addr = %addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        scf_hub::app(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("SCF_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
