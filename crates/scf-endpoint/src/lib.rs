pub mod connection;
pub mod handlers;
pub mod health;
pub mod hotreload;
pub mod logging;
pub mod registry;
pub mod restart;
pub mod scheduler;

use handlers::CoreServices;
use health::HealthMonitor;
use hotreload::HotReloadManager;
use logging::LogManager;
use registry::HandlerRegistry;
use restart::RestartCoordinator;
use scf_core::handler::HandlerSet;
use scf_core::wire::Envelope;
use scf_core::Config;
use scheduler::{CommandStats, Scheduler};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::warn;

const OUTBOUND_QUEUE: usize = 256;

/// Everything the endpoint process owns: scheduler, handler registry,
/// health monitor, log manager, reload and restart coordinators, plus
/// the outbound channel feeding the hub connection.
pub struct Endpoint {
    pub config: Arc<RwLock<Config>>,
    pub registry: Arc<HandlerRegistry>,
    pub stats: Arc<CommandStats>,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthMonitor>,
    pub logs: Arc<LogManager>,
    pub hotreload: Arc<HotReloadManager>,
    pub restart: Arc<RestartCoordinator>,
    pub outbound: mpsc::Sender<Envelope>,
}

pub fn handler_catalog() -> Vec<HandlerSet> {
    vec![scf_session_tools::handler_set()]
}

pub fn build(
    config: Config,
    config_path: Option<PathBuf>,
    logs: Arc<LogManager>,
) -> (Arc<Endpoint>, mpsc::Receiver<Envelope>) {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let config = Arc::new(RwLock::new(config));
    let registry = Arc::new(HandlerRegistry::new());
    let stats = Arc::new(CommandStats::new());
    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        stats.clone(),
        config.clone(),
        outbound_tx.clone(),
    ));
    let health = Arc::new(HealthMonitor::new(stats.clone()));
    let catalog = handler_catalog();
    let hotreload = Arc::new(HotReloadManager::new(
        config_path,
        catalog.clone(),
        registry.clone(),
        config.clone(),
    ));
    let restart = Arc::new(RestartCoordinator::new(outbound_tx.clone()));

    handlers::register_builtins(&CoreServices {
        config: config.clone(),
        registry: registry.clone(),
        health: health.clone(),
        logs: logs.clone(),
        hotreload: hotreload.clone(),
        restart: restart.clone(),
    });
    // Initial plugin load is lenient: a broken set is skipped so the
    // core surface still comes up.
    for set in &catalog {
        match (set.build)() {
            Ok(specs) => registry.register_set(set.module, specs),
            Err(err) => warn!(event = "handler_set_failed", module = set.module, error = %err),
        }
    }

    let endpoint = Arc::new(Endpoint {
        config,
        registry,
        stats,
        scheduler,
        health,
        logs,
        hotreload,
        restart,
        outbound: outbound_tx,
    });
    (endpoint, outbound_rx)
}
