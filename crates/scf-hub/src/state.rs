use crate::plugins::CommandTable;
use crate::registry::SessionRegistry;
use crate::router::Router;
use chrono::{DateTime, Utc};
use scf_core::Config;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct HubStats {
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    pub forwarded_total: AtomicU64,
    pub broadcasts_total: AtomicU64,
    pub responses_routed: AtomicU64,
    pub timeouts_total: AtomicU64,
}

impl HubStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            forwarded_total: AtomicU64::new(0),
            broadcasts_total: AtomicU64::new(0),
            responses_routed: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
        }
    }
}

pub struct HubState {
    pub config: Config,
    pub max_frame_bytes: usize,
    pub registry: SessionRegistry,
    pub router: Router,
    pub commands: CommandTable,
    pub stats: HubStats,
    envelope_counter: AtomicU64,
}

impl HubState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            max_frame_bytes: scf_core::wire::DEFAULT_MAX_FRAME_BYTES,
            registry: SessionRegistry::new(),
            router: Router::new(),
            commands: CommandTable::new(),
            stats: HubStats::new(),
            envelope_counter: AtomicU64::new(0),
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn next_envelope_id(&self) -> String {
        let n = self.envelope_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("hub-{n}")
    }

    pub fn uptime_s(&self) -> u64 {
        self.stats.started.elapsed().as_secs()
    }
}
