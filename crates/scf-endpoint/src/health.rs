use crate::scheduler::{CommandStats, CommandStatsSnapshot};
use chrono::Utc;
use scf_core::wire::{Envelope, EventPayload, Msg};
use scf_core::Config;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const SAMPLE_RING: usize = 720;

const CPU_DEGRADED_PCT: f64 = 70.0;
const CPU_UNHEALTHY_PCT: f64 = 90.0;
const CPU_UNHEALTHY_STREAK: u32 = 3;
const FAILURE_RATE_DEGRADED: f64 = 0.25;
const FAILURE_RATE_UNHEALTHY: f64 = 0.5;
const CPU_EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSample {
    pub timestamp: String,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub open_fds: u64,
    pub uptime_s: u64,
    pub commands: CommandStatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_rtt_ms: Option<f64>,
}

pub struct HealthMonitor {
    started: Instant,
    stats: Arc<CommandStats>,
    pid: Pid,
    sys: Mutex<System>,
    samples: Mutex<VecDeque<HealthSample>>,
    cpu_ema: Mutex<f64>,
    high_cpu_streak: AtomicU64,
    status: Mutex<HealthStatus>,
    heartbeat_rtt_ms: Mutex<Option<f64>>,
}

impl HealthMonitor {
    pub fn new(stats: Arc<CommandStats>) -> Self {
        let pid = sysinfo::get_current_pid().unwrap_or_else(|_| Pid::from_u32(0));
        Self {
            started: Instant::now(),
            stats,
            pid,
            sys: Mutex::new(System::new()),
            samples: Mutex::new(VecDeque::with_capacity(SAMPLE_RING)),
            cpu_ema: Mutex::new(0.0),
            high_cpu_streak: AtomicU64::new(0),
            status: Mutex::new(HealthStatus::Healthy),
            heartbeat_rtt_ms: Mutex::new(None),
        }
    }

    pub fn record_heartbeat_rtt(&self, rtt_ms: f64) {
        let mut slot = self.heartbeat_rtt_ms.lock().expect("health poisoned");
        *slot = Some(match *slot {
            Some(ema) => ema + 0.2 * (rtt_ms - ema),
            None => rtt_ms,
        });
    }

    pub fn sample(&self, max_rss_bytes: u64) -> (HealthSample, HealthStatus) {
        let (cpu_percent, rss_bytes) = {
            let mut sys = self.sys.lock().expect("health poisoned");
            sys.refresh_process(self.pid);
            match sys.process(self.pid) {
                Some(process) => (process.cpu_usage() as f64, process.memory()),
                None => (0.0, 0),
            }
        };
        let sample = HealthSample {
            timestamp: Utc::now().to_rfc3339(),
            cpu_percent,
            rss_bytes,
            open_fds: open_fd_count(),
            uptime_s: self.started.elapsed().as_secs(),
            commands: self.stats.snapshot(),
            heartbeat_rtt_ms: *self.heartbeat_rtt_ms.lock().expect("health poisoned"),
        };

        let cpu_ema = {
            let mut ema = self.cpu_ema.lock().expect("health poisoned");
            *ema += CPU_EMA_ALPHA * (cpu_percent - *ema);
            *ema
        };
        let streak = if cpu_ema > CPU_UNHEALTHY_PCT {
            self.high_cpu_streak.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.high_cpu_streak.store(0, Ordering::SeqCst);
            0
        };

        let status = derive_status(
            cpu_ema,
            streak as u32,
            rss_bytes,
            max_rss_bytes,
            sample.commands.recent_failure_rate,
            sample.commands.total,
        );
        {
            let mut current = self.status.lock().expect("health poisoned");
            *current = status;
        }

        let mut samples = self.samples.lock().expect("health poisoned");
        if samples.len() == SAMPLE_RING {
            samples.pop_front();
        }
        samples.push_back(sample.clone());
        (sample, status)
    }

    pub fn latest(&self) -> Option<(HealthSample, HealthStatus)> {
        let samples = self.samples.lock().expect("health poisoned");
        let status = *self.status.lock().expect("health poisoned");
        samples.back().cloned().map(|sample| (sample, status))
    }

    pub fn status(&self) -> HealthStatus {
        *self.status.lock().expect("health poisoned")
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().expect("health poisoned").len()
    }
}

fn derive_status(
    cpu_ema: f64,
    high_cpu_streak: u32,
    rss_bytes: u64,
    max_rss_bytes: u64,
    recent_failure_rate: f64,
    commands_total: u64,
) -> HealthStatus {
    let failures_meaningful = commands_total >= 5;
    if high_cpu_streak >= CPU_UNHEALTHY_STREAK
        || (max_rss_bytes > 0 && rss_bytes > max_rss_bytes)
        || (failures_meaningful && recent_failure_rate > FAILURE_RATE_UNHEALTHY)
    {
        return HealthStatus::Unhealthy;
    }
    if cpu_ema > CPU_DEGRADED_PCT || (failures_meaningful && recent_failure_rate > FAILURE_RATE_DEGRADED)
    {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

#[cfg(target_os = "linux")]
fn open_fd_count() -> u64 {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count() as u64)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn open_fd_count() -> u64 {
    0
}

/// Sampling loop. Reads the cadence from the live config on every tick
/// so a hot reload takes effect without restart; emits an unsolicited
/// event when health flips to unhealthy.
pub async fn run(
    monitor: Arc<HealthMonitor>,
    config: Arc<RwLock<Config>>,
    outbound: mpsc::Sender<Envelope>,
) {
    let mut previous = HealthStatus::Healthy;
    let mut alert_counter: u64 = 0;
    loop {
        let (interval_s, max_rss) = {
            let config = config.read().expect("config poisoned");
            (config.health.sample_interval_s, config.health.max_rss_bytes)
        };
        tokio::time::sleep(Duration::from_secs(interval_s.max(1))).await;
        let (sample, status) = monitor.sample(max_rss);
        if status != previous {
            info!(
                event = "health_transition",
                from = previous.as_str(),
                to = status.as_str(),
                cpu_percent = sample.cpu_percent,
                failure_rate = sample.commands.recent_failure_rate
            );
            if status == HealthStatus::Unhealthy {
                alert_counter += 1;
                let envelope = Envelope::new(
                    format!("alert-{alert_counter}"),
                    Msg::Event(EventPayload {
                        kind: "health_alert".to_string(),
                        data: json!({"status": status.as_str(), "sample": sample}),
                    }),
                );
                if outbound.send(envelope).await.is_err() {
                    warn!(event = "health_alert_dropped");
                }
            }
            previous = status;
        }
    }
}
