use crate::registry::HandlerRegistry;
use scf_core::handler::{CancelFlag, HandlerCall, HandlerFn};
use scf_core::response::{CommandResponse, ErrorInfo};
use scf_core::wire::{CommandPayload, Envelope, Msg};
use scf_core::Config;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

const LATENCY_EMA_ALPHA: f64 = 0.2;
const RECENT_OUTCOMES: usize = 20;

#[derive(Debug, Clone, Default, serde::Serialize, PartialEq)]
pub struct CommandStatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub latency_ema_ms: Option<f64>,
    pub recent_failure_rate: f64,
}

pub struct CommandStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    latency_ema_ms: Mutex<Option<f64>>,
    recent: Mutex<std::collections::VecDeque<bool>>,
}

impl CommandStats {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            latency_ema_ms: Mutex::new(None),
            recent: Mutex::new(std::collections::VecDeque::with_capacity(RECENT_OUTCOMES)),
        }
    }

    fn start(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self, success: bool, elapsed: Duration) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if success {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        {
            let mut recent = self.recent.lock().expect("stats poisoned");
            if recent.len() == RECENT_OUTCOMES {
                recent.pop_front();
            }
            recent.push_back(success);
        }
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let mut ema = self.latency_ema_ms.lock().expect("stats poisoned");
        *ema = Some(match *ema {
            Some(current) => current + LATENCY_EMA_ALPHA * (elapsed_ms - current),
            None => elapsed_ms,
        });
    }

    pub fn snapshot(&self) -> CommandStatsSnapshot {
        let recent = self.recent.lock().expect("stats poisoned");
        let failure_rate = if recent.is_empty() {
            0.0
        } else {
            recent.iter().filter(|ok| !**ok).count() as f64 / recent.len() as f64
        };
        CommandStatsSnapshot {
            total: self.total.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            latency_ema_ms: *self.latency_ema_ms.lock().expect("stats poisoned"),
            recent_failure_rate: failure_rate,
        }
    }
}

struct InFlight {
    command: String,
    cancel: CancelFlag,
    started: Instant,
}

/// Dispatches incoming command envelopes to handlers, enforces the
/// per-command deadline, and always produces exactly one response per
/// command id.
pub struct Scheduler {
    registry: Arc<HandlerRegistry>,
    stats: Arc<CommandStats>,
    pool: Arc<Semaphore>,
    config: Arc<RwLock<Config>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    outbound: mpsc::Sender<Envelope>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        stats: Arc<CommandStats>,
        config: Arc<RwLock<Config>>,
        outbound: mpsc::Sender<Envelope>,
    ) -> Self {
        let pool_size = config.read().expect("config poisoned").worker_pool.size;
        Self {
            registry,
            stats,
            pool: Arc::new(Semaphore::new(pool_size)),
            config,
            in_flight: Mutex::new(HashMap::new()),
            outbound,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("in-flight poisoned").len()
    }

    /// Cancels whatever is still running; called when the hub connection
    /// drops. No responses are produced for the cancelled work.
    pub fn cancel_all(&self) {
        let in_flight = self.in_flight.lock().expect("in-flight poisoned");
        for record in in_flight.values() {
            record.cancel.cancel();
        }
        if !in_flight.is_empty() {
            info!(event = "in_flight_cancelled", count = in_flight.len());
        }
    }

    pub async fn dispatch(self: Arc<Self>, envelope_id: String, command: CommandPayload) {
        let handler = match self.registry.lookup(&command.command) {
            Some(handler) => handler,
            None => {
                debug!(event = "unknown_command", command = %command.command);
                let response = CommandResponse::error(
                    &command.command,
                    ErrorInfo::unknown_command(&command.command),
                );
                self.respond(&envelope_id, response).await;
                return;
            }
        };

        let timeout_s = command.timeout_s.unwrap_or_else(|| {
            handler
                .default_timeout
                .map(|d| d.as_secs_f64())
                .unwrap_or_else(|| {
                    self.config
                        .read()
                        .expect("config poisoned")
                        .command
                        .default_timeout_s
                })
        });
        if timeout_s <= 0.0 {
            let response =
                CommandResponse::error(&command.command, ErrorInfo::timeout(timeout_s));
            self.respond(&envelope_id, response).await;
            return;
        }
        let deadline = Duration::from_secs_f64(timeout_s);

        let cancel = CancelFlag::new();
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight poisoned");
            in_flight.insert(
                envelope_id.clone(),
                InFlight {
                    command: command.command.clone(),
                    cancel: cancel.clone(),
                    started: Instant::now(),
                },
            );
        }
        self.stats.start();

        let call = HandlerCall {
            params: command.params,
            cancelled: cancel.clone(),
        };
        let response = match &handler.invoke {
            HandlerFn::Cooperative(run) => {
                let started = Instant::now();
                let outcome = tokio::time::timeout(deadline, run.as_ref()(call)).await;
                let elapsed = started.elapsed();
                match outcome {
                    Ok(Ok(data)) => CommandResponse::success(&command.command, data)
                        .with_execution_time(elapsed.as_secs_f64()),
                    Ok(Err(error)) => CommandResponse::error(&command.command, error)
                        .with_execution_time(elapsed.as_secs_f64()),
                    Err(_) => {
                        cancel.cancel();
                        warn!(event = "command_timeout", command = %command.command, timeout_s = timeout_s);
                        CommandResponse::error(&command.command, ErrorInfo::timeout(timeout_s))
                            .with_execution_time(elapsed.as_secs_f64())
                    }
                }
            }
            HandlerFn::Blocking(run) => {
                let run = run.clone();
                let queue_start = Instant::now();
                let permit =
                    tokio::time::timeout(deadline, self.pool.clone().acquire_owned()).await;
                match permit {
                    Err(_) => {
                        cancel.cancel();
                        warn!(event = "command_timeout_queued", command = %command.command);
                        CommandResponse::error(&command.command, ErrorInfo::timeout(timeout_s))
                    }
                    Ok(Err(_)) => CommandResponse::error(
                        &command.command,
                        ErrorInfo::handler_failed("worker pool closed"),
                    ),
                    Ok(Ok(permit)) => {
                        let queued = queue_start.elapsed();
                        let remaining = deadline.saturating_sub(queued);
                        let started = Instant::now();
                        let handle = tokio::task::spawn_blocking(move || {
                            let _permit = permit;
                            run.as_ref()(call)
                        });
                        match tokio::time::timeout(remaining, handle).await {
                            Ok(Ok(Ok(data))) => {
                                let mut response =
                                    CommandResponse::success(&command.command, data)
                                        .with_execution_time(started.elapsed().as_secs_f64());
                                if queued > Duration::from_millis(1) {
                                    response.metadata.extra.insert(
                                        "queue_wait_s".to_string(),
                                        json!(queued.as_secs_f64()),
                                    );
                                }
                                response
                            }
                            Ok(Ok(Err(error))) => {
                                CommandResponse::error(&command.command, error)
                                    .with_execution_time(started.elapsed().as_secs_f64())
                            }
                            Ok(Err(join_err)) => {
                                warn!(event = "handler_panicked", command = %command.command, error = %join_err);
                                CommandResponse::error(
                                    &command.command,
                                    ErrorInfo::handler_failed(format!(
                                        "handler panicked: {join_err}"
                                    )),
                                )
                            }
                            Err(_) => {
                                // Abandoned: the blocking task keeps its
                                // permit until it actually returns; its
                                // result is discarded.
                                cancel.cancel();
                                warn!(event = "command_timeout", command = %command.command, timeout_s = timeout_s, abandoned = true);
                                CommandResponse::error(
                                    &command.command,
                                    ErrorInfo::timeout(timeout_s),
                                )
                                .with_execution_time(started.elapsed().as_secs_f64())
                            }
                        }
                    }
                }
            }
        };

        let elapsed = {
            let mut in_flight = self.in_flight.lock().expect("in-flight poisoned");
            in_flight
                .remove(&envelope_id)
                .map(|record| record.started.elapsed())
                .unwrap_or_default()
        };
        self.stats.finish(response.success, elapsed);
        self.respond(&envelope_id, response).await;
    }

    async fn respond(&self, envelope_id: &str, response: CommandResponse) {
        let envelope = Envelope::new(envelope_id, Msg::Response(response));
        if self.outbound.send(envelope).await.is_err() {
            warn!(event = "response_dropped", envelope_id = envelope_id);
        }
    }
}
