use scf_core::sentinel;
use scf_core::wire::{Envelope, EventPayload, Msg};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

const FLUSH_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduledRestart {
    pub delay_s: f64,
    pub use_watchdog: bool,
    pub reason: String,
}

/// Coordinates the supervised-restart protocol: immediate success
/// response, delayed shutdown, sentinel for the watchdog or a
/// self-respawn without one.
pub struct RestartCoordinator {
    exe: PathBuf,
    args: Vec<String>,
    workdir: PathBuf,
    outbound: mpsc::Sender<Envelope>,
    scheduled: Mutex<Option<ScheduledRestart>>,
}

impl RestartCoordinator {
    pub fn new(outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            exe: std::env::current_exe().unwrap_or_default(),
            args: std::env::args().skip(1).collect(),
            workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            outbound,
            scheduled: Mutex::new(None),
        }
    }

    pub fn scheduled(&self) -> Option<ScheduledRestart> {
        self.scheduled.lock().expect("restart poisoned").clone()
    }

    pub fn schedule(
        self: &Arc<Self>,
        delay_s: f64,
        use_watchdog: bool,
        reason: String,
    ) -> Result<ScheduledRestart, String> {
        let request = ScheduledRestart {
            delay_s,
            use_watchdog,
            reason,
        };
        {
            let mut scheduled = self.scheduled.lock().expect("restart poisoned");
            if scheduled.is_some() {
                return Err("restart already scheduled".to_string());
            }
            *scheduled = Some(request.clone());
        }
        info!(
            event = "restart_scheduled",
            delay_s = delay_s,
            use_watchdog = use_watchdog,
            reason = %request.reason
        );
        let coordinator = self.clone();
        let scheduled = request.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(scheduled.delay_s.max(0.0))).await;
            coordinator.execute(&scheduled).await;
        });
        Ok(request)
    }

    async fn execute(&self, scheduled: &ScheduledRestart) {
        let notice = Envelope::new(
            "restart-notice",
            Msg::Event(EventPayload {
                kind: "restarting".to_string(),
                data: json!({
                    "reason": scheduled.reason,
                    "use_watchdog": scheduled.use_watchdog,
                }),
            }),
        );
        let _ = self.outbound.send(notice).await;
        tokio::time::sleep(FLUSH_GRACE).await;

        if scheduled.use_watchdog {
            match sentinel::write_sentinel(&self.workdir, &scheduled.reason) {
                Ok(path) => info!(event = "restart_sentinel_written", path = %path.display()),
                Err(err) => error!(event = "restart_sentinel_failed", error = %err),
            }
            info!(event = "restart_exit", mode = "watchdog");
            std::process::exit(0);
        }

        // No watchdog: spawn a fresh copy of ourselves with the original
        // argument vector, then exit.
        match std::process::Command::new(&self.exe).args(&self.args).spawn() {
            Ok(child) => {
                info!(event = "restart_exit", mode = "respawn", child_pid = child.id());
                std::process::exit(0);
            }
            Err(err) => {
                error!(event = "restart_respawn_failed", error = %err);
                std::process::exit(1);
            }
        }
    }
}
