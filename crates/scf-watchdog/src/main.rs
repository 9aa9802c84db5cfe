use anyhow::{anyhow, Result};
use clap::Parser;
use scf_core::sentinel;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scf-watchdog")]
struct Args {
    /// Working directory shared with the endpoint; the restart sentinel
    /// lives here.
    #[arg(long)]
    workdir: Option<PathBuf>,
    #[arg(long, default_value_t = 5)]
    max_respawns: usize,
    #[arg(long, default_value_t = 60)]
    window_s: u64,
    /// Endpoint command line, preserved verbatim across respawns.
    #[arg(last = true)]
    cmd: Vec<String>,
}

struct RespawnBudget {
    window: Duration,
    max: usize,
    times: VecDeque<Instant>,
}

impl RespawnBudget {
    fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            times: VecDeque::new(),
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        while let Some(front) = self.times.front() {
            if now.duration_since(*front) > self.window {
                self.times.pop_front();
            } else {
                break;
            }
        }
        if self.times.len() >= self.max {
            return false;
        }
        self.times.push_back(now);
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if args.cmd.is_empty() {
        return Err(anyhow!("missing endpoint command after --"));
    }
    let workdir = match args.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    // A leftover sentinel from a previous run must not trigger a respawn.
    sentinel::remove_sentinel(&workdir)?;

    let mut budget = RespawnBudget::new(Duration::from_secs(args.window_s), args.max_respawns);
    info!(event = "watchdog_start", cmd = ?args.cmd, workdir = %workdir.display());

    loop {
        let mut child = tokio::process::Command::new(&args.cmd[0])
            .args(&args.cmd[1..])
            .current_dir(&workdir)
            .spawn()
            .map_err(|err| anyhow!("failed to spawn endpoint: {err}"))?;
        let pid = child.id();
        info!(event = "endpoint_spawned", pid = pid);

        let status = child.wait().await?;
        let clean = status.success();
        let requested = sentinel::read_sentinel(&workdir);
        sentinel::remove_sentinel(&workdir)?;

        match (clean, requested) {
            (true, Some(request)) => {
                info!(
                    event = "restart_requested",
                    reason = %request.reason,
                    requested_at = %request.requested_at
                );
            }
            (true, None) => {
                info!(event = "endpoint_exited", code = 0);
                return Ok(());
            }
            (false, _) => {
                warn!(event = "endpoint_crashed", status = %status);
            }
        }

        if !budget.allow(Instant::now()) {
            error!(
                event = "respawn_budget_exhausted",
                max = args.max_respawns,
                window_s = args.window_s
            );
            return Err(anyhow!(
                "endpoint respawned {} times within {}s, giving up",
                args.max_respawns,
                args.window_s
            ));
        }
    }
}
