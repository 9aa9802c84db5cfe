use chrono::{DateTime, Utc};
use scf_core::config::LogConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

pub const LOG_BASE_NAME: &str = "scf-endpoint";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogRecord {
    pub level: String,
    pub timestamp: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn level_rank(level: &str) -> Option<u8> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some(0),
        "debug" => Some(1),
        "info" => Some(2),
        "warn" => Some(3),
        "error" => Some(4),
        _ => None,
    }
}

/// Fixed-capacity record buffer backing `get_logs`. A record is never
/// displaced until capacity forces the oldest one out.
pub struct LogRing {
    records: Mutex<VecDeque<LogRecord>>,
    counts: Mutex<HashMap<String, u64>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            counts: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn push(&self, record: LogRecord) {
        {
            let mut counts = self.counts.lock().expect("log counts poisoned");
            *counts.entry(record.level.clone()).or_insert(0) += 1;
        }
        let mut records = self.records.lock().expect("log ring poisoned");
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("log ring poisoned").len()
    }

    pub fn query(&self, query: &LogQuery) -> Vec<LogRecord> {
        let min_rank = query.level.as_deref().and_then(level_rank);
        let since = query
            .since
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));
        let records = self.records.lock().expect("log ring poisoned");
        let mut matched: Vec<LogRecord> = records
            .iter()
            .filter(|record| {
                if let Some(min) = min_rank {
                    match level_rank(&record.level) {
                        Some(rank) if rank >= min => {}
                        _ => return false,
                    }
                }
                if let Some(name) = query.name.as_deref() {
                    if !record.target.contains(name) {
                        return false;
                    }
                }
                if let Some(since) = since {
                    match DateTime::parse_from_rfc3339(&record.timestamp) {
                        Ok(ts) if ts.with_timezone(&Utc) >= since => {}
                        _ => return false,
                    }
                }
                true
            })
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            let start = matched.len().saturating_sub(limit);
            matched.drain(..start);
        }
        matched
    }

    pub fn stats(&self) -> Value {
        let counts = self.counts.lock().expect("log counts poisoned");
        let by_level: BTreeMap<String, u64> =
            counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let total: u64 = by_level.values().sum();
        json!({
            "total": total,
            "by_level": by_level,
            "ring_len": self.len(),
            "ring_capacity": self.capacity,
        })
    }
}

/// Captures every event that passes the global filter into the ring.
pub struct RingLayer {
    ring: Arc<LogRing>,
}

impl RingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor {
            message: String::new(),
            fields: Vec::new(),
        };
        event.record(&mut visitor);
        let message = if visitor.fields.is_empty() {
            visitor.message
        } else {
            let fields: String = visitor
                .fields
                .iter()
                .map(|(key, value)| format!(" {key}={value}"))
                .collect();
            let mut message = visitor.message;
            message.push_str(&fields);
            message
        };
        self.ring.push(LogRecord {
            level: metadata.level().to_string().to_lowercase(),
            timestamp: Utc::now().to_rfc3339(),
            target: metadata.target().to_string(),
            message,
        });
    }
}

struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

/// Size-rotated append writer: `name.log` is newest, `name.log.1` the
/// previous generation, up to `name.log.<backups>`.
pub struct RotatingWriter {
    dir: PathBuf,
    base: String,
    max_bytes: u64,
    backups: u32,
    file: File,
    written: u64,
}

impl RotatingWriter {
    pub fn new(dir: &Path, base: &str, max_bytes: u64, backups: u32) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{base}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            max_bytes,
            backups,
            file,
            written,
        })
    }

    fn path_for(&self, index: u32) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}.log", self.base))
        } else {
            self.dir.join(format!("{}.log.{index}", self.base))
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();
        if self.backups == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.path_for(0))?;
            self.written = 0;
            return Ok(());
        }
        let _ = std::fs::remove_file(self.path_for(self.backups));
        for index in (1..=self.backups).rev() {
            let from = self.path_for(index - 1);
            if from.exists() {
                let _ = std::fs::rename(from, self.path_for(index));
            }
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(0))?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0 && self.written > 0 && self.written + buf.len() as u64 > self.max_bytes
        {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<RotatingWriter>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<RotatingWriter>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().expect("log file poisoned");
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().expect("log file poisoned");
            let _ = file.flush();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelState {
    pub global: String,
    pub per_target: BTreeMap<String, String>,
}

impl LevelState {
    pub fn new(global: &str) -> Self {
        Self {
            global: global.to_string(),
            per_target: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, level: &str, target: Option<&str>) -> Result<(), String> {
        if level_rank(level).is_none() {
            return Err(format!("unknown log level '{level}'"));
        }
        let level = level.to_ascii_lowercase();
        match target {
            Some(target) => {
                self.per_target.insert(target.to_string(), level);
            }
            None => self.global = level,
        }
        Ok(())
    }

    pub fn directives(&self) -> String {
        let mut parts = vec![self.global.clone()];
        for (target, level) in &self.per_target {
            parts.push(format!("{target}={level}"));
        }
        parts.join(",")
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

pub struct LogManager {
    pub ring: Arc<LogRing>,
    handle: FilterHandle,
    levels: Mutex<LevelState>,
}

impl LogManager {
    pub fn set_level(&self, level: &str, target: Option<&str>) -> Result<String, String> {
        let mut levels = self.levels.lock().expect("level state poisoned");
        let mut next = levels.clone();
        next.set(level, target)?;
        let directives = next.directives();
        let filter = EnvFilter::try_new(&directives).map_err(|err| err.to_string())?;
        self.handle.reload(filter).map_err(|err| err.to_string())?;
        *levels = next;
        Ok(directives)
    }

    pub fn current_directives(&self) -> String {
        self.levels.lock().expect("level state poisoned").directives()
    }
}

/// Builds a manager whose filter handle is not installed globally; the
/// returned layer must be kept alive for `set_level` to keep working.
#[cfg(test)]
pub(crate) fn detached_for_tests(
    ring_size: usize,
) -> (Arc<LogManager>, reload::Layer<EnvFilter, Registry>) {
    let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
    let manager = Arc::new(LogManager {
        ring: Arc::new(LogRing::new(ring_size)),
        handle,
        levels: Mutex::new(LevelState::new("info")),
    });
    (manager, layer)
}

/// Installs the global subscriber: reloadable filter, stdout + rotating
/// file output, and the in-memory ring.
pub fn init(config: &LogConfig, debug: bool) -> Arc<LogManager> {
    let default_level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("SCF_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let ring = Arc::new(LogRing::new(config.ring_size));
    let file = match RotatingWriter::new(&config.dir, LOG_BASE_NAME, config.max_bytes, config.backups)
    {
        Ok(writer) => Some(Arc::new(Mutex::new(writer))),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let make_file = file.clone();
    let fmt_layer =
        tracing_subscriber::fmt::layer().with_writer(move || MultiWriter::new(make_file.clone()));
    let ring_layer = RingLayer::new(ring.clone());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ring_layer)
        .init();

    Arc::new(LogManager {
        ring,
        handle,
        levels: Mutex::new(LevelState::new(&default_level)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: &str, target: &str, message: &str, ts: &str) -> LogRecord {
        LogRecord {
            level: level.to_string(),
            timestamp: ts.to_string(),
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn ring_keeps_only_newest_records() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(record(
                "info",
                "scf",
                &format!("m{i}"),
                &format!("2026-07-30T10:00:0{i}Z"),
            ));
        }
        let records = ring.query(&LogQuery::default());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "m2");
        assert_eq!(records[2].message, "m4");
        for pair in records.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn query_filters_by_level_name_and_since() {
        let ring = LogRing::new(16);
        ring.push(record("debug", "scf::scheduler", "noisy", "2026-07-30T10:00:00Z"));
        ring.push(record("warn", "scf::scheduler", "slow", "2026-07-30T10:00:01Z"));
        ring.push(record("error", "scf::connection", "lost", "2026-07-30T10:00:02Z"));

        let warnings = ring.query(&LogQuery {
            level: Some("warn".to_string()),
            ..Default::default()
        });
        assert_eq!(warnings.len(), 2);

        let scheduler_only = ring.query(&LogQuery {
            name: Some("scheduler".to_string()),
            ..Default::default()
        });
        assert_eq!(scheduler_only.len(), 2);

        let recent = ring.query(&LogQuery {
            since: Some("2026-07-30T10:00:02Z".to_string()),
            ..Default::default()
        });
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "lost");

        let limited = ring.query(&LogQuery {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].message, "lost");
    }

    #[test]
    fn stats_count_by_level() {
        let ring = LogRing::new(4);
        ring.push(record("info", "a", "1", "2026-07-30T10:00:00Z"));
        ring.push(record("info", "a", "2", "2026-07-30T10:00:01Z"));
        ring.push(record("error", "a", "3", "2026-07-30T10:00:02Z"));
        let stats = ring.stats();
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["by_level"]["info"], 2);
        assert_eq!(stats["by_level"]["error"], 1);
        assert_eq!(stats["ring_capacity"], 4);
    }

    #[test]
    fn rotation_shifts_generations_and_caps_backups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = RotatingWriter::new(dir.path(), "t", 32, 2).expect("writer");
        for _ in 0..6 {
            writer.write_all(b"0123456789012345678901234\n").expect("write");
        }
        writer.flush().expect("flush");

        assert!(dir.path().join("t.log").exists());
        assert!(dir.path().join("t.log.1").exists());
        assert!(dir.path().join("t.log.2").exists());
        assert!(!dir.path().join("t.log.3").exists());
    }

    #[test]
    fn rotation_preserves_newest_content_in_live_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = RotatingWriter::new(dir.path(), "t", 16, 1).expect("writer");
        writer.write_all(b"older-older-old\n").expect("write");
        writer.write_all(b"newest\n").expect("write");
        writer.flush().expect("flush");
        let live = std::fs::read_to_string(dir.path().join("t.log")).expect("read");
        assert_eq!(live, "newest\n");
        let rolled = std::fs::read_to_string(dir.path().join("t.log.1")).expect("read");
        assert_eq!(rolled, "older-older-old\n");
    }

    #[test]
    fn level_state_is_idempotent_and_ordered() {
        let mut state = LevelState::new("info");
        state.set("warn", None).expect("set global");
        state.set("debug", Some("scf_endpoint::scheduler")).expect("set target");
        let first = state.directives();
        state.set("warn", None).expect("set again");
        assert_eq!(state.directives(), first);
        assert_eq!(first, "warn,scf_endpoint::scheduler=debug");
    }

    #[test]
    fn level_state_rejects_unknown_levels() {
        let mut state = LevelState::new("info");
        assert!(state.set("loud", None).is_err());
        assert_eq!(state.directives(), "info");
    }
}
