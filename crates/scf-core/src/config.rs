use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_OVERRIDE_PREFIX: &str = "OVERRIDE_";
pub const DEFAULT_CONFIG_FILE: &str = "scf.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub hub: HubConfig,
    pub endpoint: EndpointConfig,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    pub command: CommandConfig,
    pub worker_pool: WorkerPoolConfig,
    pub health: HealthConfig,
    pub log: LogConfig,
    pub hot_reload: HotReloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9998,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    pub hub_url: String,
    pub identity: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://localhost:9998".to_string(),
            identity: whoami::username(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_s: u64,
    pub stale_multiplier: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_s: 30,
            stale_multiplier: 2.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_s: f64,
    pub max_s: f64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_s: 1.0,
            max_s: 60.0,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    pub default_timeout_s: f64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_s: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { size: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub sample_interval_s: u64,
    /// 0 disables the RSS ceiling check.
    pub max_rss_bytes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval_s: 5,
            max_rss_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub backups: u32,
    pub ring_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            max_bytes: 10 * 1024 * 1024,
            backups: 5,
            ring_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HotReloadConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    HeartbeatIntervalS(u64),
    StaleMultiplier(f64),
    DefaultTimeoutS(f64),
    HealthSampleIntervalS(u64),
    MaxRssBytes(u64),
    HotReloadDebounceMs(u64),
    RestartRequired { key: String },
}

impl std::fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigChange::HeartbeatIntervalS(v) => write!(f, "heartbeat.interval_s={v}"),
            ConfigChange::StaleMultiplier(v) => write!(f, "heartbeat.stale_multiplier={v}"),
            ConfigChange::DefaultTimeoutS(v) => write!(f, "command.default_timeout_s={v}"),
            ConfigChange::HealthSampleIntervalS(v) => write!(f, "health.sample_interval_s={v}"),
            ConfigChange::MaxRssBytes(v) => write!(f, "health.max_rss_bytes={v}"),
            ConfigChange::HotReloadDebounceMs(v) => write!(f, "hot_reload.debounce_ms={v}"),
            ConfigChange::RestartRequired { key } => write!(f, "restart required: {key}"),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix(ENV_OVERRIDE_PREFIX) else {
                continue;
            };
            self.apply_override(suffix, &value);
        }
    }

    // Unparseable overrides keep the prior value.
    fn apply_override(&mut self, key: &str, value: &str) {
        let _ = match key {
            "HUB_HOST" => {
                self.hub.host = value.to_string();
                true
            }
            "HUB_PORT" => parse_into(value, &mut self.hub.port),
            "ENDPOINT_HUB_URL" => {
                self.endpoint.hub_url = value.to_string();
                true
            }
            "ENDPOINT_IDENTITY" => {
                self.endpoint.identity = value.to_string();
                true
            }
            "HEARTBEAT_INTERVAL_S" => parse_into(value, &mut self.heartbeat.interval_s),
            "HEARTBEAT_STALE_MULTIPLIER" => parse_into(value, &mut self.heartbeat.stale_multiplier),
            "RECONNECT_INITIAL_S" => parse_into(value, &mut self.reconnect.initial_s),
            "RECONNECT_MAX_S" => parse_into(value, &mut self.reconnect.max_s),
            "RECONNECT_MULTIPLIER" => parse_into(value, &mut self.reconnect.multiplier),
            "RECONNECT_JITTER" => parse_into(value, &mut self.reconnect.jitter),
            "COMMAND_DEFAULT_TIMEOUT_S" => parse_into(value, &mut self.command.default_timeout_s),
            "WORKER_POOL_SIZE" => parse_into(value, &mut self.worker_pool.size),
            "HEALTH_SAMPLE_INTERVAL_S" => parse_into(value, &mut self.health.sample_interval_s),
            "HEALTH_MAX_RSS_BYTES" => parse_into(value, &mut self.health.max_rss_bytes),
            "LOG_DIR" => {
                self.log.dir = PathBuf::from(value);
                true
            }
            "LOG_MAX_BYTES" => parse_into(value, &mut self.log.max_bytes),
            "LOG_BACKUPS" => parse_into(value, &mut self.log.backups),
            "LOG_RING_SIZE" => parse_into(value, &mut self.log.ring_size),
            "HOT_RELOAD_ENABLED" => parse_into(value, &mut self.hot_reload.enabled),
            "HOT_RELOAD_DEBOUNCE_MS" => parse_into(value, &mut self.hot_reload.debounce_ms),
            _ => return,
        };
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.identity.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint.identity is empty".to_string()));
        }
        if self.heartbeat.interval_s == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_s must be positive".to_string(),
            ));
        }
        if self.heartbeat.stale_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "heartbeat.stale_multiplier must be >= 1".to_string(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnect.multiplier must be >= 1".to_string(),
            ));
        }
        if self.reconnect.initial_s <= 0.0 || self.reconnect.max_s < self.reconnect.initial_s {
            return Err(ConfigError::Invalid(
                "reconnect backoff bounds are inverted".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid(
                "reconnect.jitter must be within [0, 1]".to_string(),
            ));
        }
        if self.command.default_timeout_s <= 0.0 {
            return Err(ConfigError::Invalid(
                "command.default_timeout_s must be positive".to_string(),
            ));
        }
        if self.worker_pool.size == 0 {
            return Err(ConfigError::Invalid(
                "worker_pool.size must be positive".to_string(),
            ));
        }
        if self.log.ring_size == 0 {
            return Err(ConfigError::Invalid("log.ring_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn stale_threshold_s(&self) -> f64 {
        self.heartbeat.interval_s as f64 * self.heartbeat.stale_multiplier
    }

    /// Live-safe differences become typed changes; everything else is
    /// reported as RestartRequired with the offending key.
    pub fn diff(&self, next: &Config) -> Vec<ConfigChange> {
        let mut changes = Vec::new();
        if self.heartbeat.interval_s != next.heartbeat.interval_s {
            changes.push(ConfigChange::HeartbeatIntervalS(next.heartbeat.interval_s));
        }
        if self.heartbeat.stale_multiplier != next.heartbeat.stale_multiplier {
            changes.push(ConfigChange::StaleMultiplier(next.heartbeat.stale_multiplier));
        }
        if self.command.default_timeout_s != next.command.default_timeout_s {
            changes.push(ConfigChange::DefaultTimeoutS(next.command.default_timeout_s));
        }
        if self.health.sample_interval_s != next.health.sample_interval_s {
            changes.push(ConfigChange::HealthSampleIntervalS(next.health.sample_interval_s));
        }
        if self.health.max_rss_bytes != next.health.max_rss_bytes {
            changes.push(ConfigChange::MaxRssBytes(next.health.max_rss_bytes));
        }
        if self.hot_reload.debounce_ms != next.hot_reload.debounce_ms {
            changes.push(ConfigChange::HotReloadDebounceMs(next.hot_reload.debounce_ms));
        }
        for (changed, key) in [
            (self.hub.host != next.hub.host, "hub.host"),
            (self.hub.port != next.hub.port, "hub.port"),
            (self.endpoint.hub_url != next.endpoint.hub_url, "endpoint.hub_url"),
            (self.endpoint.identity != next.endpoint.identity, "endpoint.identity"),
            (self.reconnect != next.reconnect, "reconnect"),
            (self.worker_pool.size != next.worker_pool.size, "worker_pool.size"),
            (self.log != next.log, "log"),
            (self.hot_reload.enabled != next.hot_reload.enabled, "hot_reload.enabled"),
        ] {
            if changed {
                changes.push(ConfigChange::RestartRequired {
                    key: key.to_string(),
                });
            }
        }
        changes
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
    match value.trim().parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}
