use crate::registry::HandlerRegistry;
use chrono::Utc;
use notify::{RecursiveMode, Watcher};
use scf_core::handler::HandlerSet;
use scf_core::{Config, ConfigChange};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct HotReloadManager {
    config_path: Option<PathBuf>,
    catalog: Vec<HandlerSet>,
    registry: Arc<HandlerRegistry>,
    config: Arc<RwLock<Config>>,
    restart_required: Mutex<BTreeSet<String>>,
    last_module_reload: Mutex<Option<String>>,
    last_config_reload: Mutex<Option<String>>,
}

impl HotReloadManager {
    pub fn new(
        config_path: Option<PathBuf>,
        catalog: Vec<HandlerSet>,
        registry: Arc<HandlerRegistry>,
        config: Arc<RwLock<Config>>,
    ) -> Self {
        Self {
            config_path,
            catalog,
            registry,
            config,
            restart_required: Mutex::new(BTreeSet::new()),
            last_module_reload: Mutex::new(None),
            last_config_reload: Mutex::new(None),
        }
    }

    /// Rebuilds handler sets and swaps them into the registry. All
    /// requested sets must build before any of them is applied; a
    /// failing build leaves every previous registration in place.
    pub fn reload_modules(&self, target: Option<&str>) -> Result<Vec<String>, String> {
        let selected: Vec<&HandlerSet> = self
            .catalog
            .iter()
            .filter(|set| target.map(|name| name == set.module).unwrap_or(true))
            .collect();
        if selected.is_empty() {
            return Err(match target {
                Some(name) => format!("unknown module '{name}'"),
                None => "no reloadable modules".to_string(),
            });
        }

        let mut staged = Vec::with_capacity(selected.len());
        for set in &selected {
            let specs = (set.build)()
                .map_err(|err| format!("module '{}' failed to build: {err}", set.module))?;
            staged.push((set.module, specs));
        }

        let mut reloaded = Vec::with_capacity(staged.len());
        for (module, specs) in staged {
            self.registry.register_set(module, specs);
            reloaded.push(module.to_string());
        }
        *self.last_module_reload.lock().expect("hot reload poisoned") =
            Some(Utc::now().to_rfc3339());
        info!(event = "modules_reloaded", modules = ?reloaded);
        Ok(reloaded)
    }

    /// Re-reads the config file, applies live-safe changes to the shared
    /// snapshot, and records the rest as restart-required.
    pub fn reload_config(&self) -> Result<Vec<String>, String> {
        let path = self
            .config_path
            .as_deref()
            .ok_or_else(|| "no config file configured".to_string())?;
        let mut incoming =
            Config::from_file(path).map_err(|err| format!("config reload failed: {err}"))?;
        incoming.apply_env_overrides(std::env::vars());
        incoming
            .validate()
            .map_err(|err| format!("config reload failed: {err}"))?;

        let current = self.config.read().expect("config poisoned").clone();
        let changes = current.diff(&incoming);
        let mut applied = current;
        for change in &changes {
            match change {
                ConfigChange::HeartbeatIntervalS(v) => applied.heartbeat.interval_s = *v,
                ConfigChange::StaleMultiplier(v) => applied.heartbeat.stale_multiplier = *v,
                ConfigChange::DefaultTimeoutS(v) => applied.command.default_timeout_s = *v,
                ConfigChange::HealthSampleIntervalS(v) => applied.health.sample_interval_s = *v,
                ConfigChange::MaxRssBytes(v) => applied.health.max_rss_bytes = *v,
                ConfigChange::HotReloadDebounceMs(v) => applied.hot_reload.debounce_ms = *v,
                ConfigChange::RestartRequired { key } => {
                    self.restart_required
                        .lock()
                        .expect("hot reload poisoned")
                        .insert(key.clone());
                }
            }
        }
        *self.config.write().expect("config poisoned") = applied;
        *self.last_config_reload.lock().expect("hot reload poisoned") =
            Some(Utc::now().to_rfc3339());

        let descriptions: Vec<String> = changes.iter().map(|change| change.to_string()).collect();
        if descriptions.is_empty() {
            info!(event = "config_reloaded", changes = 0);
        } else {
            info!(event = "config_reloaded", changes = ?descriptions);
        }
        Ok(descriptions)
    }

    pub fn status(&self) -> Value {
        let restart_required: Vec<String> = self
            .restart_required
            .lock()
            .expect("hot reload poisoned")
            .iter()
            .cloned()
            .collect();
        let modules: Vec<&'static str> = self.catalog.iter().map(|set| set.module).collect();
        json!({
            "config_path": self.config_path.as_ref().map(|p| p.display().to_string()),
            "modules": modules,
            "handlers": self.registry.names(),
            "last_module_reload": *self.last_module_reload.lock().expect("hot reload poisoned"),
            "last_config_reload": *self.last_config_reload.lock().expect("hot reload poisoned"),
            "restart_required": restart_required,
        })
    }

    pub fn reload_all(&self) -> Result<Value, String> {
        let modules = self.reload_modules(None)?;
        let config_changes = match self.config_path {
            Some(_) => self.reload_config()?,
            None => Vec::new(),
        };
        Ok(json!({"modules": modules, "config_changes": config_changes}))
    }
}

/// Watches the config file and reloads it after a debounce window, so
/// editor write-and-rename sequences collapse into one reload.
pub async fn watch(manager: Arc<HotReloadManager>, config: Arc<RwLock<Config>>) {
    let Some(path) = manager.config_path.clone() else {
        return;
    };
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
    let watched_name = path.file_name().map(|name| name.to_os_string());
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let relevant = event.paths.iter().any(|p| {
                p.file_name().map(|name| Some(name.to_os_string()) == watched_name)
                    .unwrap_or(false)
            });
            if relevant {
                let _ = event_tx.send(());
            }
        }
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(event = "config_watch_failed", error = %err);
            return;
        }
    };
    let watch_root: &Path = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    if let Err(err) = watcher.watch(watch_root, RecursiveMode::NonRecursive) {
        warn!(event = "config_watch_failed", error = %err, path = %watch_root.display());
        return;
    }
    info!(event = "config_watch_started", path = %path.display());

    let mut pending = false;
    loop {
        let debounce = {
            let config = config.read().expect("config poisoned");
            Duration::from_millis(config.hot_reload.debounce_ms.max(10))
        };
        tokio::select! {
            changed = event_rx.recv() => {
                if changed.is_none() {
                    break;
                }
                pending = true;
            }
            _ = tokio::time::sleep(debounce), if pending => {
                pending = false;
                match manager.reload_config() {
                    Ok(changes) => {
                        info!(event = "config_watch_reload", changes = changes.len());
                    }
                    Err(err) => {
                        warn!(event = "config_watch_reload_failed", error = %err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scf_core::handler::HandlerSpec;
    use serde_json::Value;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    static DEMO_BROKEN: AtomicBool = AtomicBool::new(false);
    static DEMO_VERSION_TWO: AtomicBool = AtomicBool::new(false);

    fn demo_set() -> HandlerSet {
        fn build() -> Result<Vec<HandlerSpec>, String> {
            if DEMO_BROKEN.load(Ordering::SeqCst) {
                return Err("syntax error".to_string());
            }
            let marker = if DEMO_VERSION_TWO.load(Ordering::SeqCst) {
                "v2"
            } else {
                "v1"
            };
            Ok(vec![HandlerSpec::blocking("hello", move |_| {
                Ok(Value::String(marker.to_string()))
            })])
        }
        HandlerSet {
            module: "demo",
            build,
        }
    }

    fn invoke(registry: &HandlerRegistry, name: &str) -> Value {
        let handler = registry.lookup(name).expect("handler");
        match &handler.invoke {
            scf_core::handler::HandlerFn::Blocking(run) => run.as_ref()(scf_core::handler::HandlerCall {
                params: Value::Null,
                cancelled: scf_core::CancelFlag::new(),
            })
            .expect("invoke"),
            _ => panic!("expected blocking"),
        }
    }

    fn manager_with_config(contents: &str) -> (HotReloadManager, tempfile::NamedTempFile, Arc<RwLock<Config>>) {
        let mut file = tempfile::NamedTempFile::new().expect("temp config");
        write!(file, "{contents}").expect("write config");
        let registry = Arc::new(HandlerRegistry::new());
        let config = Arc::new(RwLock::new(Config::default()));
        let manager = HotReloadManager::new(
            Some(file.path().to_path_buf()),
            vec![demo_set()],
            registry,
            config.clone(),
        );
        (manager, file, config)
    }

    #[test]
    fn module_reload_swaps_handler_version() {
        DEMO_BROKEN.store(false, Ordering::SeqCst);
        DEMO_VERSION_TWO.store(false, Ordering::SeqCst);
        let registry = Arc::new(HandlerRegistry::new());
        let config = Arc::new(RwLock::new(Config::default()));
        let manager =
            HotReloadManager::new(None, vec![demo_set()], registry.clone(), config);

        manager.reload_modules(None).expect("initial load");
        assert_eq!(invoke(&registry, "hello"), Value::String("v1".to_string()));
        let names_before = registry.names();

        DEMO_VERSION_TWO.store(true, Ordering::SeqCst);
        manager.reload_modules(Some("demo")).expect("reload");
        assert_eq!(invoke(&registry, "hello"), Value::String("v2".to_string()));
        assert_eq!(registry.names(), names_before);
    }

    #[test]
    fn failed_module_build_keeps_previous_handlers() {
        DEMO_BROKEN.store(false, Ordering::SeqCst);
        DEMO_VERSION_TWO.store(false, Ordering::SeqCst);
        let registry = Arc::new(HandlerRegistry::new());
        let config = Arc::new(RwLock::new(Config::default()));
        let manager =
            HotReloadManager::new(None, vec![demo_set()], registry.clone(), config);
        manager.reload_modules(None).expect("initial load");

        DEMO_BROKEN.store(true, Ordering::SeqCst);
        let err = manager.reload_modules(None).expect_err("build must fail");
        assert!(err.contains("demo"));
        assert_eq!(invoke(&registry, "hello"), Value::String("v1".to_string()));
        DEMO_BROKEN.store(false, Ordering::SeqCst);
    }

    #[test]
    fn unknown_module_target_is_an_error() {
        let registry = Arc::new(HandlerRegistry::new());
        let config = Arc::new(RwLock::new(Config::default()));
        let manager = HotReloadManager::new(None, vec![demo_set()], registry, config);
        assert!(manager.reload_modules(Some("ghost")).is_err());
    }

    #[test]
    fn config_reload_applies_live_safe_and_flags_the_rest() {
        let (manager, _file, config) = manager_with_config(
            "[heartbeat]\ninterval_s = 12\n\n[endpoint]\nhub_url = \"ws://moved:9998\"\n",
        );
        let changes = manager.reload_config().expect("reload");
        assert!(changes.iter().any(|c| c.contains("heartbeat.interval_s=12")));
        assert!(changes.iter().any(|c| c.contains("restart required")));

        let applied = config.read().expect("config");
        assert_eq!(applied.heartbeat.interval_s, 12);
        // Not live-safe: the running connection keeps its dial target.
        assert_eq!(applied.endpoint.hub_url, "ws://localhost:9998");

        let status = manager.status();
        assert_eq!(status["restart_required"][0], "endpoint.hub_url");
    }

    #[test]
    fn invalid_config_reload_keeps_previous_snapshot() {
        let (manager, _file, config) = manager_with_config("[heartbeat]\ninterval_s = 0\n");
        let err = manager.reload_config().expect_err("invalid config");
        assert!(err.contains("config reload failed"));
        assert_eq!(config.read().expect("config").heartbeat.interval_s, 30);
    }
}
