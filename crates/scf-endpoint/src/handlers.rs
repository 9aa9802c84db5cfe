use crate::health::HealthMonitor;
use crate::hotreload::HotReloadManager;
use crate::logging::{LogManager, LogQuery};
use crate::registry::HandlerRegistry;
use crate::restart::RestartCoordinator;
use scf_core::handler::HandlerSpec;
use scf_core::response::{codes, ErrorInfo};
use scf_core::Config;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};

pub const BUILTIN_MODULE: &str = "core";

#[derive(Clone)]
pub struct CoreServices {
    pub config: Arc<RwLock<Config>>,
    pub registry: Arc<HandlerRegistry>,
    pub health: Arc<HealthMonitor>,
    pub logs: Arc<LogManager>,
    pub hotreload: Arc<HotReloadManager>,
    pub restart: Arc<RestartCoordinator>,
}

#[derive(Debug, Deserialize)]
struct SetLogLevelParams {
    level: String,
    #[serde(default)]
    logger: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HotReloadParams {
    action: String,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestartParams {
    #[serde(default = "default_restart_delay")]
    delay_s: f64,
    #[serde(default)]
    use_watchdog: bool,
    #[serde(default)]
    reason: Option<String>,
}

fn default_restart_delay() -> f64 {
    1.0
}

// Null params behave like an empty object so optional fields fall back
// to their defaults.
fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ErrorInfo> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|err| ErrorInfo::invalid_params(err.to_string()))
}

pub fn register_builtins(services: &CoreServices) {
    let specs = builtin_specs(services);
    services.registry.register_set(BUILTIN_MODULE, specs);
}

fn builtin_specs(services: &CoreServices) -> Vec<HandlerSpec> {
    let mut specs = Vec::new();

    let health = services.health.clone();
    let config = services.config.clone();
    specs.push(HandlerSpec::cooperative("health_status", move |_call| {
        let health = health.clone();
        let config = config.clone();
        Box::pin(async move {
            let max_rss = config.read().expect("config poisoned").health.max_rss_bytes;
            let (sample, status) = match health.latest() {
                Some(latest) => latest,
                None => health.sample(max_rss),
            };
            Ok(json!({
                "status": status.as_str(),
                "sample": sample,
                "samples_retained": health.sample_count(),
            }))
        })
    }));

    let logs = services.logs.clone();
    specs.push(HandlerSpec::cooperative("get_logs", move |call| {
        let logs = logs.clone();
        Box::pin(async move {
            let query: LogQuery = parse_params(call.params)?;
            let records = logs.ring.query(&query);
            Ok(json!({"count": records.len(), "records": records}))
        })
    }));

    let logs = services.logs.clone();
    specs.push(HandlerSpec::cooperative("set_log_level", move |call| {
        let logs = logs.clone();
        Box::pin(async move {
            let params: SetLogLevelParams = parse_params(call.params)?;
            let directives = logs
                .set_level(&params.level, params.logger.as_deref())
                .map_err(ErrorInfo::invalid_params)?;
            Ok(json!({"level": params.level, "logger": params.logger, "directives": directives}))
        })
    }));

    let logs = services.logs.clone();
    specs.push(HandlerSpec::cooperative("get_log_stats", move |_call| {
        let logs = logs.clone();
        Box::pin(async move { Ok(logs.ring.stats()) })
    }));

    let registry = services.registry.clone();
    specs.push(HandlerSpec::cooperative("list_handlers", move |_call| {
        let registry = registry.clone();
        Box::pin(async move { Ok(json!({"handlers": registry.detailed()})) })
    }));

    let hotreload = services.hotreload.clone();
    specs.push(HandlerSpec::cooperative("hot_reload", move |call| {
        let hotreload = hotreload.clone();
        Box::pin(async move {
            let params: HotReloadParams = parse_params(call.params)?;
            match params.action.as_str() {
                "status" => Ok(hotreload.status()),
                "reload_module" => hotreload
                    .reload_modules(params.target.as_deref())
                    .map(|modules| json!({"reloaded": modules}))
                    .map_err(ErrorInfo::reload_failed),
                "reload_config" => hotreload
                    .reload_config()
                    .map(|changes| json!({"changes": changes}))
                    .map_err(ErrorInfo::reload_failed),
                "reload_all" => hotreload.reload_all().map_err(ErrorInfo::reload_failed),
                other => Err(ErrorInfo::invalid_params(format!(
                    "unknown hot_reload action '{other}'"
                ))),
            }
        })
    }));

    let restart = services.restart.clone();
    specs.push(HandlerSpec::cooperative("restart_client", move |call| {
        let restart = restart.clone();
        Box::pin(async move {
            let params: RestartParams = parse_params(call.params)?;
            let reason = params
                .reason
                .unwrap_or_else(|| "admin request".to_string());
            let scheduled = restart
                .schedule(params.delay_s, params.use_watchdog, reason)
                .map_err(|err| ErrorInfo::new(codes::RESTARTING, "LifecycleError", err))?;
            Ok(json!({"scheduled": scheduled}))
        })
    }));

    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::scheduler::CommandStats;
    use scf_core::handler::{HandlerCall, HandlerFn};
    use scf_core::CancelFlag;

    struct Fixture {
        services: CoreServices,
        _filter_layer: tracing_subscriber::reload::Layer<
            tracing_subscriber::EnvFilter,
            tracing_subscriber::Registry,
        >,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(RwLock::new(Config::default()));
        let registry = Arc::new(HandlerRegistry::new());
        let health = Arc::new(HealthMonitor::new(Arc::new(CommandStats::new())));
        let (logs, layer) = logging::detached_for_tests(64);
        let hotreload = Arc::new(HotReloadManager::new(
            None,
            Vec::new(),
            registry.clone(),
            config.clone(),
        ));
        let (outbound, _rx) = tokio::sync::mpsc::channel(8);
        let restart = Arc::new(RestartCoordinator::new(outbound));
        let services = CoreServices {
            config,
            registry,
            health,
            logs,
            hotreload,
            restart,
        };
        register_builtins(&services);
        Fixture {
            services,
            _filter_layer: layer,
        }
    }

    async fn invoke(services: &CoreServices, name: &str, params: Value) -> Result<Value, ErrorInfo> {
        let handler = services.registry.lookup(name).expect("builtin registered");
        let call = HandlerCall {
            params,
            cancelled: CancelFlag::new(),
        };
        match &handler.invoke {
            HandlerFn::Cooperative(run) => run.as_ref()(call).await,
            HandlerFn::Blocking(run) => run.as_ref()(call),
        }
    }

    #[tokio::test]
    async fn builtins_are_registered() {
        let fixture = fixture();
        let names = fixture.services.registry.names();
        for expected in [
            "get_log_stats",
            "get_logs",
            "health_status",
            "hot_reload",
            "list_handlers",
            "restart_client",
            "set_log_level",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn health_status_samples_on_demand() {
        let fixture = fixture();
        let data = invoke(&fixture.services, "health_status", Value::Null)
            .await
            .expect("health");
        assert!(["healthy", "degraded", "unhealthy"]
            .contains(&data["status"].as_str().expect("status")));
        assert!(data["sample"]["uptime_s"].is_u64());
    }

    #[tokio::test]
    async fn get_logs_honors_filters() {
        let fixture = fixture();
        fixture.services.logs.ring.push(crate::logging::LogRecord {
            level: "warn".to_string(),
            timestamp: "2026-07-30T10:00:00Z".to_string(),
            target: "scf_endpoint::scheduler".to_string(),
            message: "slow handler".to_string(),
        });
        let data = invoke(
            &fixture.services,
            "get_logs",
            json!({"level": "warn", "name": "scheduler"}),
        )
        .await
        .expect("logs");
        assert_eq!(data["count"], 1);
        assert_eq!(data["records"][0]["message"], "slow handler");
    }

    #[tokio::test]
    async fn set_log_level_is_idempotent() {
        let fixture = fixture();
        let first = invoke(&fixture.services, "set_log_level", json!({"level": "warn"}))
            .await
            .expect("set level");
        let second = invoke(&fixture.services, "set_log_level", json!({"level": "warn"}))
            .await
            .expect("set level twice");
        assert_eq!(first["directives"], second["directives"]);

        let err = invoke(&fixture.services, "set_log_level", json!({"level": "loud"}))
            .await
            .expect_err("bad level");
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn list_handlers_reports_builtins() {
        let fixture = fixture();
        let data = invoke(&fixture.services, "list_handlers", Value::Null)
            .await
            .expect("list");
        let handlers = data["handlers"].as_array().expect("handlers");
        assert!(handlers.iter().any(|h| h["name"] == "health_status"));
        assert!(handlers.iter().all(|h| h["module"] == BUILTIN_MODULE));
    }

    #[tokio::test]
    async fn hot_reload_status_and_bad_action() {
        let fixture = fixture();
        let status = invoke(&fixture.services, "hot_reload", json!({"action": "status"}))
            .await
            .expect("status");
        assert!(status["handlers"].as_array().is_some());

        let err = invoke(&fixture.services, "hot_reload", json!({"action": "explode"}))
            .await
            .expect_err("bad action");
        assert_eq!(err.code, codes::INVALID_PARAMS);

        let err = invoke(
            &fixture.services,
            "hot_reload",
            json!({"action": "reload_module", "target": "ghost"}),
        )
        .await
        .expect_err("unknown module");
        assert_eq!(err.code, codes::RELOAD_FAILED);
    }

    #[tokio::test]
    async fn restart_client_schedules_once() {
        let fixture = fixture();
        let data = invoke(
            &fixture.services,
            "restart_client",
            json!({"delay_s": 3600.0, "use_watchdog": true, "reason": "test"}),
        )
        .await
        .expect("schedule");
        assert_eq!(data["scheduled"]["use_watchdog"], true);
        assert_eq!(data["scheduled"]["reason"], "test");

        let err = invoke(&fixture.services, "restart_client", json!({"delay_s": 3600.0}))
            .await
            .expect_err("second schedule");
        assert_eq!(err.code, codes::RESTARTING);
    }
}
