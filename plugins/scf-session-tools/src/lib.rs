use scf_core::handler::{HandlerSet, HandlerSpec};
use scf_core::response::ErrorInfo;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

pub const MODULE: &str = "session_tools";

const SLEEP_SLICE_MS: u64 = 50;

pub fn handler_set() -> HandlerSet {
    HandlerSet {
        module: MODULE,
        build: build_handlers,
    }
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    duration_ms: u64,
}

fn build_handlers() -> Result<Vec<HandlerSpec>, String> {
    let echo = HandlerSpec::cooperative("echo", |call| {
        Box::pin(async move { Ok(json!({"received": call.params})) })
    });

    // Cancellation-observant cooperative sleep: checks the flag at every
    // suspension point instead of sleeping through the deadline.
    let sleep_ms = HandlerSpec::cooperative("sleep_ms", |call| {
        Box::pin(async move {
            let params: SleepParams = serde_json::from_value(call.params)
                .map_err(|err| ErrorInfo::invalid_params(err.to_string()))?;
            let mut slept_ms = 0;
            while slept_ms < params.duration_ms {
                if call.cancelled.is_cancelled() {
                    return Ok(json!({"slept_ms": slept_ms, "cancelled": true}));
                }
                let slice = SLEEP_SLICE_MS.min(params.duration_ms - slept_ms);
                tokio::time::sleep(Duration::from_millis(slice)).await;
                slept_ms += slice;
            }
            Ok(json!({"slept_ms": slept_ms, "cancelled": false}))
        })
    });

    let system_info = HandlerSpec::blocking("system_info", |_call| Ok(collect_system_info()))
        .with_default_timeout(Duration::from_secs(10));

    Ok(vec![echo, sleep_ms, system_info])
}

fn collect_system_info() -> Value {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    json!({
        "hostname": sysinfo::System::host_name(),
        "platform": sysinfo::System::name(),
        "os_version": sysinfo::System::os_version(),
        "pid": std::process::id(),
        "cpu_count": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        "total_memory_bytes": sys.total_memory(),
        "used_memory_bytes": sys.used_memory(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scf_core::handler::{HandlerCall, HandlerFn, HandlerKind};
    use scf_core::CancelFlag;

    fn call(params: Value) -> HandlerCall {
        HandlerCall {
            params,
            cancelled: CancelFlag::new(),
        }
    }

    #[test]
    fn set_builds_expected_handlers() {
        let specs = build_handlers().expect("build");
        let mut names: Vec<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["echo", "sleep_ms", "system_info"]);
    }

    #[tokio::test]
    async fn echo_returns_params_under_received() {
        let specs = build_handlers().expect("build");
        let echo = specs.iter().find(|spec| spec.name == "echo").expect("echo");
        let HandlerFn::Cooperative(run) = &echo.invoke else {
            panic!("echo must be cooperative");
        };
        let out = run.as_ref()(call(json!({"x": 42}))).await.expect("echo ok");
        assert_eq!(out["received"]["x"], 42);
    }

    #[tokio::test]
    async fn sleep_ms_observes_cancellation() {
        let specs = build_handlers().expect("build");
        let sleep = specs
            .iter()
            .find(|spec| spec.name == "sleep_ms")
            .expect("sleep_ms");
        let HandlerFn::Cooperative(run) = &sleep.invoke else {
            panic!("sleep_ms must be cooperative");
        };
        let cancelled = CancelFlag::new();
        cancelled.cancel();
        let out = run.as_ref()(HandlerCall {
            params: json!({"duration_ms": 10_000}),
            cancelled,
        })
        .await
        .expect("sleep ok");
        assert_eq!(out["cancelled"], true);
        assert_eq!(out["slept_ms"], 0);
    }

    #[test]
    fn system_info_is_blocking_and_reports_pid() {
        let specs = build_handlers().expect("build");
        let info = specs
            .iter()
            .find(|spec| spec.name == "system_info")
            .expect("system_info");
        assert_eq!(info.kind, HandlerKind::Blocking);
        let HandlerFn::Blocking(run) = &info.invoke else {
            panic!("system_info must be blocking");
        };
        let out = run.as_ref()(call(Value::Null)).expect("info ok");
        assert_eq!(out["pid"], std::process::id());
        assert!(out["cpu_count"].as_u64().unwrap_or(0) >= 1);
    }
}
