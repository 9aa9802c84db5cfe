use scf_core::plugin::{HubCommand, HubCommandSet};
use scf_core::response::ErrorInfo;
use serde_json::{json, Value};

pub const MODULE: &str = "hub_report";

pub fn command_set() -> HubCommandSet {
    HubCommandSet {
        module: MODULE,
        build: build_commands,
    }
}

fn build_commands() -> Result<Vec<HubCommand>, String> {
    Ok(vec![
        HubCommand {
            name: "server_report",
            run: server_report,
        },
        HubCommand {
            name: "find_capability",
            run: find_capability,
        },
    ])
}

/// One-shot operational summary assembled from the hub snapshot.
fn server_report(snapshot: &Value, _params: Value) -> Result<Value, ErrorInfo> {
    let clients = snapshot["clients"].as_array().cloned().unwrap_or_default();
    let identities: Vec<&str> = clients
        .iter()
        .filter_map(|client| client["identity"].as_str())
        .collect();
    let stale: Vec<&str> = clients
        .iter()
        .filter(|client| client["status"] == "stale")
        .filter_map(|client| client["identity"].as_str())
        .collect();
    Ok(json!({
        "uptime_s": snapshot["uptime_s"],
        "peers": snapshot["peers"],
        "pending_commands": snapshot["pending_commands"],
        "forwarded_total": snapshot["forwarded_total"],
        "endpoints": identities,
        "stale_endpoints": stale,
    }))
}

/// Lists endpoint identities advertising the requested capability.
fn find_capability(snapshot: &Value, params: Value) -> Result<Value, ErrorInfo> {
    let capability = params["capability"]
        .as_str()
        .ok_or_else(|| ErrorInfo::invalid_params("capability (string) is required"))?;
    let clients = snapshot["clients"].as_array().cloned().unwrap_or_default();
    let matching: Vec<&str> = clients
        .iter()
        .filter(|client| {
            client["capabilities"]
                .as_array()
                .map(|caps| caps.iter().any(|cap| cap == capability))
                .unwrap_or(false)
        })
        .filter_map(|client| client["identity"].as_str())
        .collect();
    Ok(json!({"capability": capability, "endpoints": matching}))
}
