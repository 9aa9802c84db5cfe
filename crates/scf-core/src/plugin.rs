use crate::response::ErrorInfo;
use serde_json::Value;

/// A hub-side admin command contributed by a plugin set. The hub hands
/// the command a JSON snapshot of its registry and counters; plugins
/// never touch hub internals directly.
#[derive(Clone)]
pub struct HubCommand {
    pub name: &'static str,
    pub run: fn(snapshot: &Value, params: Value) -> Result<Value, ErrorInfo>,
}

/// A reloadable unit of hub commands. A failing build is logged and the
/// set is skipped; the remaining sets still load.
#[derive(Clone)]
pub struct HubCommandSet {
    pub module: &'static str,
    pub build: fn() -> Result<Vec<HubCommand>, String>,
}
