use scf_core::plugin::{HubCommand, HubCommandSet};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

/// Built-in admin commands that plugin sets may not shadow.
const RESERVED: &[&str] = &[
    "forward_command",
    "broadcast_command",
    "list_clients",
    "get_stats",
    "disconnect_client",
    "reload_plugins",
];

pub fn catalog() -> Vec<HubCommandSet> {
    vec![scf_hub_report::command_set()]
}

pub type CommandFn = fn(&Value, Value) -> Result<Value, scf_core::ErrorInfo>;

pub struct CommandTable {
    commands: RwLock<HashMap<&'static str, CommandFn>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<CommandFn> {
        self.commands.read().expect("command table poisoned").get(name).copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .commands
            .read()
            .expect("command table poisoned")
            .keys()
            .copied()
            .collect();
        names.sort_unstable();
        names
    }

    /// Rebuilds the whole table from the catalog and swaps it in. A set
    /// whose build fails is skipped; the rest still load.
    pub fn reload(&self, catalog: &[HubCommandSet]) -> Value {
        let mut next: HashMap<&'static str, CommandFn> = HashMap::new();
        let mut loaded = Vec::new();
        let mut failed = Vec::new();
        for set in catalog {
            match (set.build)() {
                Ok(commands) => {
                    for HubCommand { name, run } in commands {
                        if RESERVED.contains(&name) {
                            warn!(event = "plugin_shadows_builtin", module = set.module, command = name);
                            continue;
                        }
                        next.insert(name, run);
                    }
                    loaded.push(set.module);
                }
                Err(err) => {
                    warn!(event = "plugin_load_failed", module = set.module, error = %err);
                    failed.push(json!({"module": set.module, "error": err}));
                }
            }
        }
        let count = next.len();
        *self.commands.write().expect("command table poisoned") = next;
        info!(event = "plugins_loaded", commands = count, sets = loaded.len());
        json!({"commands": count, "loaded": loaded, "failed": failed})
    }
}
