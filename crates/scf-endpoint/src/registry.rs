use scf_core::handler::{HandlerKind, HandlerSpec};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HandlerInfo {
    pub name: String,
    pub kind: &'static str,
    pub module: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timeout_s: Option<f64>,
}

struct Inner {
    handlers: HashMap<String, Arc<HandlerSpec>>,
    owners: HashMap<String, String>,
}

/// Name-keyed handler table. Registration replaces atomically; readers
/// observe either the old or the new handler, never a partial state.
pub struct HandlerRegistry {
    inner: RwLock<Inner>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                handlers: HashMap::new(),
                owners: HashMap::new(),
            }),
        }
    }

    pub fn register(&self, module: &str, spec: HandlerSpec) {
        let mut inner = self.inner.write().expect("registry poisoned");
        let name = spec.name.clone();
        inner.handlers.insert(name.clone(), Arc::new(spec));
        inner.owners.insert(name, module.to_string());
    }

    /// Replaces every handler owned by `module` with the new set in one
    /// write-lock section; names the module no longer exports are
    /// de-registered.
    pub fn register_set(&self, module: &str, specs: Vec<HandlerSpec>) {
        let mut inner = self.inner.write().expect("registry poisoned");
        let kept: Vec<String> = specs.iter().map(|spec| spec.name.clone()).collect();
        let orphaned: Vec<String> = inner
            .owners
            .iter()
            .filter(|(name, owner)| owner.as_str() == module && !kept.contains(name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &orphaned {
            inner.handlers.remove(name);
            inner.owners.remove(name);
        }
        for spec in specs {
            let name = spec.name.clone();
            inner.handlers.insert(name.clone(), Arc::new(spec));
            inner.owners.insert(name, module.to_string());
        }
        info!(
            event = "handlers_registered",
            module = module,
            registered = kept.len(),
            removed = orphaned.len()
        );
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<HandlerSpec>> {
        self.inner
            .read()
            .expect("registry poisoned")
            .handlers
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().expect("registry poisoned");
        let mut names: Vec<String> = inner.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn detailed(&self) -> Vec<HandlerInfo> {
        let inner = self.inner.read().expect("registry poisoned");
        let mut infos: Vec<HandlerInfo> = inner
            .handlers
            .iter()
            .map(|(name, spec)| HandlerInfo {
                name: name.clone(),
                kind: spec.kind.as_str(),
                module: inner.owners.get(name).cloned().unwrap_or_default(),
                default_timeout_s: spec.default_timeout.map(|d| d.as_secs_f64()),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn kind_of(&self, name: &str) -> Option<HandlerKind> {
        self.lookup(name).map(|spec| spec.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn spec(name: &str, marker: &'static str) -> HandlerSpec {
        HandlerSpec::blocking(name, move |_| Ok(Value::String(marker.to_string())))
    }

    fn invoke(registry: &HandlerRegistry, name: &str) -> Value {
        let handler = registry.lookup(name).expect("handler present");
        match &handler.invoke {
            scf_core::handler::HandlerFn::Blocking(run) => run.as_ref()(scf_core::handler::HandlerCall {
                params: json!({}),
                cancelled: scf_core::CancelFlag::new(),
            })
            .expect("invoke"),
            _ => panic!("expected blocking handler"),
        }
    }

    #[test]
    fn re_registering_replaces_the_handler() {
        let registry = HandlerRegistry::new();
        registry.register("demo", spec("hello", "v1"));
        assert_eq!(invoke(&registry, "hello"), json!("v1"));
        registry.register("demo", spec("hello", "v2"));
        assert_eq!(invoke(&registry, "hello"), json!("v2"));
        assert_eq!(registry.names(), vec!["hello"]);
    }

    #[test]
    fn register_set_removes_orphaned_names() {
        let registry = HandlerRegistry::new();
        registry.register_set("demo", vec![spec("one", "a"), spec("two", "b")]);
        assert_eq!(registry.names(), vec!["one", "two"]);

        registry.register_set("demo", vec![spec("two", "b2"), spec("three", "c")]);
        assert_eq!(registry.names(), vec!["three", "two"]);
        assert!(registry.lookup("one").is_none());
        assert_eq!(invoke(&registry, "two"), json!("b2"));
    }

    #[test]
    fn register_set_does_not_touch_other_modules() {
        let registry = HandlerRegistry::new();
        registry.register_set("alpha", vec![spec("a_one", "x")]);
        registry.register_set("beta", vec![spec("b_one", "y")]);
        registry.register_set("alpha", vec![]);
        assert_eq!(registry.names(), vec!["b_one"]);
    }

    #[test]
    fn detailed_reports_kind_and_module() {
        let registry = HandlerRegistry::new();
        registry.register("demo", spec("work", "v"));
        let infos = registry.detailed();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "work");
        assert_eq!(infos[0].kind, "blocking");
        assert_eq!(infos[0].module, "demo");
    }

    #[test]
    fn lookup_miss_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.lookup("missing").is_none());
        assert!(registry.kind_of("missing").is_none());
    }
}
