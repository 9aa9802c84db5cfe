use crate::response::ErrorInfo;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Runs on the scheduler loop; must observe cancellation at each
    /// suspension point.
    Cooperative,
    /// Calls native APIs or blocks on I/O; offloaded to the bounded
    /// worker pool.
    Blocking,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Cooperative => "cooperative",
            HandlerKind::Blocking => "blocking",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct HandlerCall {
    pub params: Value,
    pub cancelled: CancelFlag,
}

pub type CooperativeFn =
    Arc<dyn Fn(HandlerCall) -> BoxFuture<'static, Result<Value, ErrorInfo>> + Send + Sync>;
pub type BlockingFn = Arc<dyn Fn(HandlerCall) -> Result<Value, ErrorInfo> + Send + Sync>;

#[derive(Clone)]
pub enum HandlerFn {
    Cooperative(CooperativeFn),
    Blocking(BlockingFn),
}

#[derive(Clone)]
pub struct HandlerSpec {
    pub name: String,
    pub kind: HandlerKind,
    pub default_timeout: Option<Duration>,
    pub invoke: HandlerFn,
}

impl HandlerSpec {
    pub fn cooperative<F>(name: &str, invoke: F) -> Self
    where
        F: Fn(HandlerCall) -> BoxFuture<'static, Result<Value, ErrorInfo>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            kind: HandlerKind::Cooperative,
            default_timeout: None,
            invoke: HandlerFn::Cooperative(Arc::new(invoke)),
        }
    }

    pub fn blocking<F>(name: &str, invoke: F) -> Self
    where
        F: Fn(HandlerCall) -> Result<Value, ErrorInfo> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            kind: HandlerKind::Blocking,
            default_timeout: None,
            invoke: HandlerFn::Blocking(Arc::new(invoke)),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

/// A reloadable unit of handlers. `build` runs on every (re)load; a
/// failing build leaves the previously registered handlers in place.
#[derive(Clone)]
pub struct HandlerSet {
    pub module: &'static str,
    pub build: fn() -> Result<Vec<HandlerSpec>, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_across_clones() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn constructors_set_kind() {
        let coop = HandlerSpec::cooperative("echo", |call| {
            Box::pin(async move { Ok(call.params) })
        });
        assert_eq!(coop.kind, HandlerKind::Cooperative);
        assert!(coop.default_timeout.is_none());

        let blocking = HandlerSpec::blocking("system_info", |_| Ok(Value::Null))
            .with_default_timeout(Duration::from_secs(5));
        assert_eq!(blocking.kind, HandlerKind::Blocking);
        assert_eq!(blocking.default_timeout, Some(Duration::from_secs(5)));
    }
}
