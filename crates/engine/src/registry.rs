//! The action registry: how workers resolve an action name to code.
//!
//! Handlers take an [`ActionContext`] plus the job's positional and keyword
//! arguments, so there is no magic injected kwarg; `ctx.jobid` is always
//! populated. Each worker opens its own registry through a
//! [`RegistryFactory`], which is where heavy application handles (database
//! connections, model weights) belong.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

/// Per-invocation context handed to every handler.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Id of the job this invocation belongs to.
    pub jobid: String,
}

/// Future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// An action implementation.
pub type Handler =
    Arc<dyn Fn(ActionContext, Vec<Value>, Map<String, Value>) -> HandlerFuture + Send + Sync>;

/// An action name that does not resolve against the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("action {0:?} is not registered")]
pub struct ActionNotFound(pub String);

/// Mapping from action name to handler, loaded once per worker.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Handler>,
}

impl ActionRegistry {
    /// An empty registry.
    pub fn new() -> ActionRegistry {
        ActionRegistry {
            handlers: HashMap::new(),
        }
    }

    /// A registry holding only the built-in actions.
    pub fn with_builtins() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register("helloworld", |_ctx, mut args, mut kwargs| {
            Box::pin(async move {
                let time_ = if args.is_empty() {
                    kwargs.remove("time_").unwrap_or_else(|| json!(0))
                } else {
                    args.remove(0)
                };
                let secs = time_.as_f64().unwrap_or(0.0).max(0.0);
                if secs > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                }
                let banner = format!(
                    "HELLO time_={time_} ({}, {})",
                    Value::Array(args),
                    Value::Object(kwargs)
                );
                Ok(Value::String(banner))
            })
        });
        registry
    }

    /// Register (or replace) a handler under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(ActionContext, Vec<Value>, Map<String, Value>) -> HandlerFuture
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Look up the handler for an action name.
    pub fn resolve(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }
}

/// Opens a fresh [`ActionRegistry`] for one worker.
///
/// Called once at worker startup; implementations may be arbitrarily heavy.
pub trait RegistryFactory: Send + Sync {
    /// Build the registry this worker will serve from.
    fn open(&self) -> anyhow::Result<ActionRegistry>;
}

/// Factory yielding a registry with only the built-in actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinRegistry;

impl RegistryFactory for BuiltinRegistry {
    fn open(&self) -> anyhow::Result<ActionRegistry> {
        Ok(ActionRegistry::with_builtins())
    }
}
