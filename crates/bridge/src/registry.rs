//! Registry mapping operation names to their handlers.
//!
//! Built once at startup and treated as read-only afterwards. Lookup is
//! exact and case-sensitive; an unknown name is a normal error path that the
//! executor turns into an error response, never a fault.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use tabrelay_core::Result;

/// One registered operation. Handlers are opaque capabilities to this layer:
/// they get the call's arguments and either produce a result value or fail
/// with a domain error. Argument shape validation is the handler's job.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, arguments: Value) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, arguments: Value) -> Result<Value> {
        (self.0)(arguments).await
    }
}

#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let name = name.into();
        debug!(operation = %name, "Registering operation handler");
        self.handlers.insert(name, handler);
    }

    /// Register a plain async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(name)
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Resolve and invoke a handler. The error string is what travels back
    /// in the response frame: either the unknown-operation message or the
    /// handler's own failure text.
    pub async fn dispatch(
        &self,
        operation: &str,
        arguments: Value,
    ) -> std::result::Result<Value, String> {
        match self.get(operation) {
            None => Err(format!("operation not found: {}", operation)),
            Some(handler) => handler.handle(arguments).await.map_err(|e| e.to_string()),
        }
    }
}
