use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::errors::{MaestroError, Result};
use crate::core::memory::CacheManager;

/// Constructors collected from every `#[task_handler]` in the binary
#[linkme::distributed_slice]
pub static TASK_HANDLERS: [fn() -> Arc<dyn TaskHandler>] = [..];

/// What a handler gets to see besides its input
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub task_id: String,
    pub scheduled_time: DateTime<Utc>,
    /// Shared memoization store, when the scheduler was given one
    pub cache: Option<Arc<CacheManager>>,
}

/// Executes one kind of task, selected by the `type` tag of its payload
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// The `type` tag this handler serves
    fn name(&self) -> String;

    fn description(&self) -> String {
        "No description provided".to_string()
    }

    /// JSON schema the input must satisfy, `None` accepts anything
    fn input_schema(&self) -> Option<Value> {
        None
    }

    fn validate_input(&self, input: &Value) -> anyhow::Result<()> {
        let Some(schema) = self.input_schema() else {
            return Ok(());
        };
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| anyhow::anyhow!("Failed to compile input schema: {}", e))?;
        if let Err(errors) = validator.validate(input) {
            warn!("Input validation failed for handler {}: {}", self.name(), errors);
            return Err(anyhow::anyhow!("Invalid input: {}", errors));
        }
        Ok(())
    }

    async fn execute(&self, input: Value, ctx: &HandlerContext) -> anyhow::Result<Value>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// Adapts a closure into a [`TaskHandler`]
struct FnHandler {
    name: String,
    func: Box<dyn Fn(Value, HandlerContext) -> BoxedHandlerFuture + Send + Sync>,
}

#[async_trait]
impl TaskHandler for FnHandler {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn execute(&self, input: Value, ctx: &HandlerContext) -> anyhow::Result<Value> {
        (self.func)(input, ctx.clone()).await
    }
}

/// `type` tag -> handler table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with every handler declared via `#[task_handler]`
    pub fn with_registered() -> Self {
        let registry = Self::new();
        for constructor in TASK_HANDLERS.iter() {
            let handler = constructor();
            let name = handler.name();
            if let Err(e) = registry.register(handler) {
                warn!("Skipping handler {}: {}", name, e);
            }
        }
        registry
    }

    pub fn register(&self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let name = handler.name();
        if self.handlers.contains_key(&name) {
            return Err(MaestroError::validation_field(
                format!("Handler '{}' already registered", name),
                "type",
            ));
        }
        debug!("Registered task handler {}", name);
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Registers a closure as the handler for `name`
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, func: F) -> Result<()>
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(Arc::new(FnHandler {
            name: name.into(),
            func: Box::new(move |input, ctx| Box::pin(func(input, ctx))),
        }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered tags, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
