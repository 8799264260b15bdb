use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::config::MaestroConfig;
use crate::core::errors::Result;
use crate::core::memory::CacheManager;
use crate::process::ProcessOrchestrator;
use crate::scheduler::{HandlerRegistry, TaskScheduler};
use crate::storage::SledStore;
use crate::workflow::{WorkflowHistory, WorkflowManager};

/// The cache, scheduler, workflow manager and process orchestrator wired
/// together, with the scheduler loop and cache maintenance running
pub struct Maestro {
    config: MaestroConfig,
    cache: Arc<CacheManager>,
    scheduler: Arc<TaskScheduler>,
    workflows: Arc<WorkflowManager>,
    processes: Arc<ProcessOrchestrator>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_flag: AtomicBool,
}

impl Maestro {
    pub fn builder() -> MaestroBuilder {
        MaestroBuilder::new()
    }

    pub fn config(&self) -> &MaestroConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn workflows(&self) -> &Arc<WorkflowManager> {
        &self.workflows
    }

    pub fn processes(&self) -> &Arc<ProcessOrchestrator> {
        &self.processes
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Stops the scheduler loop and cache maintenance, then flushes the cache
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_flag.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!("Initiating shutdown");
        let handle = self.scheduler_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.cache.shutdown()?;
        info!("Shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for Maestro {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Maestro")
            .field("scheduler", &self.scheduler)
            .field("workflows", &self.workflows)
            .field("processes", &self.processes)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Builder for [`Maestro`]
#[derive(Default)]
pub struct MaestroBuilder {
    config: Option<MaestroConfig>,
    handlers: Option<HandlerRegistry>,
    cache_store: Option<SledStore>,
    history_store: Option<SledStore>,
}

impl MaestroBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: MaestroConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.config = Some(MaestroConfig::load(path)?);
        Ok(self)
    }

    /// Handler table to use instead of the `#[task_handler]` registrations
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Store for a persistent cache, in place of `cache.storage_path`
    pub fn with_cache_store(mut self, store: SledStore) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Store for workflow history, in place of `workflow.history_path`
    pub fn with_history_store(mut self, store: SledStore) -> Self {
        self.history_store = Some(store);
        self
    }

    /// Wires every component and spawns the background loops; must run
    /// inside a tokio runtime
    pub fn build(self) -> Result<Arc<Maestro>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let cache = match self.cache_store {
            Some(store) => CacheManager::with_store(config.cache.clone(), store)?,
            None => CacheManager::new(config.cache.clone())?,
        };
        let cache = Arc::new(cache.with_maintenance());

        let handlers = self.handlers.unwrap_or_else(HandlerRegistry::with_registered);
        let scheduler = Arc::new(
            TaskScheduler::new(config.scheduler.clone(), handlers)?.with_cache(Arc::clone(&cache)),
        );

        let history = match (self.history_store, &config.workflow.history_path) {
            (Some(store), _) => Some(WorkflowHistory::new(store)),
            (None, Some(path)) => Some(WorkflowHistory::open(path)?),
            (None, None) => None,
        };
        let mut workflows = WorkflowManager::new(Arc::clone(&scheduler));
        if let Some(history) = history {
            workflows = workflows.with_history(history);
        }
        let workflows = Arc::new(workflows);

        let processes = Arc::new(ProcessOrchestrator::new(
            Arc::clone(&workflows),
            config.orchestrator.clone(),
        ));

        let scheduler_handle = scheduler.spawn();
        info!(
            handlers = ?scheduler.handlers().names(),
            persistent_cache = config.cache.persistent,
            "Orchestrator ready"
        );
        Ok(Arc::new(Maestro {
            config,
            cache,
            scheduler,
            workflows,
            processes,
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            shutdown_flag: AtomicBool::new(false),
        }))
    }
}
