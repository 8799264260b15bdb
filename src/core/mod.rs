// Infrastructure shared by the scheduler, workflows and processes

pub mod config;
pub mod errors;
pub mod logging;
pub mod memory;

pub use config::{
    CacheConfig, EvictionPolicy, FailurePolicy, MaestroConfig, OrchestratorConfig, SchedulerConfig,
    WorkflowConfig,
};
pub use errors::{MaestroError, Result};
pub use memory::{CacheCounters, CacheEntryMeta, CacheManager, CacheStats};
