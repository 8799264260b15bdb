//! # maestro: in-process orchestration
//!
//! Four cooperating pieces:
//!
//! - [`CacheManager`]: bounded, TTL-aware memoization store with LRU or
//!   largest-first eviction and optional sled persistence
//! - [`TaskScheduler`]: time-ordered queue of one-shot and recurring tasks,
//!   dispatched by `type` tag to registered [`TaskHandler`]s
//! - [`WorkflowManager`]: sequential, pausable workflows whose steps are
//!   tasks or nested workflows
//! - [`ProcessOrchestrator`]: dependency-ordered processes that start their
//!   dependents as they complete
//!
//! ```rust,no_run
//! use maestro::{HandlerRegistry, Maestro, ProcessConfig, Step, TaskData};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> maestro::Result<()> {
//!     let handlers = HandlerRegistry::new();
//!     handlers.register_fn("echo", |input, _ctx| async move { Ok(input) })?;
//!
//!     let system = Maestro::builder().with_handlers(handlers).build()?;
//!     let processes = system.processes();
//!     processes.create_process(ProcessConfig::new(
//!         "solution",
//!         vec![Step::task("scaffold", TaskData::new("echo", json!({"name": "crm"})))],
//!     ))?;
//!     processes.start_process("solution").await?;
//!
//!     system.shutdown().await
//! }
//! ```

// lets `::maestro::...` paths emitted by the proc macros resolve inside this crate too
extern crate self as maestro;

pub mod core;
pub mod process;
pub mod scheduler;
pub mod storage;
pub mod system;
pub mod workflow;

pub use crate::core::config::{
    CacheConfig, EvictionPolicy, FailurePolicy, MaestroConfig, OrchestratorConfig, SchedulerConfig,
    WorkflowConfig,
};
pub use crate::core::errors::{MaestroError, Result};
pub use crate::core::logging::init_tracing;
pub use crate::core::memory::{CacheManager, CacheStats};
pub use process::{Process, ProcessConfig, ProcessOrchestrator, ProcessStatus};
pub use scheduler::{
    HandlerContext, HandlerRegistry, ScheduledTask, ScheduledTaskInfo, TaskData, TaskHandler,
    TaskOutcome, TaskScheduler, TASK_HANDLERS,
};
pub use storage::SledStore;
pub use system::{Maestro, MaestroBuilder};
pub use workflow::{
    Step, StepError, Workflow, WorkflowHistory, WorkflowManager, WorkflowOptions, WorkflowStatus,
};

pub use maestro_macros::task_handler;

// used by code generated with #[task_handler]
#[doc(hidden)]
pub use anyhow;
#[doc(hidden)]
pub use async_trait;
#[doc(hidden)]
pub use linkme;
#[doc(hidden)]
pub use serde_json;
