pub mod handler;
pub mod model;
#[allow(clippy::module_inception)]
pub mod scheduler;

pub use handler::{HandlerContext, HandlerRegistry, TaskHandler, TASK_HANDLERS};
pub use model::{ScheduledTask, ScheduledTaskInfo, TaskData, TaskOutcome};
pub use scheduler::TaskScheduler;
