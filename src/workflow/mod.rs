pub mod history;
pub mod manager;
pub mod model;

pub use history::WorkflowHistory;
pub use manager::{WorkflowManager, WorkflowSummary};
pub use model::{Step, StepError, Workflow, WorkflowOptions, WorkflowStatus};
