pub mod graph;
pub mod orchestrator;

pub use graph::{execution_order, validate_dependency_graph};
pub use orchestrator::{Process, ProcessConfig, ProcessOrchestrator, ProcessStatus, ProcessSummary};
