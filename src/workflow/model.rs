use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::core::errors::{MaestroError, Result};
use crate::scheduler::TaskData;

/// Per-workflow execution options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowOptions {
    /// Keep going after a failed step
    pub continue_on_error: bool,
    /// Limit for a single step; expiry fails the step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
}

impl WorkflowOptions {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}

/// One step of a workflow or process: a nested workflow or a scheduled task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    Workflow {
        id: String,
        name: String,
        #[serde(default)]
        tasks: Vec<Step>,
        #[serde(default)]
        config: WorkflowOptions,
    },
    Task {
        id: String,
        task_data: TaskData,
        #[serde(default)]
        priority: i32,
    },
}

impl Step {
    pub fn task(id: impl Into<String>, task_data: TaskData) -> Self {
        Step::Task {
            id: id.into(),
            task_data,
            priority: 0,
        }
    }

    pub fn workflow(
        id: impl Into<String>,
        name: impl Into<String>,
        tasks: Vec<Step>,
        config: WorkflowOptions,
    ) -> Self {
        Step::Workflow {
            id: id.into(),
            name: name.into(),
            tasks,
            config,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Step::Workflow { id, .. } | Step::Task { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Workflow { .. } => "workflow",
            Step::Task { .. } => "task",
        }
    }

    /// Parses a step descriptor, rejecting unknown `type` tags at any depth
    pub fn from_value(value: Value) -> Result<Self> {
        check_step_types(&value)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn parse_all(values: Vec<Value>) -> Result<Vec<Self>> {
        values.into_iter().map(Self::from_value).collect()
    }
}

impl TryFrom<Value> for Step {
    type Error = MaestroError;

    fn try_from(value: Value) -> Result<Self> {
        Step::from_value(value)
    }
}

fn check_step_types(value: &Value) -> Result<()> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| MaestroError::validation_field("step is missing a string `type`", "type"))?;
    match kind {
        "task" => Ok(()),
        "workflow" => match value.get("tasks") {
            Some(Value::Array(nested)) => nested.iter().try_for_each(check_step_types),
            _ => Ok(()),
        },
        other => Err(MaestroError::UnknownStepType(other.to_string())),
    }
}

/// Workflow lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// A captured step failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub step_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl StepError {
    pub fn new(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

/// An ordered, resumable sequence of steps
///
/// The struct doubles as the history snapshot. State changes go through the
/// transition methods below, which enforce the lifecycle
/// `PENDING -> RUNNING <-> PAUSED -> COMPLETED | FAILED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub tasks: Vec<Step>,
    pub config: WorkflowOptions,
    pub status: WorkflowStatus,
    pub current_task_index: usize,
    /// step id -> result, in completion order
    pub results: Map<String, Value>,
    pub errors: Vec<StepError>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, tasks: Vec<Step>, config: WorkflowOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            tasks,
            config,
            status: WorkflowStatus::Pending,
            current_task_index: 0,
            results: Map::new(),
            errors: Vec::new(),
            start_time: None,
            end_time: None,
        }
    }

    pub(crate) fn begin(&mut self) -> Result<()> {
        if self.status != WorkflowStatus::Pending {
            return Err(MaestroError::invalid_state(
                "workflow",
                &self.id,
                format!("cannot start from {:?}", self.status),
            ));
        }
        self.status = WorkflowStatus::Running;
        self.start_time = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn pause(&mut self) -> bool {
        if self.status != WorkflowStatus::Running {
            return false;
        }
        self.status = WorkflowStatus::Paused;
        true
    }

    pub(crate) fn resume(&mut self) -> bool {
        if self.status != WorkflowStatus::Paused {
            return false;
        }
        self.status = WorkflowStatus::Running;
        true
    }

    pub(crate) fn cancel(&mut self) {
        self.status = WorkflowStatus::Failed;
        self.end_time = Some(Utc::now());
    }

    /// The step at the cursor, if the workflow should keep executing
    pub(crate) fn next_step(&self) -> Option<Step> {
        if self.status != WorkflowStatus::Running {
            return None;
        }
        self.tasks.get(self.current_task_index).cloned()
    }

    pub(crate) fn record_success(&mut self, step_id: &str, value: Value) {
        self.results.insert(step_id.to_string(), value);
        self.current_task_index += 1;
    }

    pub(crate) fn record_failure(&mut self, step_id: &str, error: String) {
        self.errors.push(StepError::new(step_id, error));
        if self.config.continue_on_error {
            self.current_task_index += 1;
        } else if !self.status.is_terminal() {
            // also covers a step that was in flight when the workflow got paused
            self.status = WorkflowStatus::Failed;
            self.end_time = Some(Utc::now());
        }
    }

    /// Marks a running workflow whose cursor passed the last step completed
    pub(crate) fn complete_if_done(&mut self) -> bool {
        if self.status == WorkflowStatus::Running && self.current_task_index >= self.tasks.len() {
            self.status = WorkflowStatus::Completed;
            self.end_time = Some(Utc::now());
            return true;
        }
        false
    }
}
