use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::time::Duration;

/// Payload of a scheduled task, dispatched by its `type` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub input: Value,
    /// Memoize successful results in the shared cache under this key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
}

impl TaskData {
    pub fn new(kind: impl Into<String>, input: Value) -> Self {
        Self {
            kind: kind.into(),
            input,
            cache_key: None,
            cache_ttl_secs: None,
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.cache_key = Some(key.into());
        self.cache_ttl_secs = ttl.map(|ttl| ttl.as_secs());
        self
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }
}

/// A unit of deferred or immediate work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub scheduled_time: DateTime<Utc>,
    pub task_data: TaskData,
    /// Lower sorts first when used as a tiebreak
    pub priority: i32,
    pub recurring: bool,
    pub interval: Option<Duration>,
}

impl ScheduledTask {
    pub fn new(task_id: impl Into<String>, task_data: TaskData, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            scheduled_time,
            task_data,
            priority: 0,
            recurring: false,
            interval: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn recurring(mut self, interval: Duration) -> Self {
        self.recurring = true;
        self.interval = Some(interval);
        self
    }

    /// The time of the next run of a recurring task, keyed off the
    /// original scheduled time so cadence survives scheduler delay
    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        if !self.recurring {
            return None;
        }
        let interval = chrono::Duration::from_std(self.interval?).ok()?;
        self.scheduled_time.checked_add_signed(interval)
    }
}

/// Heap entry; `BinaryHeap` is a max-heap so the ordering is reversed
#[derive(Debug, Clone)]
pub(crate) struct QueuedTask {
    pub task: ScheduledTask,
    /// Secondary key: the priority when tiebreaking is enabled, else 0
    pub rank: i32,
    /// Insertion order, keeps equal keys FIFO and identifies the entry
    pub seq: u64,
}

impl QueuedTask {
    fn key(&self) -> (DateTime<Utc>, i32, u64) {
        (self.task.scheduled_time, self.rank, self.seq)
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Final outcome of one task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    /// Converts to a step result, failures carry their message
    pub fn into_result(self) -> std::result::Result<Value, String> {
        match self {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::Failed(message) => Err(message),
            TaskOutcome::Cancelled => Err("task was cancelled".to_string()),
        }
    }
}

/// Snapshot of a queued or running task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledTaskInfo {
    pub task_id: String,
    pub scheduled_time: DateTime<Utc>,
    pub task_type: String,
    pub priority: i32,
    pub recurring: bool,
    pub interval: Option<Duration>,
    pub task_data: TaskData,
}

impl From<&ScheduledTask> for ScheduledTaskInfo {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            scheduled_time: task.scheduled_time,
            task_type: task.task_data.kind.clone(),
            priority: task.priority,
            recurring: task.recurring,
            interval: task.interval,
            task_data: task.task_data.clone(),
        }
    }
}
