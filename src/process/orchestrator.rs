use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::config::{FailurePolicy, OrchestratorConfig};
use crate::core::errors::{MaestroError, Result};
use crate::process::graph::{execution_order, validate_dependency_graph};
use crate::workflow::{Step, StepError, WorkflowManager};

/// Definition of one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Ids of processes that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl ProcessConfig {
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps,
            dependencies: Vec::new(),
            continue_on_error: false,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Parses a process descriptor, rejecting unknown step types
    pub fn from_value(mut value: Value) -> Result<Self> {
        let steps = match value.get_mut("steps").and_then(Value::as_array_mut) {
            Some(steps) => Step::parse_all(std::mem::take(steps))?,
            None => Vec::new(),
        };
        let mut config: ProcessConfig = serde_json::from_value(value)?;
        config.steps = steps;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct ProcessDocument {
    processes: Vec<Value>,
}

/// Process lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessStatus {
    Initializing,
    Running,
    Waiting,
    Completed,
    Failed,
}

/// A registered process and its execution record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Process {
    pub config: ProcessConfig,
    pub status: ProcessStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Id of the step executing or last executed
    pub current_step: Option<String>,
    pub results: Map<String, Value>,
    pub errors: Vec<StepError>,
}

impl Process {
    fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            status: ProcessStatus::Initializing,
            start_time: None,
            end_time: None,
            current_step: None,
            results: Map::new(),
            errors: Vec::new(),
        }
    }

    fn finish(&mut self, status: ProcessStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }
}

/// Row of [`ProcessOrchestrator::list_processes`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSummary {
    pub id: String,
    pub name: Option<String>,
    pub status: ProcessStatus,
    pub dependencies: Vec<String>,
}

/// Runs dependency-ordered processes
///
/// A process whose dependencies have not all completed parks in `WAITING`;
/// every completion re-checks the waiting dependents and starts those that
/// are now unblocked.
pub struct ProcessOrchestrator {
    processes: DashMap<String, Arc<Mutex<Process>>>,
    /// process_id -> dependency ids
    dependencies: Mutex<HashMap<String, Vec<String>>>,
    workflows: Arc<WorkflowManager>,
    config: OrchestratorConfig,
}

impl ProcessOrchestrator {
    pub fn new(workflows: Arc<WorkflowManager>, config: OrchestratorConfig) -> Self {
        Self {
            processes: DashMap::new(),
            dependencies: Mutex::new(HashMap::new()),
            workflows,
            config,
        }
    }

    pub fn workflows(&self) -> &Arc<WorkflowManager> {
        &self.workflows
    }

    /// Registers a process in `INITIALIZING`
    ///
    /// Dependencies may name processes that are created later, but a
    /// dependency that would close a cycle is rejected.
    pub fn create_process(&self, config: ProcessConfig) -> Result<String> {
        let id = config.id.clone();
        if id.is_empty() {
            return Err(MaestroError::validation_field("process id cannot be empty", "id"));
        }

        let mut dependencies = self.dependencies.lock();
        if self.processes.contains_key(&id) {
            return Err(MaestroError::validation_field(
                format!("process {} already exists", id),
                "id",
            ));
        }
        dependencies.insert(id.clone(), config.dependencies.clone());
        if let Err(e) = validate_dependency_graph(&id, &dependencies) {
            dependencies.remove(&id);
            return Err(e);
        }
        info!(process_id = %id, dependencies = ?config.dependencies, "Process created");
        self.processes
            .insert(id.clone(), Arc::new(Mutex::new(Process::new(config))));
        Ok(id)
    }

    pub fn create_process_from_value(&self, value: Value) -> Result<String> {
        self.create_process(ProcessConfig::from_value(value)?)
    }

    /// Registers every entry of a `processes:` YAML document
    pub fn load_yaml_str(&self, content: &str) -> Result<Vec<String>> {
        let document: ProcessDocument = serde_yaml::from_str(content)?;
        let configs = document
            .processes
            .into_iter()
            .map(ProcessConfig::from_value)
            .collect::<Result<Vec<_>>>()?;
        configs
            .into_iter()
            .map(|config| self.create_process(config))
            .collect()
    }

    pub fn load_yaml_file(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| MaestroError::io(format!("read process file {}", path.display()), e))?;
        let ids = self.load_yaml_str(&content)?;
        info!("Loaded {} processes from {}", ids.len(), path.display());
        Ok(ids)
    }

    // clones the handle out so no map guard is held while a process is locked
    fn lookup(&self, id: &str) -> Option<Arc<Mutex<Process>>> {
        self.processes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn process(&self, id: &str) -> Result<Arc<Mutex<Process>>> {
        self.lookup(id)
            .ok_or_else(|| MaestroError::not_found("process", id))
    }

    /// True when every dependency of `id` exists and has completed
    pub fn check_dependencies(&self, id: &str) -> bool {
        let deps = self
            .dependencies
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_default();
        deps.iter()
            .all(|dep| self.status_of(dep) == Some(ProcessStatus::Completed))
    }

    /// Runs the process if its dependencies are met, else parks it in `WAITING`
    ///
    /// Step failures are recorded in the process errors. Without
    /// `continue_on_error` the first failure ends the process as `FAILED`.
    /// A completed process starts its waiting dependents before this returns.
    pub fn start_process<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ProcessStatus>> {
        Box::pin(async move {
            let process = self.process(id)?;
            let (steps, continue_on_error) = {
                let mut p = process.lock();
                match p.status {
                    ProcessStatus::Initializing | ProcessStatus::Waiting => {}
                    other => {
                        return Err(MaestroError::invalid_state(
                            "process",
                            id,
                            format!("cannot start from {:?}", other),
                        ))
                    }
                }
                if !self.check_dependencies(id) {
                    p.status = ProcessStatus::Waiting;
                    info!(process_id = %id, "Process waiting for dependencies");
                    return Ok(ProcessStatus::Waiting);
                }
                p.status = ProcessStatus::Running;
                p.start_time = Some(Utc::now());
                (p.config.steps.clone(), p.config.continue_on_error)
            };
            info!(process_id = %id, steps = steps.len(), "Process started");

            let status = self.execute_process_steps(id, &process, &steps, continue_on_error).await;
            process.lock().finish(status);

            match status {
                ProcessStatus::Completed => {
                    info!(process_id = %id, "Process completed");
                    self.check_dependent_processes(id).await;
                }
                _ => {
                    error!(process_id = %id, "Process failed");
                    if self.config.failure_policy == FailurePolicy::Cascade {
                        self.fail_dependents(id);
                    }
                }
            }
            Ok(status)
        })
    }

    async fn execute_process_steps(
        &self,
        id: &str,
        process: &Mutex<Process>,
        steps: &[Step],
        continue_on_error: bool,
    ) -> ProcessStatus {
        for step in steps {
            process.lock().current_step = Some(step.id().to_string());
            debug!(process_id = %id, step_id = %step.id(), step_type = step.kind(), "Executing process step");

            match self.workflows.execute_step(id, step).await {
                Ok(value) => {
                    process.lock().results.insert(step.id().to_string(), value);
                }
                Err(e) => {
                    error!(
                        process_id = %id,
                        step_id = %step.id(),
                        category = e.category(),
                        error = %e,
                        "Process step failed"
                    );
                    process
                        .lock()
                        .errors
                        .push(StepError::new(step.id(), e.to_string()));
                    if !continue_on_error {
                        return ProcessStatus::Failed;
                    }
                }
            }
        }
        ProcessStatus::Completed
    }

    fn dependents_of(&self, id: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .dependencies
            .lock()
            .iter()
            .filter(|(_, deps)| deps.iter().any(|dep| dep == id))
            .map(|(dependent, _)| dependent.clone())
            .collect();
        dependents.sort();
        dependents
    }

    fn status_of(&self, id: &str) -> Option<ProcessStatus> {
        self.lookup(id).map(|process| process.lock().status)
    }

    /// Starts every waiting dependent of `id` whose dependencies are now met
    async fn check_dependent_processes(&self, id: &str) {
        let ready: Vec<String> = self
            .dependents_of(id)
            .into_iter()
            .filter(|dependent| {
                self.status_of(dependent) == Some(ProcessStatus::Waiting)
                    && self.check_dependencies(dependent)
            })
            .collect();
        if ready.is_empty() {
            return;
        }
        debug!(process_id = %id, dependents = ?ready, "Starting unblocked dependents");

        let starts = ready.iter().map(|dependent| self.start_process(dependent));
        for (dependent, result) in ready.iter().zip(join_all(starts).await) {
            if let Err(e) = result {
                warn!(process_id = %dependent, error = %e, "Dependent process did not start");
            }
        }
    }

    /// Marks waiting dependents of a failed process as failed, transitively
    fn fail_dependents(&self, id: &str) {
        let mut queue: VecDeque<String> = VecDeque::from([id.to_string()]);
        while let Some(failed) = queue.pop_front() {
            for dependent in self.dependents_of(&failed) {
                let Ok(process) = self.process(&dependent) else {
                    continue;
                };
                let mut p = process.lock();
                if p.status != ProcessStatus::Waiting {
                    continue;
                }
                p.errors.push(StepError::new(
                    "dependencies",
                    format!("dependency {} failed", failed),
                ));
                p.finish(ProcessStatus::Failed);
                warn!(process_id = %dependent, dependency = %failed, "Process failed by dependency");
                queue.push_back(dependent);
            }
        }
    }

    pub fn get_process_status(&self, id: &str) -> Option<ProcessStatus> {
        self.status_of(id)
    }

    /// Step results of a process, empty for unknown ids
    pub fn get_process_results(&self, id: &str) -> Map<String, Value> {
        self.lookup(id)
            .map(|process| process.lock().results.clone())
            .unwrap_or_default()
    }

    /// Captured step errors of a process, empty for unknown ids
    pub fn get_process_errors(&self, id: &str) -> Vec<StepError> {
        self.lookup(id)
            .map(|process| process.lock().errors.clone())
            .unwrap_or_default()
    }

    pub fn get_process(&self, id: &str) -> Option<Process> {
        self.lookup(id).map(|process| process.lock().clone())
    }

    /// All processes, dependencies first
    pub fn list_processes(&self) -> Vec<ProcessSummary> {
        let order = {
            let dependencies = self.dependencies.lock();
            execution_order(&dependencies).unwrap_or_else(|_| {
                let mut ids: Vec<String> = dependencies.keys().cloned().collect();
                ids.sort();
                ids
            })
        };
        order
            .into_iter()
            .filter_map(|id| {
                let process = self.get_process(&id)?;
                Some(ProcessSummary {
                    id,
                    name: process.config.name,
                    status: process.status,
                    dependencies: process.config.dependencies,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for ProcessOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessOrchestrator")
            .field("processes", &self.processes.len())
            .field("config", &self.config)
            .finish()
    }
}
