use chrono::NaiveDate;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::core::errors::{MaestroError, Result};
use crate::scheduler::TaskScheduler;
use crate::workflow::history::WorkflowHistory;
use crate::workflow::model::{Step, Workflow, WorkflowOptions, WorkflowStatus};

struct WorkflowRun {
    workflow: Workflow,
    /// A driver loop is currently executing this workflow's steps
    driving: bool,
}

/// A registered workflow plus a channel announcing its status changes
struct WorkflowHandle {
    run: Mutex<WorkflowRun>,
    status_tx: watch::Sender<WorkflowStatus>,
}

impl WorkflowHandle {
    fn new(workflow: Workflow) -> Self {
        let (status_tx, _) = watch::channel(workflow.status);
        Self {
            run: Mutex::new(WorkflowRun {
                workflow,
                driving: false,
            }),
            status_tx,
        }
    }

    /// Runs `f` under the lock and publishes the status if it changed
    fn with<R>(&self, f: impl FnOnce(&mut WorkflowRun) -> R) -> R {
        let mut run = self.run.lock();
        let before = run.workflow.status;
        let result = f(&mut run);
        let after = run.workflow.status;
        if before != after {
            self.status_tx.send_replace(after);
        }
        result
    }

    fn snapshot(&self) -> Workflow {
        self.run.lock().workflow.clone()
    }
}

/// Row of [`WorkflowManager::list_workflows`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub current_task_index: usize,
    pub total_tasks: usize,
}

/// Factory and registry of workflows
///
/// `start_workflow` and `resume_workflow` drive the steps on the caller's
/// task and return once the workflow pauses or reaches a terminal state;
/// spawn them to run workflows concurrently. Task steps go through the
/// shared [`TaskScheduler`], whose tick loop must be running.
pub struct WorkflowManager {
    workflows: DashMap<String, Arc<WorkflowHandle>>,
    scheduler: Arc<TaskScheduler>,
    history: Option<WorkflowHistory>,
}

impl WorkflowManager {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            workflows: DashMap::new(),
            scheduler,
            history: None,
        }
    }

    /// Saves a snapshot of every workflow that reaches a terminal state
    pub fn with_history(mut self, history: WorkflowHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Registers a new `PENDING` workflow and returns its id
    pub fn create_workflow(
        &self,
        name: impl Into<String>,
        tasks: Vec<Step>,
        config: WorkflowOptions,
    ) -> String {
        let workflow = Workflow::new(name, tasks, config);
        let id = workflow.id.clone();
        info!(workflow_id = %id, name = %workflow.name, steps = workflow.tasks.len(), "Workflow created");
        self.workflows
            .insert(id.clone(), Arc::new(WorkflowHandle::new(workflow)));
        id
    }

    /// Like `create_workflow`, from raw step descriptors
    pub fn create_workflow_from_values(
        &self,
        name: impl Into<String>,
        tasks: Vec<Value>,
        config: WorkflowOptions,
    ) -> Result<String> {
        let steps = Step::parse_all(tasks)?;
        Ok(self.create_workflow(name, steps, config))
    }

    fn handle(&self, id: &str) -> Result<Arc<WorkflowHandle>> {
        self.workflows
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MaestroError::not_found("workflow", id))
    }

    /// Moves a pending workflow to `RUNNING` and executes its steps
    pub async fn start_workflow(&self, id: &str) -> Result<WorkflowStatus> {
        let handle = self.handle(id)?;
        handle.with(|run| {
            run.workflow.begin()?;
            run.driving = true;
            Ok::<_, MaestroError>(())
        })?;
        info!(workflow_id = %id, "Workflow started");
        Ok(self.drive(id, &handle).await)
    }

    /// Returns `false` unless the workflow was running
    pub fn pause_workflow(&self, id: &str) -> Result<bool> {
        let handle = self.handle(id)?;
        let paused = handle.with(|run| run.workflow.pause());
        if paused {
            info!(workflow_id = %id, "Workflow paused");
        }
        Ok(paused)
    }

    /// Continues a paused workflow from its cursor
    ///
    /// Returns `false` unless the workflow was paused. When the step that was
    /// in flight at pause time is still running, its driver picks up the
    /// remaining steps and this call returns immediately.
    pub async fn resume_workflow(&self, id: &str) -> Result<bool> {
        let handle = self.handle(id)?;
        let action = handle.with(|run| {
            if !run.workflow.resume() {
                return None;
            }
            if run.driving {
                return Some(false);
            }
            run.driving = true;
            Some(true)
        });
        match action {
            None => Ok(false),
            Some(drive) => {
                info!(workflow_id = %id, "Workflow resumed");
                if drive {
                    self.drive(id, &handle).await;
                }
                Ok(true)
            }
        }
    }

    /// Forces `FAILED`; a step already in flight still runs to completion
    pub fn cancel_workflow(&self, id: &str) -> Result<()> {
        let handle = self.handle(id)?;
        handle.with(|run| run.workflow.cancel());
        info!(workflow_id = %id, "Workflow cancelled");
        self.save_logged(&handle.snapshot());
        Ok(())
    }

    /// Waits until the workflow is `COMPLETED` or `FAILED`
    pub async fn wait_for_completion(&self, id: &str) -> Result<WorkflowStatus> {
        let handle = self.handle(id)?;
        let mut rx = handle.status_tx.subscribe();
        let result = rx.wait_for(|status| status.is_terminal()).await;
        match result {
            Ok(status) => Ok(*status),
            Err(_) => Err(MaestroError::internal(format!(
                "status channel of workflow {} closed",
                id
            ))),
        }
    }

    async fn drive(&self, id: &str, handle: &WorkflowHandle) -> WorkflowStatus {
        loop {
            let next = handle.with(|run| {
                let next = run.workflow.next_step().map(|step| (step, run.workflow.config.step_timeout()));
                if next.is_none() {
                    run.workflow.complete_if_done();
                    run.driving = false;
                }
                next
            });
            let Some((step, step_timeout)) = next else {
                break;
            };

            debug!(workflow_id = %id, step_id = %step.id(), step_type = step.kind(), "Executing step");
            let outcome = self.run_step(id, &step, step_timeout).await;
            handle.with(|run| match outcome {
                Ok(value) => run.workflow.record_success(step.id(), value),
                Err(e) => {
                    error!(
                        workflow_id = %id,
                        step_id = %step.id(),
                        category = e.category(),
                        recoverable = e.is_recoverable(),
                        error = %e,
                        "Step failed"
                    );
                    run.workflow.record_failure(step.id(), e.to_string());
                }
            });
        }

        let snapshot = handle.snapshot();
        if snapshot.status.is_terminal() {
            info!(
                workflow_id = %id,
                status = ?snapshot.status,
                results = snapshot.results.len(),
                errors = snapshot.errors.len(),
                "Workflow finished"
            );
            self.save_logged(&snapshot);
        }
        snapshot.status
    }

    async fn run_step(&self, owner_id: &str, step: &Step, limit: Option<Duration>) -> Result<Value> {
        match limit {
            Some(limit) => timeout(limit, self.execute_step(owner_id, step))
                .await
                .unwrap_or_else(|_| {
                    Err(MaestroError::timeout(
                        format!("step {}", step.id()),
                        limit.as_millis() as u64,
                    ))
                }),
            None => self.execute_step(owner_id, step).await,
        }
    }

    /// Executes one step and waits for it to finish
    ///
    /// A task step is submitted to the scheduler as `{owner_id}/{step_id}`. A
    /// workflow step creates and runs a nested workflow; its results object
    /// is the step result, and a nested failure fails the step.
    pub fn execute_step<'a>(&'a self, owner_id: &'a str, step: &'a Step) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match step {
                Step::Task {
                    id,
                    task_data,
                    priority,
                } => {
                    let task_id = format!("{}/{}", owner_id, id);
                    let outcome = self
                        .scheduler
                        .submit_and_wait(task_id.clone(), task_data.clone(), *priority)
                        .await?;
                    outcome
                        .into_result()
                        .map_err(|message| MaestroError::task(task_id, message))
                }
                Step::Workflow {
                    name,
                    tasks,
                    config,
                    ..
                } => {
                    let nested_id = self.create_workflow(name.clone(), tasks.clone(), config.clone());
                    let mut status = self.start_workflow(&nested_id).await?;
                    if !status.is_terminal() {
                        status = self.wait_for_completion(&nested_id).await?;
                    }
                    let nested = self
                        .get_workflow(&nested_id)
                        .ok_or_else(|| MaestroError::not_found("workflow", nested_id.as_str()))?;
                    if status == WorkflowStatus::Completed {
                        Ok(Value::Object(nested.results))
                    } else {
                        Err(MaestroError::execution(
                            "workflow",
                            format!("nested workflow '{}' ({}) failed", name, nested_id),
                        )
                        .with_context("workflow_id", nested_id))
                    }
                }
            }
        })
    }

    pub fn get_workflow_status(&self, id: &str) -> Option<WorkflowStatus> {
        self.workflows
            .get(id)
            .map(|entry| entry.value().run.lock().workflow.status)
    }

    /// Full snapshot of one workflow
    pub fn get_workflow(&self, id: &str) -> Option<Workflow> {
        self.workflows.get(id).map(|entry| entry.value().snapshot())
    }

    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<WorkflowSummary> = self
            .workflows
            .iter()
            .map(|entry| {
                let run = entry.value().run.lock();
                WorkflowSummary {
                    id: run.workflow.id.clone(),
                    name: run.workflow.name.clone(),
                    status: run.workflow.status,
                    current_task_index: run.workflow.current_task_index,
                    total_tasks: run.workflow.tasks.len(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Writes the snapshot to history; `None` when no history is configured
    pub fn save_workflow_history(&self, workflow: &Workflow) -> Result<Option<String>> {
        match &self.history {
            Some(history) => history.save(workflow).map(Some),
            None => Ok(None),
        }
    }

    pub fn load_workflow_history(&self, id: &str, date: NaiveDate) -> Result<Option<Workflow>> {
        match &self.history {
            Some(history) => history.load(id, date),
            None => Ok(None),
        }
    }

    pub fn list_history_keys(&self) -> Result<Vec<String>> {
        match &self.history {
            Some(history) => history.keys(),
            None => Ok(Vec::new()),
        }
    }

    fn save_logged(&self, workflow: &Workflow) {
        if let Err(e) = self.save_workflow_history(workflow) {
            warn!(workflow_id = %workflow.id, error = %e, "Failed to save workflow history");
        }
    }
}

impl std::fmt::Debug for WorkflowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowManager")
            .field("workflows", &self.workflows.len())
            .field("history", &self.history.is_some())
            .finish()
    }
}
