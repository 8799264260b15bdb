use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::core::config::SchedulerConfig;
use crate::core::errors::{MaestroError, Result};
use crate::core::memory::CacheManager;
use crate::scheduler::handler::{HandlerContext, HandlerRegistry};
use crate::scheduler::model::{QueuedTask, ScheduledTask, ScheduledTaskInfo, TaskData, TaskOutcome};

struct RunningTask {
    seq: u64,
    abort: AbortHandle,
    info: ScheduledTaskInfo,
}

/// Time-ordered queue of tasks plus the loop that executes them
///
/// Tasks leave the heap strictly by `scheduled_time`. Each execution runs on
/// its own tokio task wrapped in an abort handle, so `cancel_task` can stop
/// it mid-flight.
pub struct TaskScheduler {
    config: SchedulerConfig,
    handlers: HandlerRegistry,
    cache: Option<Arc<CacheManager>>,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    /// task_id -> most recent in-flight execution
    running: DashMap<String, RunningTask>,
    /// seq -> caller awaiting that execution
    waiters: DashMap<u64, oneshot::Sender<TaskOutcome>>,
    last_results: DashMap<String, TaskOutcome>,
    permits: Arc<Semaphore>,
    wakeup: Notify,
    next_seq: AtomicU64,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, handlers: HandlerRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            handlers,
            cache: None,
            queue: Mutex::new(BinaryHeap::new()),
            running: DashMap::new(),
            waiters: DashMap::new(),
            last_results: DashMap::new(),
            wakeup: Notify::new(),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Lets task bodies with a `cache_key` be memoized
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queues a task; the same `task_id` may be queued any number of times
    pub fn schedule_task(
        &self,
        task_id: impl Into<String>,
        task_data: TaskData,
        scheduled_time: DateTime<Utc>,
        priority: i32,
        recurring: bool,
        interval: Option<Duration>,
    ) -> Result<()> {
        self.schedule(ScheduledTask {
            task_id: task_id.into(),
            scheduled_time,
            task_data,
            priority,
            recurring,
            interval,
        })
    }

    pub fn schedule(&self, task: ScheduledTask) -> Result<()> {
        if task.recurring && task.interval.map_or(true, |interval| interval.is_zero()) {
            return Err(MaestroError::validation_field(
                format!("recurring task {} needs a non-zero interval", task.task_id),
                "interval",
            ));
        }
        self.enqueue(task, None);
        Ok(())
    }

    fn enqueue(&self, task: ScheduledTask, waiter: Option<oneshot::Sender<TaskOutcome>>) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = waiter {
            self.waiters.insert(seq, tx);
        }
        let rank = if self.config.priority_tiebreak {
            task.priority
        } else {
            0
        };
        debug!(task_id = %task.task_id, scheduled_time = %task.scheduled_time, "Task queued");
        self.queue.lock().push(QueuedTask { task, rank, seq });
        self.wakeup.notify_one();
        seq
    }

    /// Schedules a task for now and waits for its outcome
    ///
    /// Only resolves while the tick loop is running (see [`TaskScheduler::spawn`]).
    pub async fn submit_and_wait(
        &self,
        task_id: impl Into<String>,
        task_data: TaskData,
        priority: i32,
    ) -> Result<TaskOutcome> {
        let task = ScheduledTask::new(task_id, task_data, Utc::now()).with_priority(priority);
        let task_id = task.task_id.clone();
        let (tx, rx) = oneshot::channel();
        self.enqueue(task, Some(tx));
        rx.await
            .map_err(|_| MaestroError::cancelled(format!("waiting for task {}", task_id)))
    }

    /// Runs the tick loop on a background tokio task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.start().await })
    }

    /// Executes due tasks once per tick, forever
    pub async fn start(self: Arc<Self>) {
        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            max_concurrent = self.config.max_concurrent_tasks,
            "Task scheduler started"
        );
        loop {
            self.dispatch_due();
            tokio::select! {
                _ = sleep(self.config.tick) => {}
                _ = self.wakeup.notified() => {}
            }
        }
    }

    /// Launches every due task a free permit is available for
    fn dispatch_due(self: &Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("Concurrency limit reached, due tasks stay queued");
                    return;
                }
            };
            let now = Utc::now();
            let (entry, registration) = {
                let mut queue = self.queue.lock();
                match queue.peek() {
                    Some(next) if next.task.scheduled_time <= now => {}
                    _ => return,
                }
                let Some(entry) = queue.pop() else {
                    return;
                };
                // registered while the queue is locked so cancel_task sees it in one place or the other
                let (abort, registration) = AbortHandle::new_pair();
                self.running.insert(
                    entry.task.task_id.clone(),
                    RunningTask {
                        seq: entry.seq,
                        abort,
                        info: ScheduledTaskInfo::from(&entry.task),
                    },
                );
                (entry, registration)
            };
            self.launch(entry, registration, permit);
        }
    }

    fn launch(
        self: &Arc<Self>,
        entry: QueuedTask,
        registration: futures::future::AbortRegistration,
        permit: OwnedSemaphorePermit,
    ) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(task_id = %entry.task.task_id, task_type = %entry.task.task_data.kind, "Task started");
            let body = Abortable::new(scheduler.run_task(&entry.task), registration);
            let outcome = match body.await {
                Ok(outcome) => outcome,
                Err(_aborted) => TaskOutcome::Cancelled,
            };
            drop(permit);
            scheduler.finish(entry, outcome);
        });
    }

    async fn run_task(&self, task: &ScheduledTask) -> TaskOutcome {
        match self.config.task_timeout {
            Some(limit) => match timeout(limit, self.execute_body(task)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let err = MaestroError::timeout(
                        format!("task {}", task.task_id),
                        limit.as_millis() as u64,
                    );
                    TaskOutcome::Failed(err.to_string())
                }
            },
            None => self.execute_body(task).await,
        }
    }

    async fn execute_body(&self, task: &ScheduledTask) -> TaskOutcome {
        let data = &task.task_data;
        let Some(handler) = self.handlers.get(&data.kind) else {
            return TaskOutcome::Failed(MaestroError::UnknownTaskType(data.kind.clone()).to_string());
        };

        let cache = match (&data.cache_key, &self.cache) {
            (Some(key), Some(cache)) => Some((key, cache)),
            _ => None,
        };
        if let Some((key, cache)) = cache {
            if let Some(value) = cache.get(key) {
                debug!(task_id = %task.task_id, cache_key = %key, "Task result served from cache");
                return TaskOutcome::Completed(value);
            }
        }

        if let Err(e) = handler.validate_input(&data.input) {
            return TaskOutcome::Failed(e.to_string());
        }

        let ctx = HandlerContext {
            task_id: task.task_id.clone(),
            scheduled_time: task.scheduled_time,
            cache: self.cache.clone(),
        };
        match handler.execute(data.input.clone(), &ctx).await {
            Ok(value) => {
                if let Some((key, cache)) = cache {
                    cache.set(key, value.clone(), data.cache_ttl());
                }
                TaskOutcome::Completed(value)
            }
            Err(e) => TaskOutcome::Failed(format!("{:#}", e)),
        }
    }

    fn finish(&self, entry: QueuedTask, outcome: TaskOutcome) {
        let task = entry.task;
        self.running
            .remove_if(&task.task_id, |_, running| running.seq == entry.seq);

        match &outcome {
            TaskOutcome::Completed(_) => info!(task_id = %task.task_id, "Task completed"),
            TaskOutcome::Failed(message) => {
                error!(task_id = %task.task_id, error = %message, "Task failed")
            }
            TaskOutcome::Cancelled => info!(task_id = %task.task_id, "Task cancelled"),
        }

        self.last_results.insert(task.task_id.clone(), outcome.clone());
        if let Some((_, tx)) = self.waiters.remove(&entry.seq) {
            let _ = tx.send(outcome.clone());
        }

        if task.recurring && outcome != TaskOutcome::Cancelled {
            match task.next_occurrence() {
                Some(next) => {
                    let mut again = task;
                    again.scheduled_time = next;
                    self.enqueue(again, None);
                }
                None => warn!(task_id = %task.task_id, "Recurring task could not be rescheduled"),
            }
        }
        self.wakeup.notify_one();
    }

    /// Cancels an in-flight execution, or else the next queued entry for `task_id`
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let removed = {
            let mut queue = self.queue.lock();
            if let Some((_, running)) = self.running.remove(task_id) {
                running.abort.abort();
                info!(task_id = %task_id, "Cancelled running task");
                return true;
            }

            let mut entries = std::mem::take(&mut *queue).into_vec();
            let position = entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.task.task_id == task_id)
                .max_by(|(_, a), (_, b)| a.cmp(b))
                .map(|(index, _)| index);
            let removed = position.map(|index| entries.swap_remove(index));
            *queue = BinaryHeap::from(entries);
            removed
        };

        match removed {
            Some(entry) => {
                info!(task_id = %task_id, "Cancelled queued task");
                self.last_results
                    .insert(task_id.to_string(), TaskOutcome::Cancelled);
                if let Some((_, tx)) = self.waiters.remove(&entry.seq) {
                    let _ = tx.send(TaskOutcome::Cancelled);
                }
                true
            }
            None => false,
        }
    }

    /// Outcome of the latest finished execution of `task_id`
    pub fn get_task_result(&self, task_id: &str) -> Option<TaskOutcome> {
        self.last_results.get(task_id).map(|entry| entry.value().clone())
    }

    /// Queued tasks in execution order
    pub fn get_scheduled_tasks(&self) -> Vec<ScheduledTaskInfo> {
        let entries = self.queue.lock().clone().into_sorted_vec();
        // into_sorted_vec is ascending by Ord, which is reversed for the heap
        entries
            .iter()
            .rev()
            .map(|entry| ScheduledTaskInfo::from(&entry.task))
            .collect()
    }

    pub fn get_running_tasks(&self) -> Vec<ScheduledTaskInfo> {
        let mut running: Vec<ScheduledTaskInfo> =
            self.running.iter().map(|entry| entry.info.clone()).collect();
        running.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        running
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .field("running", &self.running_count())
            .finish()
    }
}
