//! Task scheduler: time ordering, cancellation, recurrence and memoization

use chrono::Utc;
use maestro::{
    CacheConfig, CacheManager, HandlerRegistry, SchedulerConfig, TaskData, TaskOutcome,
    TaskScheduler,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        tick: Duration::from_millis(10),
        ..SchedulerConfig::default()
    }
}

/// Handlers that log every execution in order
fn recording_handlers() -> (HandlerRegistry, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handlers = HandlerRegistry::new();
    let sink = Arc::clone(&log);
    handlers
        .register_fn("record", move |input: Value, ctx| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(ctx.task_id.clone());
                Ok(input)
            }
        })
        .unwrap();
    handlers
        .register_fn("sleep", |input: Value, _ctx| async move {
            let ms = input["ms"].as_u64().unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!("woke"))
        })
        .unwrap();
    handlers
        .register_fn("fail", |_input, _ctx| async move {
            Err(anyhow::anyhow!("boom"))
        })
        .unwrap();
    (handlers, log)
}

fn start(scheduler: TaskScheduler) -> (Arc<TaskScheduler>, JoinHandle<()>) {
    let scheduler = Arc::new(scheduler);
    let handle = scheduler.spawn();
    (scheduler, handle)
}

#[tokio::test]
async fn test_tasks_run_in_scheduled_time_order() {
    let (handlers, log) = recording_handlers();
    let (scheduler, handle) = start(TaskScheduler::new(fast_config(), handlers).unwrap());

    let now = Utc::now();
    for (id, offset_ms) in [("t3", 300), ("t1", 100), ("t2", 200)] {
        scheduler
            .schedule_task(
                id,
                TaskData::new("record", json!(null)),
                now + chrono::Duration::milliseconds(offset_ms),
                0,
                false,
                None,
            )
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(*log.lock(), vec!["t1", "t2", "t3"]);
    assert_eq!(scheduler.pending_count(), 0);
    handle.abort();
}

#[tokio::test]
async fn test_cancelled_task_never_runs() {
    let (handlers, log) = recording_handlers();
    let (scheduler, handle) = start(TaskScheduler::new(fast_config(), handlers).unwrap());

    scheduler
        .schedule_task(
            "later",
            TaskData::new("record", json!(null)),
            Utc::now() + chrono::Duration::milliseconds(200),
            0,
            false,
            None,
        )
        .unwrap();
    assert!(scheduler.cancel_task("later"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(log.lock().is_empty());
    assert_eq!(scheduler.get_task_result("later"), Some(TaskOutcome::Cancelled));
    handle.abort();
}

#[tokio::test]
async fn test_cancel_unknown_task_returns_false() {
    let (handlers, _log) = recording_handlers();
    let scheduler = TaskScheduler::new(fast_config(), handlers).unwrap();
    assert!(!scheduler.cancel_task("ghost"));
}

#[tokio::test]
async fn test_cancel_running_task() {
    let (handlers, _log) = recording_handlers();
    let (scheduler, handle) = start(TaskScheduler::new(fast_config(), handlers).unwrap());

    scheduler
        .schedule_task(
            "nap",
            TaskData::new("sleep", json!({"ms": 5000})),
            Utc::now(),
            0,
            false,
            None,
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.running_count(), 1);

    assert!(scheduler.cancel_task("nap"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.running_count(), 0);
    assert_eq!(scheduler.get_task_result("nap"), Some(TaskOutcome::Cancelled));
    handle.abort();
}

#[tokio::test]
async fn test_recurring_task_is_requeued_on_cadence() {
    let (handlers, log) = recording_handlers();
    let (scheduler, handle) = start(TaskScheduler::new(fast_config(), handlers).unwrap());

    let t0 = Utc::now();
    let interval = Duration::from_secs(60);
    scheduler
        .schedule_task(
            "heartbeat",
            TaskData::new("record", json!(null)),
            t0,
            0,
            true,
            Some(interval),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*log.lock(), vec!["heartbeat"]);

    let queued = scheduler.get_scheduled_tasks();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].task_id, "heartbeat");
    assert_eq!(queued[0].task_data, TaskData::new("record", json!(null)));
    assert_eq!(
        queued[0].scheduled_time,
        t0 + chrono::Duration::from_std(interval).unwrap()
    );
    handle.abort();
}

#[tokio::test]
async fn test_recurring_without_interval_is_rejected() {
    let (handlers, _log) = recording_handlers();
    let scheduler = TaskScheduler::new(fast_config(), handlers).unwrap();
    let result = scheduler.schedule_task(
        "bad",
        TaskData::new("record", json!(null)),
        Utc::now(),
        0,
        true,
        None,
    );
    assert!(result.is_err());
    assert_eq!(scheduler.pending_count(), 0);
}

#[tokio::test]
async fn test_unknown_task_type_fails() {
    let (handlers, _log) = recording_handlers();
    let (scheduler, handle) = start(TaskScheduler::new(fast_config(), handlers).unwrap());

    let outcome = scheduler
        .submit_and_wait("mystery", TaskData::new("does_not_exist", json!({})), 0)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Failed("Unknown task type: does_not_exist".to_string())
    );
    handle.abort();
}

#[tokio::test]
async fn test_handler_error_is_recorded() {
    let (handlers, _log) = recording_handlers();
    let (scheduler, handle) = start(TaskScheduler::new(fast_config(), handlers).unwrap());

    let outcome = scheduler
        .submit_and_wait("broken", TaskData::new("fail", json!({})), 0)
        .await
        .unwrap();
    assert!(!outcome.is_success());
    assert_eq!(scheduler.get_task_result("broken"), Some(outcome));
    handle.abort();
}

#[tokio::test]
async fn test_task_timeout_fails_the_task() {
    let (handlers, _log) = recording_handlers();
    let config = SchedulerConfig {
        task_timeout: Some(Duration::from_millis(100)),
        ..fast_config()
    };
    let (scheduler, handle) = start(TaskScheduler::new(config, handlers).unwrap());

    let outcome = scheduler
        .submit_and_wait("slow", TaskData::new("sleep", json!({"ms": 2000})), 0)
        .await
        .unwrap();
    match outcome {
        TaskOutcome::Failed(message) => assert!(message.contains("timed out"), "{}", message),
        other => panic!("expected a timeout failure, got {:?}", other),
    }
    handle.abort();
}

#[tokio::test]
async fn test_cache_key_memoizes_results() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = HandlerRegistry::new();
    let counter = Arc::clone(&calls);
    handlers
        .register_fn("expensive", move |input: Value, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"doubled": input["n"].as_i64().unwrap_or(0) * 2}))
            }
        })
        .unwrap();
    let cache = Arc::new(CacheManager::new(CacheConfig::default()).unwrap());
    let (scheduler, handle) = start(
        TaskScheduler::new(fast_config(), handlers)
            .unwrap()
            .with_cache(Arc::clone(&cache)),
    );

    let data = TaskData::new("expensive", json!({"n": 21})).with_cache_key("double:21", None);
    let first = scheduler.submit_and_wait("d1", data.clone(), 0).await.unwrap();
    let second = scheduler.submit_and_wait("d2", data, 0).await.unwrap();

    assert_eq!(first, TaskOutcome::Completed(json!({"doubled": 42})));
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get_stats().hits, 1);
    handle.abort();
}

#[tokio::test]
async fn test_schema_rejects_bad_input() {
    let handlers = HandlerRegistry::new();
    handlers
        .register(Arc::new(NeedsName))
        .unwrap();
    let (scheduler, handle) = start(TaskScheduler::new(fast_config(), handlers).unwrap());

    let ok = scheduler
        .submit_and_wait("good", TaskData::new("greet", json!({"name": "ada"})), 0)
        .await
        .unwrap();
    assert_eq!(ok, TaskOutcome::Completed(json!("hello ada")));

    let bad = scheduler
        .submit_and_wait("bad", TaskData::new("greet", json!({})), 0)
        .await
        .unwrap();
    assert!(matches!(bad, TaskOutcome::Failed(ref m) if m.starts_with("Invalid input")));
    handle.abort();
}

struct NeedsName;

#[async_trait::async_trait]
impl maestro::TaskHandler for NeedsName {
    fn name(&self) -> String {
        "greet".to_string()
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["name"],
            "properties": {"name": {"type": "string"}}
        }))
    }

    async fn execute(&self, input: Value, _ctx: &maestro::HandlerContext) -> anyhow::Result<Value> {
        Ok(json!(format!("hello {}", input["name"].as_str().unwrap_or_default())))
    }
}
