//! Workflow manager: sequential execution, pause/resume, failure handling,
//! nesting and history

use chrono::Utc;
use maestro::{
    HandlerRegistry, Maestro, MaestroConfig, MaestroError, SchedulerConfig, SledStore, Step,
    TaskData, WorkflowOptions, WorkflowStatus,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> MaestroConfig {
    MaestroConfig {
        scheduler: SchedulerConfig {
            tick: Duration::from_millis(10),
            ..SchedulerConfig::default()
        },
        ..MaestroConfig::default()
    }
}

/// `record` logs its `tag` input, `sleep` waits `ms` then logs, `fail` always
/// errors, `slow_fail` waits `ms`, logs and errors
fn handlers() -> (HandlerRegistry, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handlers = HandlerRegistry::new();
    let sink = Arc::clone(&log);
    handlers
        .register_fn("record", move |input: Value, _ctx| {
            let sink = Arc::clone(&sink);
            async move {
                let tag = input["tag"].as_str().unwrap_or_default().to_string();
                sink.lock().push(tag.clone());
                Ok(json!({"tag": tag}))
            }
        })
        .unwrap();
    let sink = Arc::clone(&log);
    handlers
        .register_fn("sleep", move |input: Value, _ctx| {
            let sink = Arc::clone(&sink);
            async move {
                tokio::time::sleep(Duration::from_millis(input["ms"].as_u64().unwrap_or(0))).await;
                let tag = input["tag"].as_str().unwrap_or_default().to_string();
                sink.lock().push(tag.clone());
                Ok(json!({"tag": tag}))
            }
        })
        .unwrap();
    handlers
        .register_fn("fail", |_input, _ctx| async move {
            Err(anyhow::anyhow!("step exploded"))
        })
        .unwrap();
    let sink = Arc::clone(&log);
    handlers
        .register_fn("slow_fail", move |input: Value, _ctx| {
            let sink = Arc::clone(&sink);
            async move {
                tokio::time::sleep(Duration::from_millis(input["ms"].as_u64().unwrap_or(0))).await;
                sink.lock().push(input["tag"].as_str().unwrap_or_default().to_string());
                Err(anyhow::anyhow!("step exploded late"))
            }
        })
        .unwrap();
    (handlers, log)
}

fn record(id: &str) -> Step {
    Step::task(id, TaskData::new("record", json!({"tag": id})))
}

fn sleep(id: &str, ms: u64) -> Step {
    Step::task(id, TaskData::new("sleep", json!({"tag": id, "ms": ms})))
}

fn slow_fail(id: &str, ms: u64) -> Step {
    Step::task(id, TaskData::new("slow_fail", json!({"tag": id, "ms": ms})))
}

fn fail(id: &str) -> Step {
    Step::task(id, TaskData::new("fail", json!({})))
}

fn system() -> (Arc<Maestro>, Arc<Mutex<Vec<String>>>) {
    let (handlers, log) = handlers();
    let system = Maestro::builder()
        .with_config(fast_config())
        .with_handlers(handlers)
        .build()
        .unwrap();
    (system, log)
}

#[tokio::test]
async fn test_steps_run_in_order() {
    let (system, log) = system();
    let workflows = system.workflows();
    let id = workflows.create_workflow(
        "pipeline",
        vec![record("one"), record("two"), record("three")],
        WorkflowOptions::default(),
    );
    assert_eq!(workflows.get_workflow_status(&id), Some(WorkflowStatus::Pending));

    let status = workflows.start_workflow(&id).await.unwrap();

    assert_eq!(status, WorkflowStatus::Completed);
    assert_eq!(*log.lock(), vec!["one", "two", "three"]);
    let workflow = workflows.get_workflow(&id).unwrap();
    assert_eq!(workflow.current_task_index, 3);
    assert_eq!(
        workflow.results.keys().cloned().collect::<Vec<_>>(),
        vec!["one", "two", "three"]
    );
    assert!(workflow.start_time.is_some());
    assert!(workflow.end_time.is_some());
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_workflow_completes_immediately() {
    let (system, _log) = system();
    let workflows = system.workflows();
    let id = workflows.create_workflow("empty", vec![], WorkflowOptions::default());
    assert_eq!(
        workflows.start_workflow(&id).await.unwrap(),
        WorkflowStatus::Completed
    );
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (system, _log) = system();
    let workflows = system.workflows();
    let id = workflows.create_workflow("once", vec![record("a")], WorkflowOptions::default());
    workflows.start_workflow(&id).await.unwrap();

    let err = workflows.start_workflow(&id).await.unwrap_err();
    assert!(matches!(err, MaestroError::InvalidState { .. }));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_and_resume_do_not_repeat_steps() {
    let (system, log) = system();
    let workflows = Arc::clone(system.workflows());
    let id = workflows.create_workflow(
        "pausable",
        vec![record("first"), sleep("second", 300), record("third")],
        WorkflowOptions::default(),
    );

    let driver = {
        let workflows = Arc::clone(&workflows);
        let id = id.clone();
        tokio::spawn(async move { workflows.start_workflow(&id).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(workflows.pause_workflow(&id).unwrap());
    assert!(!workflows.pause_workflow(&id).unwrap());

    // the in-flight step finishes, the third one does not start
    let status = driver.await.unwrap().unwrap();
    assert_eq!(status, WorkflowStatus::Paused);
    let paused = workflows.get_workflow(&id).unwrap();
    assert_eq!(paused.current_task_index, 2);
    assert_eq!(*log.lock(), vec!["first", "second"]);

    assert!(workflows.resume_workflow(&id).await.unwrap());
    assert_eq!(
        workflows.get_workflow_status(&id),
        Some(WorkflowStatus::Completed)
    );
    assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    assert_eq!(workflows.get_workflow(&id).unwrap().results.len(), 3);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_step_failing_while_paused_fails_workflow() {
    let (system, log) = system();
    let workflows = Arc::clone(system.workflows());
    let id = workflows.create_workflow(
        "fragile",
        vec![slow_fail("flaky", 300), record("never")],
        WorkflowOptions::default(),
    );
    let driver = {
        let workflows = Arc::clone(&workflows);
        let id = id.clone();
        tokio::spawn(async move { workflows.start_workflow(&id).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(workflows.pause_workflow(&id).unwrap());

    assert_eq!(driver.await.unwrap().unwrap(), WorkflowStatus::Failed);
    let workflow = workflows.get_workflow(&id).unwrap();
    assert_eq!(workflow.errors.len(), 1);
    assert_eq!(workflow.errors[0].step_id, "flaky");
    assert_eq!(workflow.current_task_index, 0);
    assert!(workflow.end_time.is_some());

    // nothing left to resume, and the failed step is not run again
    assert!(!workflows.resume_workflow(&id).await.unwrap());
    assert_eq!(workflows.get_workflow_status(&id), Some(WorkflowStatus::Failed));
    assert_eq!(*log.lock(), vec!["flaky"]);
    assert_eq!(workflows.get_workflow(&id).unwrap().errors.len(), 1);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_step_failing_while_paused_with_continue_on_error() {
    let (system, log) = system();
    let workflows = Arc::clone(system.workflows());
    let id = workflows.create_workflow(
        "tolerant",
        vec![slow_fail("flaky", 300), record("next")],
        WorkflowOptions {
            continue_on_error: true,
            ..WorkflowOptions::default()
        },
    );
    let driver = {
        let workflows = Arc::clone(&workflows);
        let id = id.clone();
        tokio::spawn(async move { workflows.start_workflow(&id).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(workflows.pause_workflow(&id).unwrap());

    assert_eq!(driver.await.unwrap().unwrap(), WorkflowStatus::Paused);
    let paused = workflows.get_workflow(&id).unwrap();
    assert_eq!(paused.current_task_index, 1);
    assert_eq!(paused.errors.len(), 1);

    assert!(workflows.resume_workflow(&id).await.unwrap());
    let workflow = workflows.get_workflow(&id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(*log.lock(), vec!["flaky", "next"]);
    assert_eq!(workflow.errors.len(), 1);
    assert_eq!(workflow.results.keys().cloned().collect::<Vec<_>>(), vec!["next"]);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_requires_paused() {
    let (system, _log) = system();
    let workflows = system.workflows();
    let id = workflows.create_workflow("idle", vec![record("a")], WorkflowOptions::default());
    assert!(!workflows.resume_workflow(&id).await.unwrap());
    assert_eq!(workflows.get_workflow_status(&id), Some(WorkflowStatus::Pending));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failure_stops_workflow_by_default() {
    let (system, log) = system();
    let workflows = system.workflows();
    let id = workflows.create_workflow(
        "strict",
        vec![record("ok"), fail("broken"), record("never")],
        WorkflowOptions::default(),
    );

    let status = workflows.start_workflow(&id).await.unwrap();

    assert_eq!(status, WorkflowStatus::Failed);
    assert_eq!(*log.lock(), vec!["ok"]);
    let workflow = workflows.get_workflow(&id).unwrap();
    assert_eq!(workflow.results.len(), 1);
    assert_eq!(workflow.errors.len(), 1);
    assert_eq!(workflow.errors[0].step_id, "broken");
    assert!(workflow.errors[0].error.contains("step exploded"));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_continue_on_error_runs_remaining_steps() {
    let (system, log) = system();
    let workflows = system.workflows();
    let id = workflows.create_workflow(
        "lenient",
        vec![record("ok"), fail("broken"), record("after")],
        WorkflowOptions {
            continue_on_error: true,
            ..WorkflowOptions::default()
        },
    );

    let status = workflows.start_workflow(&id).await.unwrap();

    assert_eq!(status, WorkflowStatus::Completed);
    assert_eq!(*log.lock(), vec!["ok", "after"]);
    let workflow = workflows.get_workflow(&id).unwrap();
    assert_eq!(workflow.results.len(), 2);
    assert_eq!(workflow.errors.len(), 1);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_step_timeout_fails_step() {
    let (system, _log) = system();
    let workflows = system.workflows();
    let id = workflows.create_workflow(
        "impatient",
        vec![sleep("slow", 3000)],
        WorkflowOptions {
            step_timeout_secs: Some(1),
            ..WorkflowOptions::default()
        },
    );
    assert_eq!(
        workflows.start_workflow(&id).await.unwrap(),
        WorkflowStatus::Failed
    );
    let workflow = workflows.get_workflow(&id).unwrap();
    assert!(workflow.errors[0].error.contains("timed out"));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nested_workflow_results_become_step_result() {
    let (system, log) = system();
    let workflows = system.workflows();
    let id = workflows.create_workflow(
        "outer",
        vec![
            record("before"),
            Step::workflow(
                "inner",
                "inner workflow",
                vec![record("a"), record("b")],
                WorkflowOptions::default(),
            ),
            record("after"),
        ],
        WorkflowOptions::default(),
    );

    let status = workflows.start_workflow(&id).await.unwrap();

    assert_eq!(status, WorkflowStatus::Completed);
    assert_eq!(*log.lock(), vec!["before", "a", "b", "after"]);
    let workflow = workflows.get_workflow(&id).unwrap();
    assert_eq!(
        workflow.results["inner"],
        json!({"a": {"tag": "a"}, "b": {"tag": "b"}})
    );
    // the nested workflow is registered on its own
    assert_eq!(workflows.list_workflows().len(), 2);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_nested_workflow_fails_step() {
    let (system, _log) = system();
    let workflows = system.workflows();
    let id = workflows.create_workflow(
        "outer",
        vec![Step::workflow(
            "inner",
            "doomed",
            vec![fail("x")],
            WorkflowOptions::default(),
        )],
        WorkflowOptions::default(),
    );
    assert_eq!(
        workflows.start_workflow(&id).await.unwrap(),
        WorkflowStatus::Failed
    );
    let workflow = workflows.get_workflow(&id).unwrap();
    assert_eq!(workflow.errors[0].step_id, "inner");
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_marks_failed() {
    let (system, log) = system();
    let workflows = Arc::clone(system.workflows());
    let id = workflows.create_workflow(
        "cancellable",
        vec![sleep("long", 300), record("never")],
        WorkflowOptions::default(),
    );
    let driver = {
        let workflows = Arc::clone(&workflows);
        let id = id.clone();
        tokio::spawn(async move { workflows.start_workflow(&id).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    workflows.cancel_workflow(&id).unwrap();
    assert_eq!(workflows.get_workflow_status(&id), Some(WorkflowStatus::Failed));

    assert_eq!(driver.await.unwrap().unwrap(), WorkflowStatus::Failed);
    assert!(!log.lock().contains(&"never".to_string()));
    assert!(workflows.get_workflow(&id).unwrap().end_time.is_some());
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_for_completion() {
    let (system, _log) = system();
    let workflows = Arc::clone(system.workflows());
    let id = workflows.create_workflow("waited", vec![sleep("nap", 100)], WorkflowOptions::default());
    {
        let workflows = Arc::clone(&workflows);
        let id = id.clone();
        tokio::spawn(async move { workflows.start_workflow(&id).await });
    }
    let status = tokio::time::timeout(Duration::from_secs(5), workflows.wait_for_completion(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, WorkflowStatus::Completed);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_step_type_is_rejected() {
    let (system, _log) = system();
    let err = system
        .workflows()
        .create_workflow_from_values(
            "bad",
            vec![json!({"type": "teleport", "id": "x"})],
            WorkflowOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, MaestroError::UnknownStepType(kind) if kind == "teleport"));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_workflow_lookups() {
    let (system, _log) = system();
    let workflows = system.workflows();
    assert_eq!(workflows.get_workflow_status("missing"), None);
    assert!(matches!(
        workflows.pause_workflow("missing"),
        Err(MaestroError::NotFound { .. })
    ));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_terminal_workflows_are_saved_to_history() {
    let (handlers, _log) = handlers();
    let system = Maestro::builder()
        .with_config(fast_config())
        .with_handlers(handlers)
        .with_history_store(SledStore::temporary().unwrap())
        .build()
        .unwrap();
    let workflows = system.workflows();
    let id = workflows.create_workflow("archived", vec![record("a")], WorkflowOptions::default());
    workflows.start_workflow(&id).await.unwrap();

    let today = Utc::now().date_naive();
    let keys = workflows.list_history_keys().unwrap();
    assert_eq!(keys, vec![format!("{}_{}", id, today.format("%Y%m%d"))]);

    let saved = workflows.load_workflow_history(&id, today).unwrap().unwrap();
    assert_eq!(saved.status, WorkflowStatus::Completed);
    assert_eq!(saved.results["a"], json!({"tag": "a"}));
    system.shutdown().await.unwrap();
}
