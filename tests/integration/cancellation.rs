//! Aborting a run in progress.

use stagehand::testing::{ScriptedRunner, Step};
use stagehand::{Executor, GraphBuilder, RetryPolicy, RunConfig, RunStatus, Task, TaskId, TaskState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn id(s: &str) -> TaskId {
    TaskId::new(s)
}

fn config() -> RunConfig {
    RunConfig::default().with_retry(RetryPolicy::fixed(3, Duration::from_secs(300)))
}

#[tokio::test(start_paused = true)]
async fn test_abort_lets_in_flight_attempts_finish() {
    let graph = GraphBuilder::new("abort")
        .task(Task::marker("begin"))
        .task(Task::marker("stage_events"))
        .task(Task::marker("stage_songs"))
        .task(Task::marker("load"))
        .fan_out("begin", &["stage_events", "stage_songs"])
        .fan_in(&["stage_events", "stage_songs"], "load")
        .build()
        .unwrap();
    let runner = ScriptedRunner::new()
        .with_latency("stage_events", Duration::from_secs(30))
        .with_latency("stage_songs", Duration::from_secs(60))
        .into_arc();
    let executor = Arc::new(Executor::new(config(), runner.clone()));
    let token = CancellationToken::new();

    let handle = tokio::spawn({
        let executor = Arc::clone(&executor);
        let token = token.clone();
        async move { executor.run_until(graph, token).await }
    });
    tokio::time::sleep(Duration::from_secs(10)).await;
    token.cancel();
    let ctx = handle.await.unwrap().unwrap();

    assert!(ctx.is_aborted());
    assert_eq!(ctx.status(), RunStatus::Failed);
    assert_eq!(ctx.state(&id("stage_events")), Some(TaskState::Succeeded));
    assert_eq!(ctx.state(&id("stage_songs")), Some(TaskState::Succeeded));
    assert_eq!(ctx.state(&id("load")), Some(TaskState::Pending));
    assert_eq!(runner.call_count(&id("load")), 0);
    assert!(ctx.summary().aborted);
}

#[tokio::test(start_paused = true)]
async fn test_abort_abandons_waiting_retry() {
    let graph = GraphBuilder::new("abort_retry")
        .task(Task::marker("flaky"))
        .task(Task::marker("after"))
        .edge("flaky", "after")
        .build()
        .unwrap();
    let runner = ScriptedRunner::new()
        .script("flaky", [Step::transient("throttled")])
        .into_arc();
    let executor = Executor::new(config(), runner.clone());
    let token = CancellationToken::new();

    let cancel = {
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            token.cancel();
        }
    };
    let (ctx, ()) = tokio::join!(executor.run_until(graph, token), cancel);
    let ctx = ctx.unwrap();

    assert!(ctx.is_aborted());
    assert_eq!(ctx.state(&id("flaky")), Some(TaskState::Failed));
    assert_eq!(ctx.attempts(&id("flaky")), 1);
    assert_eq!(ctx.failure(&id("flaky")).unwrap().reason, "transient");
    assert_eq!(ctx.state(&id("after")), Some(TaskState::Pending));
    assert!(ctx.tasks_in(TaskState::Skipped).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_after_abort_leaves_downstream_pending() {
    let graph = GraphBuilder::new("abort_failure")
        .task(Task::marker("load"))
        .task(Task::marker("check"))
        .task(Task::marker("publish"))
        .chain(&["load", "check", "publish"])
        .build()
        .unwrap();
    let runner = ScriptedRunner::new()
        .script("load", [Step::fatal("relation dropped")])
        .with_latency("load", Duration::from_secs(30))
        .into_arc();
    let executor = Executor::new(config(), runner.clone());
    let token = CancellationToken::new();

    let cancel = {
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        }
    };
    let (ctx, ()) = tokio::join!(executor.run_until(graph, token), cancel);
    let ctx = ctx.unwrap();

    assert!(ctx.is_aborted());
    assert_eq!(ctx.state(&id("load")), Some(TaskState::Failed));
    assert_eq!(ctx.failure(&id("load")).unwrap().reason, "fatal");
    // An aborted run stops deciding about undispatched tasks, skips included.
    assert_eq!(ctx.state(&id("check")), Some(TaskState::Pending));
    assert_eq!(ctx.state(&id("publish")), Some(TaskState::Pending));
    assert!(ctx.tasks_in(TaskState::Skipped).is_empty());
}

#[tokio::test]
async fn test_cancel_after_completion_has_no_effect() {
    let graph = GraphBuilder::new("done")
        .task(Task::marker("a"))
        .build()
        .unwrap();
    let executor = Executor::new(config(), ScriptedRunner::new().into_arc());
    let token = CancellationToken::new();

    let ctx = executor.run_until(graph, token.clone()).await.unwrap();
    token.cancel();

    assert_eq!(ctx.status(), RunStatus::Succeeded);
    assert!(!ctx.is_aborted());
}
