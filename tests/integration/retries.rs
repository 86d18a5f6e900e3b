//! Retry behavior through the public testing API.

use stagehand::testing::{ScriptedRunner, Step, TestHarness};
use stagehand::{
    Executor, GraphBuilder, QualityCheck, RetryPolicy, RunConfig, Task, TaskId, TaskState,
};
use std::time::Duration;

fn id(s: &str) -> TaskId {
    TaskId::new(s)
}

fn delayed(delay: Duration) -> RunConfig {
    RunConfig::default().with_retry(RetryPolicy::fixed(3, delay))
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_for_delay_between_attempts() {
    let graph = GraphBuilder::new("retry")
        .task(Task::marker("stage"))
        .build()
        .unwrap();
    let harness = TestHarness::new()
        .with_config(delayed(Duration::from_secs(300)))
        .with_runner(
            ScriptedRunner::new().script("stage", [Step::transient("a"), Step::transient("b")]),
        );
    let started = tokio::time::Instant::now();

    let ctx = harness.execute_and_assert_success(graph).await;

    assert_eq!(ctx.attempts(&id("stage")), 3);
    assert!(started.elapsed() >= Duration::from_secs(600));
    assert!(started.elapsed() < Duration::from_secs(900));
}

#[tokio::test(start_paused = true)]
async fn test_waiting_retry_does_not_block_siblings() {
    let graph = GraphBuilder::new("siblings")
        .task(Task::marker("flaky"))
        .task(Task::marker("steady"))
        .task(Task::marker("after_steady"))
        .edge("steady", "after_steady")
        .build()
        .unwrap();
    let harness = TestHarness::new()
        .with_config(delayed(Duration::from_secs(300)))
        .with_runner(
            ScriptedRunner::new()
                .script("flaky", [Step::transient("throttled")])
                .with_latency("steady", Duration::from_secs(10)),
        );

    harness.execute_and_assert_success(graph).await;

    let started = harness.runner().started();
    let position = |task: &str| started.iter().rposition(|t| t.as_str() == task).unwrap();
    // The downstream of the steady branch ran while flaky waited.
    assert!(position("after_steady") < position("flaky"));
    assert_eq!(harness.runner().call_count(&id("flaky")), 2);
}

#[tokio::test]
async fn test_task_policy_overrides_run_policy() {
    let graph = GraphBuilder::new("override")
        .task(Task::marker("patient").with_retry(RetryPolicy::fixed(5, Duration::ZERO)))
        .task(Task::marker("impatient").with_retry(RetryPolicy::none()))
        .build()
        .unwrap();
    let failing = || (0..5).map(|i| Step::transient(format!("attempt {i}")));
    let harness = TestHarness::new().with_runner(
        ScriptedRunner::new()
            .script("patient", failing())
            .script("impatient", failing()),
    );

    let ctx = harness.execute_and_assert_failure(graph).await;

    assert_eq!(ctx.attempts(&id("patient")), 5);
    assert_eq!(ctx.attempts(&id("impatient")), 1);
    assert_eq!(
        ctx.failure(&id("patient")).unwrap().message,
        "transient error: attempt 4"
    );
}

#[tokio::test]
async fn test_quality_violation_is_final() {
    let graph = GraphBuilder::new("gate")
        .task(Task::load_fact("load", "SELECT 1", "facts"))
        .task(Task::quality_check("check", vec![QualityCheck::has_rows("facts")]))
        .task(Task::marker("publish"))
        .chain(&["load", "check", "publish"])
        .build()
        .unwrap();
    let harness = TestHarness::new().with_runner(
        ScriptedRunner::new().script("check", [Step::violation("SELECT COUNT(*) FROM facts")]),
    );

    let ctx = harness.execute_and_assert_failure(graph).await;

    assert_eq!(ctx.attempts(&id("check")), 1);
    assert_eq!(ctx.failure(&id("check")).unwrap().reason, "quality_violation");
    assert_eq!(ctx.state(&id("publish")), Some(TaskState::Skipped));
}

#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let graph = GraphBuilder::new("fatal")
        .task(Task::marker("a"))
        .build()
        .unwrap();
    let harness = TestHarness::new()
        .with_runner(ScriptedRunner::new().script("a", [Step::fatal("bad credentials")]));

    let ctx = harness.execute_and_assert_failure(graph).await;

    assert_eq!(ctx.attempts(&id("a")), 1);
    assert_eq!(ctx.failure(&id("a")).unwrap().reason, "fatal");
}

#[tokio::test]
async fn test_run_with_policy_replaces_configured_default() {
    let graph = GraphBuilder::new("policy")
        .task(Task::marker("a"))
        .build()
        .unwrap();
    let runner = ScriptedRunner::new()
        .script("a", [Step::transient("x"), Step::transient("y")])
        .into_arc();
    let executor = Executor::new(delayed(Duration::ZERO), runner.clone());

    let ctx = executor
        .run_with_policy(graph, &RetryPolicy::none())
        .await
        .unwrap();

    assert_eq!(ctx.state(&id("a")), Some(TaskState::Failed));
    assert_eq!(runner.call_count(&id("a")), 1);
}
