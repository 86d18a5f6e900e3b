//! End-to-end runs of the warehouse refresh pipeline.

use crate::common::{Sparkify, row};
use serde_json::{Value, json};
use stagehand::testing::RecordingHandler;
use stagehand::warehouse::WarehouseError;
use stagehand::{Event, EventBus, RunStatus, TaskId, TaskState};
use std::sync::Arc;
use std::time::Duration;

fn id(s: &str) -> TaskId {
    TaskId::new(s)
}

const SONGS_BRANCH: [&str; 9] = [
    "quality_check_staging_songs_table",
    "Load_songplays_fact_table",
    "quality_check_songplays_table",
    "Load_song_dim_table",
    "quality_check_songs_table",
    "Load_artist_dim_table",
    "quality_check_artists_table",
    "Load_time_dim_table",
    "quality_check_time_table",
];

#[tokio::test]
async fn test_full_refresh_succeeds() {
    let sparkify = Sparkify::new();

    let ctx = sparkify.executor().run(sparkify.graph.clone()).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Succeeded, "{:?}", ctx.summary());
    assert_eq!(ctx.tasks_in(TaskState::Succeeded).len(), 16);
    assert_eq!(sparkify.row_count("staging_events"), 4);
    assert_eq!(sparkify.row_count("staging_songs"), 2);
    assert_eq!(sparkify.row_count("songplays"), 3);
    assert_eq!(sparkify.row_count("users"), 2);
    assert_eq!(sparkify.row_count("songs"), 2);
    assert_eq!(sparkify.row_count("artists"), 2);
    assert_eq!(sparkify.row_count("time"), 3);

    let staged = ctx.record(&id("Stage_events")).unwrap();
    assert_eq!(staged.output.unwrap().rows, 4);
    assert_eq!(staged.attempt_count, 1);
}

#[tokio::test]
async fn test_staged_columns_follow_json_paths() {
    let sparkify = Sparkify::new();

    sparkify.executor().run(sparkify.graph.clone()).await.unwrap();

    let events = sparkify.warehouse.rows("staging_events").unwrap();
    let columns: Vec<&str> = events[0].keys().map(String::as_str).collect();
    assert!(columns.contains(&"userid"));
    assert!(columns.contains(&"sessionid"));
    assert!(columns.contains(&"iteminsession"));
    assert_eq!(events[0]["userid"], json!("8"));

    let songs = sparkify.warehouse.rows("staging_songs").unwrap();
    assert_eq!(songs[0]["song_id"], json!("SOBONKR12A58A7A7E0"));
}

#[tokio::test]
async fn test_rerun_keeps_staging_and_dimensions_stable() {
    let sparkify = Sparkify::new();
    let executor = sparkify.executor();

    let first = executor.run(sparkify.graph.clone()).await.unwrap();
    let second = executor.run(sparkify.graph.clone()).await.unwrap();

    assert_eq!(first.status(), RunStatus::Succeeded);
    assert_eq!(second.status(), RunStatus::Succeeded);
    assert_ne!(first.run_id(), second.run_id());

    assert_eq!(sparkify.row_count("staging_events"), 4);
    assert_eq!(sparkify.row_count("staging_songs"), 2);
    assert_eq!(sparkify.row_count("users"), 2);
    assert_eq!(sparkify.row_count("songs"), 2);
    assert_eq!(sparkify.row_count("artists"), 2);
    assert_eq!(sparkify.row_count("time"), 3);
    // The fact load appends.
    assert_eq!(sparkify.row_count("songplays"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_failed_songs_stage_skips_its_branch_only() {
    let sparkify = Sparkify::new();
    sparkify.warehouse.fail_next(
        "staging_songs",
        3,
        WarehouseError::Connection("connection reset by peer".into()),
    );

    let ctx = sparkify.executor().run(sparkify.graph.clone()).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Failed);
    assert_eq!(ctx.state(&id("Stage_songs")), Some(TaskState::Failed));
    assert_eq!(ctx.attempts(&id("Stage_songs")), 3);
    assert_eq!(
        ctx.failure(&id("Stage_songs")).unwrap().reason,
        "target_unavailable"
    );

    for task in SONGS_BRANCH {
        assert_eq!(ctx.state(&id(task)), Some(TaskState::Skipped), "{task}");
        assert_eq!(ctx.attempts(&id(task)), 0, "{task}");
    }
    assert_eq!(ctx.state(&id("Stop_execution")), Some(TaskState::Skipped));

    // The events branch does not depend on songs and completes.
    for task in [
        "Begin_execution",
        "Stage_events",
        "quality_check_staging_events_table",
        "Load_user_dim_table",
        "quality_check_users_table",
    ] {
        assert_eq!(ctx.state(&id(task)), Some(TaskState::Succeeded), "{task}");
    }
    assert_eq!(sparkify.row_count("users"), 2);
    assert_eq!(sparkify.row_count("songplays"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_stage_failure_recovers_after_delay() {
    let sparkify = Sparkify::new();
    sparkify.warehouse.fail_next(
        "staging_events",
        1,
        WarehouseError::Connection("connection reset by peer".into()),
    );
    let started = tokio::time::Instant::now();

    let ctx = sparkify.executor().run(sparkify.graph.clone()).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Succeeded);
    assert_eq!(ctx.attempts(&id("Stage_events")), 2);
    assert!(started.elapsed() >= Duration::from_secs(300));
    assert_eq!(sparkify.row_count("staging_events"), 4);
}

#[tokio::test]
async fn test_null_user_key_fails_gate_without_retry() {
    let sparkify = Sparkify::new();
    sparkify
        .warehouse
        .register_transform(&sparkify.load_sql("users"), |_| {
            Ok(vec![
                row(json!({"userid": "8", "first_name": "Kaylee"})),
                row(json!({"userid": Value::Null, "first_name": "Ghost"})),
            ])
        })
        .unwrap();

    let ctx = sparkify.executor().run(sparkify.graph.clone()).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Failed);
    let gate = id("quality_check_users_table");
    assert_eq!(ctx.state(&gate), Some(TaskState::Failed));
    assert_eq!(ctx.attempts(&gate), 1);
    assert_eq!(ctx.failure(&gate).unwrap().reason, "quality_violation");
    assert_eq!(ctx.state(&id("Stop_execution")), Some(TaskState::Skipped));
    // Independent gates still ran.
    assert_eq!(
        ctx.state(&id("quality_check_time_table")),
        Some(TaskState::Succeeded)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_source_keeps_previous_staging_rows() {
    let sparkify = Sparkify::new();
    sparkify
        .warehouse
        .insert_rows("staging_events", vec![row(json!({"userid": "1"}))])
        .unwrap();
    sparkify.storage.set_unreachable(true);

    let ctx = sparkify.executor().run(sparkify.graph.clone()).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Failed);
    for stage in ["Stage_events", "Stage_songs"] {
        assert_eq!(ctx.state(&id(stage)), Some(TaskState::Failed));
        assert_eq!(ctx.failure(&id(stage)).unwrap().reason, "source_unreachable");
    }
    assert_eq!(ctx.tasks_in(TaskState::Succeeded), vec![&id("Begin_execution")]);
    assert_eq!(sparkify.row_count("staging_events"), 1);
}

#[tokio::test]
async fn test_run_emits_lifecycle_events() {
    let sparkify = Sparkify::new();
    let handler = Arc::new(RecordingHandler::new());
    let bus = Arc::new(EventBus::new());
    bus.register(handler.clone()).await;

    let ctx = sparkify
        .executor()
        .with_event_bus(bus)
        .run(sparkify.graph.clone())
        .await
        .unwrap();

    let events = handler.events();
    assert!(matches!(
        events.first(),
        Some(Event::RunStarted { task_count: 16, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(Event::RunFinished { status: RunStatus::Succeeded, .. })
    ));
    let succeeded = events
        .iter()
        .filter(|e| matches!(e, Event::TaskSucceeded { .. }))
        .count();
    assert_eq!(succeeded, 16);
    assert!(events.iter().all(|e| e.run_id() == ctx.run_id()));
}
