//! Pipeline files, from YAML to a finished run.

use crate::common::{TABLES, pipeline_path};
use stagehand::{
    Executor, InMemoryWarehouse, LocalStorageReader, PipelineBuilder, RetryPolicy, RunStatus,
    TaskId, TaskKind, TaskState, WarehousePool, WarehouseRunner, load_pipelines_from_directory,
};
use std::sync::Arc;
use std::time::Duration;

fn id(s: &str) -> TaskId {
    TaskId::new(s)
}

#[test]
fn test_sparkify_pipeline_structure() {
    let pipeline = PipelineBuilder::load(pipeline_path()).unwrap();
    let graph = &pipeline.graph;

    assert_eq!(graph.id().as_str(), "sparkify_etl_dag");
    assert_eq!(graph.len(), 16);
    assert_eq!(graph.roots(), vec![&id("Begin_execution")]);
    assert_eq!(graph.upstream(&id("Stop_execution")).len(), 4);
    assert_eq!(graph.downstream(&id("Begin_execution")).len(), 2);
    let mut fact_inputs: Vec<&str> = graph
        .upstream(&id("Load_songplays_fact_table"))
        .iter()
        .map(TaskId::as_str)
        .collect();
    fact_inputs.sort();
    assert_eq!(
        fact_inputs,
        vec![
            "quality_check_staging_events_table",
            "quality_check_staging_songs_table"
        ]
    );

    let waves = graph.waves();
    assert_eq!(waves.first().unwrap(), &vec![id("Begin_execution")]);
    assert_eq!(waves.last().unwrap(), &vec![id("Stop_execution")]);

    let quality_gates = graph
        .tasks()
        .filter(|t| t.kind() == TaskKind::QualityCheck)
        .count();
    assert_eq!(quality_gates, 7);

    let run = pipeline.run_config;
    assert_eq!(run.owner, "kene");
    assert_eq!(run.retry, RetryPolicy::fixed(3, Duration::from_secs(300)));
    assert_eq!(run.max_concurrency, 4);
}

#[test]
fn test_every_load_targets_a_known_table() {
    let pipeline = PipelineBuilder::load(pipeline_path()).unwrap();

    for task in pipeline.graph.tasks() {
        let target = match &task.params {
            stagehand::TaskParams::Stage(p) => &p.target,
            stagehand::TaskParams::LoadFact(p) => &p.target,
            stagehand::TaskParams::LoadDimension(p) => &p.target,
            _ => continue,
        };
        assert!(TABLES.contains(&target.as_str()), "{target}");
    }
}

#[test]
fn test_pipelines_directory_loads() {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("pipelines");

    let pipelines = load_pipelines_from_directory(dir).unwrap();

    assert!(
        pipelines
            .iter()
            .any(|p| p.graph.id().as_str() == "sparkify_etl_dag")
    );
}

#[tokio::test]
async fn test_partitioned_stage_reads_local_directory() {
    let root = tempfile::tempdir().unwrap();
    let november = root.path().join("logs/log_data/2018/11");
    let december = root.path().join("logs/log_data/2018/12");
    std::fs::create_dir_all(&november).unwrap();
    std::fs::create_dir_all(&december).unwrap();
    std::fs::write(
        november.join("2018-11-01-events.json"),
        "{\"userId\": \"8\", \"page\": \"NextSong\"}\n\n{\"userId\": \"15\", \"page\": \"Home\"}\n",
    )
    .unwrap();
    std::fs::write(
        december.join("2018-12-01-events.json"),
        "{\"userId\": \"99\", \"page\": \"NextSong\"}\n",
    )
    .unwrap();

    let pipeline = PipelineBuilder::build(
        stagehand::YamlLoader::parse_pipeline(
            r#"
id: local_stage
defaults:
  start_date: 2018-11-01
  retries: 1
tasks:
  - id: stage
    type: stage
    source:
      bucket: logs
      key: log_data
      partition_template: "{year}/{month}"
    target: staging_events
  - id: check
    type: quality_check
    table: staging_events
    depends_on: [stage]
"#,
        )
        .unwrap(),
    )
    .unwrap();

    let warehouse = Arc::new(InMemoryWarehouse::new().with_table("staging_events"));
    let runner = WarehouseRunner::new(
        &pipeline.run_config,
        WarehousePool::new(warehouse.clone(), 1),
        Arc::new(LocalStorageReader::new(root.path())),
    );
    let executor = Executor::new(pipeline.run_config.clone(), Arc::new(runner));

    let ctx = executor.run(pipeline.graph).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Succeeded, "{:?}", ctx.summary());
    assert_eq!(ctx.state(&id("check")), Some(TaskState::Succeeded));
    let rows = warehouse.rows("staging_events").unwrap();
    let users: Vec<&str> = rows.iter().filter_map(|r| r["userid"].as_str()).collect();
    assert_eq!(users, vec!["8", "15"]);
}
