//! stagehand - quality-gated pipeline executor.
//!
//! Usage:
//!   stagehand validate <PATH>   Validate a pipeline file or a directory of them
//!   stagehand plan <FILE>       Print the execution plan of a pipeline
//!   stagehand list <DIR>        List the pipelines in a directory

use clap::{Parser, Subcommand};
use stagehand::{Pipeline, PipelineBuilder, TaskParams, load_pipelines_from_directory};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// stagehand - quality-gated pipeline executor
#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level filter, used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline file, or every pipeline in a directory
    Validate {
        /// Pipeline YAML file or directory of them
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Print the execution waves, task kinds and dependencies of a pipeline
    Plan {
        /// Pipeline YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// List all pipelines in a directory
    List {
        /// Directory containing pipeline YAML files
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { path } => validate(&path),
        Commands::Plan { file } => plan(&file),
        Commands::List { dir } => list(&dir),
    }
}

/// Validate one file or a directory of pipeline files.
fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating {}", path.display());

    let result = if path.is_dir() {
        load_pipelines_from_directory(path)
    } else {
        PipelineBuilder::load(path).map(|p| vec![p])
    };

    match result {
        Ok(pipelines) => {
            if pipelines.is_empty() {
                warn!("No pipeline files found in {}", path.display());
            }
            for pipeline in &pipelines {
                info!(
                    "  - {} ({} task(s)): OK",
                    pipeline.graph.id(),
                    pipeline.graph.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Print the waves a run would dispatch, in order.
fn plan(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = PipelineBuilder::load(file)?;
    let graph = &pipeline.graph;
    let run = &pipeline.run_config;

    println!("Pipeline: {}", graph.id());
    if let Some(description) = &pipeline.description {
        println!("  {}", description);
    }
    println!();
    println!("Run configuration:");
    println!("  Owner: {}", run.owner);
    println!("  Execution date: {}", run.execution_date);
    println!(
        "  Retries: {} attempt(s), {}s apart",
        run.retry.max_attempts,
        run.retry.delay.as_secs()
    );
    println!("  Max concurrency: {}", run.max_concurrency);
    println!("  Batch size: {}", run.batch_size);
    println!();

    for (n, wave) in graph.waves().iter().enumerate() {
        println!("Wave {}:", n + 1);
        for task_id in wave {
            let Some(task) = graph.get(task_id) else {
                continue;
            };
            let deps: Vec<&str> = graph.upstream(task_id).iter().map(|d| d.as_str()).collect();
            let mut line = format!("  - {} [{}]", task_id, task.kind());
            if let Some(detail) = describe(&task.params, run) {
                line.push_str(&format!(" {}", detail));
            }
            if !deps.is_empty() {
                line.push_str(&format!(" (depends on: {})", deps.join(", ")));
            }
            println!("{}", line);
        }
    }

    Ok(())
}

/// One-line summary of what a task touches.
fn describe(params: &TaskParams, run: &stagehand::RunConfig) -> Option<String> {
    match params {
        TaskParams::Stage(stage) => Some(format!(
            "{}/{} -> {}",
            stage.source.bucket,
            stage.source.resolve_key(run.execution_date),
            stage.target
        )),
        TaskParams::LoadFact(load) => Some(format!("-> {}", load.target)),
        TaskParams::LoadDimension(dim) => Some(format!("-> {}", dim.target)),
        TaskParams::QualityCheck { checks } => Some(format!("{} check(s)", checks.len())),
        TaskParams::Marker => None,
    }
}

/// List all pipelines in a directory.
fn list(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let pipelines = load_pipelines_from_directory(dir)?;

    if pipelines.is_empty() {
        println!("No pipelines found in {}", dir.display());
        return Ok(());
    }

    println!("Pipelines in {}:", dir.display());
    println!();
    for Pipeline {
        graph,
        run_config,
        description,
    } in &pipelines
    {
        println!("ID: {}", graph.id());
        if let Some(description) = description {
            println!("  Description: {}", description);
        }
        println!("  Owner: {}", run_config.owner);
        println!("  Tasks: {}", graph.len());
        println!("  Roots: {}", join(graph.roots()));
        println!();
    }

    Ok(())
}

fn join(ids: Vec<&stagehand::TaskId>) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}
