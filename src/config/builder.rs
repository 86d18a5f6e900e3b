//! Pipeline builder from YAML configuration.
//!
//! Converts a [`PipelineConfig`] into a validated [`Graph`] and the
//! [`RunConfig`] its defaults describe.

use std::path::Path;
use std::time::Duration;

use crate::core::check::QualityCheck;
use crate::core::graph::Graph;
use crate::core::retry::RetryPolicy;
use crate::core::task::{Task, TaskParams};
use crate::execution::RunConfig;

use super::error::ConfigError;
use super::types::{DefaultsConfig, PipelineConfig, RetryConfig, TaskConfig, TaskKindConfig};
use super::yaml::YamlLoader;

/// A pipeline ready to hand to an executor.
#[derive(Debug)]
pub struct Pipeline {
    pub graph: Graph,
    pub run_config: RunConfig,
    pub description: Option<String>,
}

/// Builder for creating pipelines from YAML configuration.
pub struct PipelineBuilder;

impl PipelineBuilder {
    /// Build a pipeline from a parsed configuration.
    pub fn build(config: PipelineConfig) -> Result<Pipeline, ConfigError> {
        let tasks: Vec<Task> = config.tasks.iter().map(Self::build_task).collect();
        let edges: Vec<(&str, &str)> = config
            .tasks
            .iter()
            .flat_map(|task| {
                task.depends_on
                    .iter()
                    .map(move |dep| (dep.as_str(), task.id.as_str()))
            })
            .collect();

        let graph = Graph::build(config.id.as_str(), tasks, edges)?;
        let run_config = Self::build_run_config(&config.defaults);

        Ok(Pipeline {
            graph,
            run_config,
            description: config.description,
        })
    }

    /// Parse, validate and build a pipeline file.
    pub fn load(path: impl AsRef<Path>) -> Result<Pipeline, ConfigError> {
        Self::build(YamlLoader::load_pipeline(path)?)
    }

    fn build_task(config: &TaskConfig) -> Task {
        let params = match &config.kind {
            TaskKindConfig::Stage(params) => TaskParams::Stage(params.clone()),
            TaskKindConfig::LoadFact(params) => TaskParams::LoadFact(params.clone()),
            TaskKindConfig::LoadDimension(params) => TaskParams::LoadDimension(params.clone()),
            TaskKindConfig::QualityCheck { checks, table } => {
                let checks = table
                    .iter()
                    .map(|table| QualityCheck::has_rows(table.as_str()))
                    .chain(checks.iter().cloned())
                    .collect();
                TaskParams::QualityCheck { checks }
            }
            TaskKindConfig::Marker => TaskParams::Marker,
        };

        let mut task = Task::new(config.id.as_str(), params);
        if let Some(retry) = &config.retry {
            task = task.with_retry(Self::build_retry_policy(retry));
        }
        if let Some(description) = &config.description {
            task = task.with_description(description.as_str());
        }
        task
    }

    fn build_retry_policy(config: &RetryConfig) -> RetryPolicy {
        RetryPolicy::fixed(config.max_attempts, Duration::from_secs(config.delay_secs))
    }

    fn build_run_config(defaults: &DefaultsConfig) -> RunConfig {
        let mut run = match defaults.start_date {
            Some(date) => RunConfig::new(date),
            None => RunConfig::default(),
        };

        let base = RetryPolicy::default();
        run = run.with_retry(RetryPolicy::fixed(
            defaults.retries.unwrap_or(base.max_attempts),
            defaults
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(base.delay),
        ));

        if let Some(owner) = &defaults.owner {
            run = run.with_owner(owner.as_str());
        }
        if let Some(max) = defaults.max_concurrency {
            run = run.with_max_concurrency(max);
        }
        if let Some(size) = defaults.batch_size {
            run = run.with_batch_size(size);
        }
        run
    }
}

/// Load every pipeline definition (`.yaml` / `.yml`) in a directory,
/// sorted by file name.
pub fn load_pipelines_from_directory(dir: impl AsRef<Path>) -> Result<Vec<Pipeline>, ConfigError> {
    let dir = dir.as_ref();

    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let read_dir_err = |source| ConfigError::DirReadError {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_dir_err)? {
        let path = entry.map_err(read_dir_err)?.path();
        if let Some(ext) = path.extension()
            && (ext == "yaml" || ext == "yml")
        {
            paths.push(path);
        }
    }
    paths.sort();

    paths.iter().map(PipelineBuilder::load).collect()
}
