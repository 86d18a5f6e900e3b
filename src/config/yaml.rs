//! YAML configuration parsing.
//!
//! Parses pipeline definitions from YAML files and checks everything that
//! can be checked without building the graph. Cycles are left to
//! [`Graph::build`](crate::core::graph::Graph::build), which reports the
//! actual cycle.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{PipelineConfig, TaskKindConfig};

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load a pipeline definition from a file.
    pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        let config: PipelineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_pipeline(&config)?;
        Ok(config)
    }

    /// Parse a pipeline definition from a YAML string.
    pub fn parse_pipeline(yaml: &str) -> Result<PipelineConfig, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        Self::validate_pipeline(&config)?;
        Ok(config)
    }

    /// Validate a pipeline definition.
    fn validate_pipeline(config: &PipelineConfig) -> Result<(), ConfigError> {
        if config.id.trim().is_empty() {
            return Err(ConfigError::MissingField("id".into()));
        }

        if config.tasks.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "pipeline must have at least one task".into(),
            ));
        }

        let defaults = &config.defaults;
        if defaults.max_concurrency == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_concurrency cannot be zero".into(),
            ));
        }
        if defaults.batch_size == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "batch_size cannot be zero".into(),
            ));
        }
        if defaults.retries == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "retries counts total attempts and cannot be zero".into(),
            ));
        }

        let mut task_ids: HashSet<&str> = HashSet::new();
        for task in &config.tasks {
            if task.id.trim().is_empty() {
                return Err(ConfigError::MissingField("tasks[].id".into()));
            }
            if !task_ids.insert(&task.id) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
        }

        for task in &config.tasks {
            if task.retry.is_some_and(|r| r.max_attempts == 0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "task '{}' retry.max_attempts cannot be zero",
                    task.id
                )));
            }

            if let TaskKindConfig::QualityCheck { checks, table } = &task.kind {
                if checks.is_empty() && table.is_none() {
                    return Err(ConfigError::InvalidConfig(format!(
                        "quality task '{}' needs `checks` or `table`",
                        task.id
                    )));
                }
            }

            let mut seen_deps = HashSet::new();
            for dep in &task.depends_on {
                if dep == &task.id {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' cannot depend on itself",
                        task.id
                    )));
                }
                if !task_ids.contains(dep.as_str()) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
                if !seen_deps.insert(dep) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' has duplicate dependency '{}'",
                        task.id, dep
                    )));
                }
            }
        }

        Ok(())
    }
}
