//! Configuration loading and parsing.
//!
//! Pipelines are defined in YAML: run-wide `defaults` and a list of tasks,
//! each naming the tasks it depends on.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::{Pipeline, PipelineBuilder, load_pipelines_from_directory};
pub use error::ConfigError;
pub use types::{DefaultsConfig, PipelineConfig, RetryConfig, TaskConfig, TaskKindConfig};
pub use yaml::YamlLoader;
