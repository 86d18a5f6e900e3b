//! Configuration type definitions.
//!
//! These mirror the YAML pipeline file. Task bodies reuse the parameter
//! types from [`crate::core::task`] so a stage or load reads the same in
//! YAML as it serializes.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::core::check::QualityCheck;
use crate::core::task::{DimensionParams, LoadParams, StageParams};

/// A pipeline definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline identifier.
    pub id: String,
    /// Optional description.
    pub description: Option<String>,
    /// Run-wide defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Task definitions, in declaration order.
    pub tasks: Vec<TaskConfig>,
}

/// Defaults applied to every run of the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Pipeline owner, carried into logs.
    pub owner: Option<String>,
    /// Total attempts per task, the first one included.
    pub retries: Option<u32>,
    /// Delay between attempts in seconds.
    pub retry_delay_secs: Option<u64>,
    /// Execution date used to render partition templates.
    pub start_date: Option<NaiveDate>,
    /// Maximum task attempts in flight at once.
    pub max_concurrency: Option<usize>,
    /// Rows per insert when staging.
    pub batch_size: Option<usize>,
}

/// Task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task identifier (unique within the pipeline).
    pub id: String,
    pub description: Option<String>,
    /// Task type and its parameters.
    #[serde(flatten)]
    pub kind: TaskKindConfig,
    /// Tasks that must succeed before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Overrides the pipeline's retry defaults for this task.
    pub retry: Option<RetryConfig>,
}

/// Task type configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKindConfig {
    /// Copy raw records from storage into a landing table.
    Stage(StageParams),
    /// Append rows to a fact table.
    LoadFact(LoadParams),
    /// Refresh a dimension table.
    LoadDimension(DimensionParams),
    /// Gate downstream tasks on data-quality checks.
    ///
    /// `table` adds a first check that the table has at least one row.
    QualityCheck {
        #[serde(default)]
        checks: Vec<QualityCheck>,
        table: Option<String>,
    },
    /// No-op join point.
    Marker,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay between attempts in seconds.
    #[serde(default)]
    pub delay_secs: u64,
}
