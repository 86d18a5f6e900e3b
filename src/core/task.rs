//! Task definitions.
//!
//! A [`Task`] is plain data: an id, the behavior it runs and that behavior's
//! parameters. Execution lives in [`crate::operators`]; run-time state lives
//! in [`crate::core::run::RunContext`], so a task can be shared read-only by
//! every run of a graph.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::check::QualityCheck;
use super::retry::RetryPolicy;
use super::types::TaskId;

/// Reasons a task's parameters are rejected before a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    /// A quality gate with nothing to check.
    #[error("quality check list is empty")]
    EmptyChecks,

    /// A required text field is blank.
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),

    /// An upsert without key columns cannot deduplicate anything.
    #[error("upsert mode requires at least one key column")]
    EmptyUpsertKey,

    /// A json_paths format hint without paths.
    #[error("json_paths format requires at least one path")]
    EmptyJsonPaths,
}

/// The behavior a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Stage,
    LoadFact,
    LoadDimension,
    QualityCheck,
    /// No-op fork/join point.
    Marker,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::Stage => "stage",
            TaskKind::LoadFact => "load_fact",
            TaskKind::LoadDimension => "load_dimension",
            TaskKind::QualityCheck => "quality_check",
            TaskKind::Marker => "marker",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for upstream tasks.
    Pending,
    /// Every upstream succeeded; waiting for a dispatch slot.
    Ready,
    /// An attempt is in flight or scheduled.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed after its last permitted attempt.
    Failed,
    /// Not run because an upstream task failed or was skipped.
    Skipped,
}

impl TaskState {
    /// Check if the state is final for this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }

    /// Check if moving to `next` keeps the lifecycle moving forward.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Ready, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Pending, Skipped)
                | (Ready, Skipped)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Where a stage task reads its raw records from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Bucket (or root container) name.
    pub bucket: String,
    /// Key prefix inside the bucket.
    pub key: String,
    /// Optional partition suffix, e.g. `{year}/{month}`, rendered from the
    /// run's execution date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_template: Option<String>,
}

impl SourceLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            partition_template: None,
        }
    }

    /// Builder: read only one partition of the key.
    pub fn with_partition(mut self, template: impl Into<String>) -> Self {
        self.partition_template = Some(template.into());
        self
    }

    /// Resolve the key prefix to read for a given execution date.
    ///
    /// Supported placeholders: `{year}`, `{month}`, `{day}` (month and day
    /// are not zero-padded, matching the source bucket layout) and
    /// `{date}` (`YYYY-MM-DD`).
    pub fn resolve_key(&self, execution_date: NaiveDate) -> String {
        let key = self.key.trim_end_matches('/');
        match &self.partition_template {
            None => key.to_string(),
            Some(template) => {
                let partition = template
                    .replace("{year}", &execution_date.year().to_string())
                    .replace("{month}", &execution_date.month().to_string())
                    .replace("{day}", &execution_date.day().to_string())
                    .replace("{date}", &execution_date.format("%Y-%m-%d").to_string());
                format!("{}/{}", key, partition.trim_matches('/'))
            }
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)?;
        if let Some(template) = &self.partition_template {
            write!(f, "/{}", template)?;
        }
        Ok(())
    }
}

/// How raw records are turned into rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormatHint {
    /// JSON objects; top-level keys become lower-cased column names.
    #[default]
    Auto,
    /// JSON objects; each `$.a.b` path becomes a column named after its
    /// last segment, in the listed order.
    JsonPaths { paths: Vec<String> },
    /// Delimited text with a header line.
    Csv {
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
}

fn default_delimiter() -> char {
    ','
}

/// Parameters of a stage task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageParams {
    pub source: SourceLocation,
    /// Landing relation.
    pub target: String,
    #[serde(default)]
    pub format: FormatHint,
    /// Named credentials for the source, resolved at execution time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

/// Parameters of a fact load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadParams {
    /// SELECT producing the rows to write.
    pub sql: String,
    pub target: String,
}

/// Parameters of a dimension load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionParams {
    /// SELECT producing the dimension members.
    pub sql: String,
    pub target: String,
    #[serde(default)]
    pub mode: DimensionMode,
}

/// How a dimension load keeps re-runs from duplicating members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DimensionMode {
    /// Empty the table, then insert.
    #[default]
    TruncateInsert,
    /// Replace rows whose key columns match, insert the rest.
    Upsert { key: Vec<String> },
}

/// Kind-specific task configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskParams {
    Stage(StageParams),
    LoadFact(LoadParams),
    LoadDimension(DimensionParams),
    QualityCheck {
        checks: Vec<QualityCheck>,
    },
    Marker,
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParams::Stage(_) => TaskKind::Stage,
            TaskParams::LoadFact(_) => TaskKind::LoadFact,
            TaskParams::LoadDimension(_) => TaskKind::LoadDimension,
            TaskParams::QualityCheck { .. } => TaskKind::QualityCheck,
            TaskParams::Marker => TaskKind::Marker,
        }
    }

    /// Reject configurations that can never run correctly.
    pub fn validate(&self) -> Result<(), ParamError> {
        match self {
            TaskParams::Stage(params) => {
                if params.source.bucket.trim().is_empty() {
                    return Err(ParamError::EmptyField("source.bucket"));
                }
                if params.target.trim().is_empty() {
                    return Err(ParamError::EmptyField("target"));
                }
                if let FormatHint::JsonPaths { paths } = &params.format {
                    if paths.is_empty() {
                        return Err(ParamError::EmptyJsonPaths);
                    }
                }
                Ok(())
            }
            TaskParams::LoadFact(load) => validate_load(&load.sql, &load.target),
            TaskParams::LoadDimension(dim) => {
                validate_load(&dim.sql, &dim.target)?;
                if let DimensionMode::Upsert { key } = &dim.mode {
                    if key.is_empty() {
                        return Err(ParamError::EmptyUpsertKey);
                    }
                }
                Ok(())
            }
            TaskParams::QualityCheck { checks } if checks.is_empty() => {
                Err(ParamError::EmptyChecks)
            }
            TaskParams::QualityCheck { .. } | TaskParams::Marker => Ok(()),
        }
    }
}

fn validate_load(sql: &str, target: &str) -> Result<(), ParamError> {
    if sql.trim().is_empty() {
        return Err(ParamError::EmptyField("sql"));
    }
    if target.trim().is_empty() {
        return Err(ParamError::EmptyField("target"));
    }
    Ok(())
}

/// A unit of work in a pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(flatten)]
    pub params: TaskParams,
    /// Overrides the run's retry policy for this task only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Task {
    /// Create a task with the given parameters.
    pub fn new(id: impl Into<TaskId>, params: TaskParams) -> Self {
        Self {
            id: id.into(),
            params,
            retry: None,
            description: None,
        }
    }

    pub fn stage(id: impl Into<TaskId>, params: StageParams) -> Self {
        Self::new(id, TaskParams::Stage(params))
    }

    pub fn load_fact(id: impl Into<TaskId>, sql: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            id,
            TaskParams::LoadFact(LoadParams {
                sql: sql.into(),
                target: target.into(),
            }),
        )
    }

    /// A dimension load using truncate-then-insert.
    pub fn load_dimension(
        id: impl Into<TaskId>,
        sql: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            TaskParams::LoadDimension(DimensionParams {
                sql: sql.into(),
                target: target.into(),
                mode: DimensionMode::TruncateInsert,
            }),
        )
    }

    pub fn quality_check(id: impl Into<TaskId>, checks: Vec<QualityCheck>) -> Self {
        Self::new(id, TaskParams::QualityCheck { checks })
    }

    pub fn marker(id: impl Into<TaskId>) -> Self {
        Self::new(id, TaskParams::Marker)
    }

    /// Builder: override the retry policy for this task.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Builder: set a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder: switch a dimension load to upsert on the given key columns.
    ///
    /// Has no effect on other task kinds.
    pub fn upsert_on<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let TaskParams::LoadDimension(dim) = &mut self.params {
            dim.mode = DimensionMode::Upsert {
                key: key.into_iter().map(Into::into).collect(),
            };
        }
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.params.kind()
    }
}
