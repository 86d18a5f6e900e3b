//! Task behaviors.
//!
//! The executor only knows the [`TaskRunner`] trait: given a task and the
//! attempt number, do the work once. [`WarehouseRunner`] is the production
//! runner, dispatching each task kind to its operator against a pooled
//! warehouse connection.

mod load;
mod quality;
mod stage;

pub use load::{LoadError, LoadOperator};
pub use quality::{QualityError, QualityGate};
pub use stage::{StageError, StageOperator};

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::core::run::{TaskFailure, TaskOutput};
use crate::core::task::{Task, TaskParams};
use crate::credentials::{CredentialProvider, StaticCredentials};
use crate::execution::RunConfig;
use crate::storage::StorageReader;
use crate::warehouse::{PooledConnection, WarehouseError, WarehousePool};

/// Errors a single task attempt can end with.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Quality(#[from] QualityError),

    /// No warehouse connection could be obtained.
    #[error("warehouse connection: {0}")]
    Connection(WarehouseError),

    /// A failure that may succeed on retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// A failure that retrying won't fix.
    #[error("execution failed: {0}")]
    Fatal(String),

    /// The attempt panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Stable machine-readable reason for the failure.
    pub fn reason_code(&self) -> &'static str {
        match self {
            TaskError::Stage(e) => e.reason_code(),
            TaskError::Load(e) => e.reason_code(),
            TaskError::Quality(e) => e.reason_code(),
            TaskError::Connection(_) => "connection",
            TaskError::Transient(_) => "transient",
            TaskError::Fatal(_) => "fatal",
            TaskError::Panicked(_) => "panicked",
        }
    }

    /// Check if another attempt may fix this failure.
    ///
    /// Data-quality violations are verdicts, not accidents, so they are
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Stage(_)
            | TaskError::Load(_)
            | TaskError::Connection(_)
            | TaskError::Transient(_) => true,
            TaskError::Quality(e) => matches!(e, QualityError::Query { .. }),
            TaskError::Fatal(_) | TaskError::Panicked(_) => false,
        }
    }

    /// Record this error as the failure of attempt `attempt`.
    pub fn to_failure(&self, attempt: u32) -> TaskFailure {
        TaskFailure::new(self.reason_code(), self.to_string(), attempt)
    }
}

/// Runs one attempt of a task.
///
/// Implementations must not retry internally; the executor owns the retry
/// policy.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute `task` once. `attempt` is 1-based.
    async fn run(&self, task: &Task, attempt: u32) -> Result<TaskOutput, TaskError>;
}

/// Runs tasks against a warehouse and source storage.
pub struct WarehouseRunner {
    pool: WarehousePool,
    storage: Arc<dyn StorageReader>,
    credentials: Arc<dyn CredentialProvider>,
    execution_date: NaiveDate,
    batch_size: usize,
}

impl WarehouseRunner {
    /// Create a runner using the run's execution date and batch size.
    pub fn new(config: &RunConfig, pool: WarehousePool, storage: Arc<dyn StorageReader>) -> Self {
        Self {
            pool,
            storage,
            credentials: Arc::new(StaticCredentials::new()),
            execution_date: config.execution_date,
            batch_size: config.batch_size,
        }
    }

    /// Builder: resolve stage credentials through `provider`.
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = provider;
        self
    }

    async fn connect(&self) -> Result<PooledConnection, TaskError> {
        self.pool.acquire().await.map_err(TaskError::Connection)
    }
}

#[async_trait]
impl TaskRunner for WarehouseRunner {
    async fn run(&self, task: &Task, attempt: u32) -> Result<TaskOutput, TaskError> {
        debug!(task = %task.id, kind = %task.kind(), attempt, "running task");

        match &task.params {
            TaskParams::Marker => Ok(TaskOutput::none()),
            TaskParams::Stage(params) => {
                let conn = self.connect().await?;
                let rows = StageOperator {
                    warehouse: &*conn,
                    storage: self.storage.as_ref(),
                    credentials: self.credentials.as_ref(),
                    execution_date: self.execution_date,
                    batch_size: self.batch_size,
                }
                .execute(params)
                .await?;
                Ok(TaskOutput::rows(rows))
            }
            TaskParams::LoadFact(params) => {
                let conn = self.connect().await?;
                let rows = LoadOperator { warehouse: &*conn }.load_fact(params).await?;
                Ok(TaskOutput::rows(rows))
            }
            TaskParams::LoadDimension(params) => {
                let conn = self.connect().await?;
                let rows = LoadOperator { warehouse: &*conn }
                    .load_dimension(params)
                    .await?;
                Ok(TaskOutput::rows(rows))
            }
            TaskParams::QualityCheck { checks } => {
                let conn = self.connect().await?;
                QualityGate { warehouse: &*conn }.execute(checks).await?;
                Ok(TaskOutput::none())
            }
        }
    }
}
