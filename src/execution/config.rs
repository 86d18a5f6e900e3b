//! Run configuration.

use chrono::{NaiveDate, Utc};

use crate::core::retry::RetryPolicy;

/// Default number of task attempts in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default number of staged rows written per insert.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Immutable settings for one run, fixed when the executor is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Who the pipeline belongs to; carried into logs.
    pub owner: String,
    /// Logical date the run processes; drives partition templates.
    pub execution_date: NaiveDate,
    /// Retry policy for tasks without their own override.
    pub retry: RetryPolicy,
    /// Maximum attempts running at the same time.
    pub max_concurrency: usize,
    /// Rows per insert when staging.
    pub batch_size: usize,
}

impl RunConfig {
    pub fn new(execution_date: NaiveDate) -> Self {
        Self {
            owner: "stagehand".to_string(),
            execution_date,
            retry: RetryPolicy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder: bound concurrent attempts; zero is treated as one.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new(Utc::now().date_naive())
    }
}
