//! Quality gates.
//!
//! Checks run in order and stop at the first mismatch. A mismatch is a
//! verdict about the data and is never retried; a query that could not be
//! evaluated at all is a warehouse problem and is retried like a load.

use thiserror::Error;
use tracing::{debug, info};

use crate::core::check::{QualityCheck, Scalar};
use crate::warehouse::{Warehouse, WarehouseError};

/// Errors raised by a quality gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QualityError {
    /// A check's result did not match its expectation.
    #[error("check #{index} failed: {predicate} returned {actual}, expected {expected}")]
    Violation {
        /// 0-based position of the failing check.
        index: usize,
        predicate: String,
        expected: String,
        actual: Scalar,
    },

    /// A check could not be evaluated.
    #[error("check #{index} ({predicate}) could not run: {source}")]
    Query {
        index: usize,
        predicate: String,
        #[source]
        source: WarehouseError,
    },
}

impl QualityError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            QualityError::Violation { .. } => "quality_violation",
            QualityError::Query { .. } => "quality_query_failed",
        }
    }
}

pub struct QualityGate<'a> {
    pub warehouse: &'a dyn Warehouse,
}

impl QualityGate<'_> {
    /// Evaluate `checks` in order; returns how many passed (all of them).
    pub async fn execute(&self, checks: &[QualityCheck]) -> Result<usize, QualityError> {
        for (index, check) in checks.iter().enumerate() {
            let actual = self
                .warehouse
                .query(&check.predicate)
                .await
                .map_err(|source| QualityError::Query {
                    index,
                    predicate: check.predicate.to_sql(),
                    source,
                })?;

            if !check.expect.matches(&actual) {
                return Err(QualityError::Violation {
                    index,
                    predicate: check.predicate.to_sql(),
                    expected: check.expect.to_string(),
                    actual,
                });
            }
            debug!(check = %check.predicate, result = %actual, "quality check passed");
        }

        info!(checks = checks.len(), "quality gate passed");
        Ok(checks.len())
    }
}
