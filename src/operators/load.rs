//! Fact and dimension loads.
//!
//! A fact load appends the rows its SELECT produces. A dimension load
//! replaces the members it produces, either by swapping the whole table
//! contents in one statement or by upserting on key columns, so re-running
//! never duplicates members and a failed load leaves the old members.

use thiserror::Error;
use tracing::info;

use crate::core::task::{DimensionMode, DimensionParams, LoadParams};
use crate::warehouse::{Statement, Warehouse, WarehouseError};

/// Errors that can occur while loading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The target relation does not exist or can't be written.
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    /// The transformation query failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The warehouse connection failed.
    #[error("connection error: {0}")]
    Connection(String),
}

impl LoadError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            LoadError::TargetUnavailable(_) => "target_unavailable",
            LoadError::QueryFailed(_) => "query_failed",
            LoadError::Connection(_) => "connection",
        }
    }
}

impl From<WarehouseError> for LoadError {
    fn from(err: WarehouseError) -> Self {
        match err {
            WarehouseError::UnknownRelation(table) => LoadError::TargetUnavailable(table),
            WarehouseError::QueryFailed(message) => LoadError::QueryFailed(message),
            WarehouseError::Connection(message) => LoadError::Connection(message),
            poisoned @ WarehouseError::LockPoisoned => LoadError::Connection(poisoned.to_string()),
        }
    }
}

pub struct LoadOperator<'a> {
    pub warehouse: &'a dyn Warehouse,
}

impl LoadOperator<'_> {
    /// Append the query's rows to the fact table.
    pub async fn load_fact(&self, params: &LoadParams) -> Result<u64, LoadError> {
        let rows = self
            .warehouse
            .execute(&Statement::InsertSelect {
                table: params.target.clone(),
                sql: params.sql.clone(),
            })
            .await?;

        info!(table = %params.target, rows, "loaded fact table");
        Ok(rows)
    }

    /// Refresh a dimension table.
    pub async fn load_dimension(&self, params: &DimensionParams) -> Result<u64, LoadError> {
        let rows = match &params.mode {
            DimensionMode::TruncateInsert => {
                self.warehouse
                    .execute(&Statement::Replace {
                        table: params.target.clone(),
                        sql: params.sql.clone(),
                    })
                    .await?
            }
            DimensionMode::Upsert { key } => {
                self.warehouse
                    .execute(&Statement::Upsert {
                        table: params.target.clone(),
                        key: key.clone(),
                        sql: params.sql.clone(),
                    })
                    .await?
            }
        };

        info!(table = %params.target, rows, "loaded dimension table");
        Ok(rows)
    }
}
