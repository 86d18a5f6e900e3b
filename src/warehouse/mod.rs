//! Warehouse abstraction.
//!
//! Task behaviors talk to the warehouse through the [`Warehouse`] trait using
//! typed [`Statement`]s and quality [`Predicate`]s. Both render to SQL for a
//! real client; [`InMemoryWarehouse`] evaluates them natively.

mod memory;
mod pool;

pub use memory::{InMemoryWarehouse, TableView};
pub use pool::{PooledConnection, WarehousePool};

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::core::check::{Predicate, Scalar};

/// A row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Errors reported by a warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WarehouseError {
    /// The relation does not exist.
    #[error("relation not found: {0}")]
    UnknownRelation(String),

    /// The statement or query was rejected or failed while running.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The warehouse could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// Warehouse lock was poisoned.
    #[error("warehouse lock poisoned")]
    LockPoisoned,
}

/// A write against the warehouse.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Remove every row of a relation.
    Truncate { table: String },
    /// Insert literal rows.
    InsertRows { table: String, rows: Vec<Row> },
    /// `INSERT INTO table <sql>`.
    InsertSelect { table: String, sql: String },
    /// Empty the relation and fill it from `sql` in one transaction. If
    /// `sql` fails the previous contents stay.
    Replace { table: String, sql: String },
    /// Replace rows whose `key` columns match a row produced by `sql`, then
    /// insert the rest. Members are unique per key: when `sql` yields
    /// several rows for one key, the last one wins. The rendered SQL relies
    /// on `sql` already producing one row per key.
    Upsert {
        table: String,
        key: Vec<String>,
        sql: String,
    },
}

impl Statement {
    /// The relation this statement writes to.
    pub fn table(&self) -> &str {
        match self {
            Statement::Truncate { table }
            | Statement::InsertRows { table, .. }
            | Statement::InsertSelect { table, .. }
            | Statement::Replace { table, .. }
            | Statement::Upsert { table, .. } => table,
        }
    }

    /// Render the statement as SQL.
    pub fn to_sql(&self) -> String {
        match self {
            Statement::Truncate { table } => format!("TRUNCATE TABLE {}", table),
            Statement::InsertRows { table, rows } => render_insert_rows(table, rows),
            Statement::InsertSelect { table, sql } => {
                format!("INSERT INTO {} {}", table, sql.trim())
            }
            // DELETE rather than TRUNCATE: TRUNCATE commits implicitly on Redshift.
            Statement::Replace { table, sql } => format!(
                "BEGIN; DELETE FROM {t}; INSERT INTO {t} {sql}; COMMIT;",
                t = table,
                sql = sql.trim()
            ),
            Statement::Upsert { table, key, sql } => {
                let matches = key
                    .iter()
                    .map(|k| format!("{t}.{k} = src.{k}", t = table, k = k))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                format!(
                    "BEGIN; DELETE FROM {t} USING ({sql}) AS src WHERE {matches}; INSERT INTO {t} {sql}; COMMIT;",
                    t = table,
                    sql = sql.trim(),
                    matches = matches
                )
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Row payloads can be large; keep log lines short.
            Statement::InsertRows { table, rows } => {
                write!(f, "INSERT INTO {} ({} rows)", table, rows.len())
            }
            other => f.write_str(&other.to_sql()),
        }
    }
}

fn render_insert_rows(table: &str, rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return format!("-- no rows for {}", table);
    };
    let columns: Vec<&String> = first.keys().collect();
    let values = rows
        .iter()
        .map(|row| {
            let cells = columns
                .iter()
                .map(|c| render_literal(row.get(c.as_str()).unwrap_or(&Value::Null)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", cells)
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        columns
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        values
    )
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// A warehouse connection.
///
/// Implementations must be safe to share between concurrently running
/// task attempts.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run a write and return the number of rows it affected.
    async fn execute(&self, statement: &Statement) -> Result<u64, WarehouseError>;

    /// Evaluate a single-value query.
    async fn query(&self, predicate: &Predicate) -> Result<Scalar, WarehouseError>;
}
