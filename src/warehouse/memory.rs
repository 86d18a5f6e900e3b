//! In-memory warehouse implementation.
//!
//! Tables are vectors of JSON rows. Transformation SQL is not parsed: each
//! SELECT a pipeline uses is registered up front as a closure over the
//! current tables, keyed by its whitespace-normalized text. Fault injection
//! lets tests make specific relations fail a number of times.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use super::{Row, Statement, Warehouse, WarehouseError};
use crate::core::check::{Predicate, Scalar};

type Transform = Arc<dyn Fn(&TableView<'_>) -> Result<Vec<Row>, WarehouseError> + Send + Sync>;
type ScalarQuery = Arc<dyn Fn(&TableView<'_>) -> Result<Scalar, WarehouseError> + Send + Sync>;

/// Read-only view of the warehouse tables handed to registered transforms.
pub struct TableView<'a> {
    tables: &'a HashMap<String, Vec<Row>>,
}

impl TableView<'_> {
    /// Rows of a relation.
    pub fn rows(&self, table: &str) -> Result<&[Row], WarehouseError> {
        self.tables
            .get(table)
            .map(Vec::as_slice)
            .ok_or_else(|| WarehouseError::UnknownRelation(table.to_string()))
    }
}

struct Fault {
    target: String,
    remaining: usize,
    error: WarehouseError,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    faults: Vec<Fault>,
    log: Vec<String>,
    offline: bool,
}

impl State {
    /// Consume an injected fault for `target`, if any.
    fn check(&mut self, target: &str) -> Result<(), WarehouseError> {
        if self.offline {
            return Err(WarehouseError::Connection(
                "warehouse unreachable".to_string(),
            ));
        }
        if let Some(fault) = self
            .faults
            .iter_mut()
            .find(|f| f.target == target && f.remaining > 0)
        {
            fault.remaining -= 1;
            return Err(fault.error.clone());
        }
        Ok(())
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut Vec<Row>, WarehouseError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::UnknownRelation(table.to_string()))
    }
}

/// Thread-safe in-memory warehouse for tests and local runs.
#[derive(Default)]
pub struct InMemoryWarehouse {
    state: RwLock<State>,
    transforms: RwLock<HashMap<String, Transform>>,
    queries: RwLock<HashMap<String, ScalarQuery>>,
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn key_of(row: &Row, key: &[String]) -> String {
    let values: Vec<&Value> = key
        .iter()
        .map(|k| row.get(k).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&values).unwrap_or_default()
}

/// Keep only the last row produced for each key, in production order.
fn last_per_key(rows: Vec<Row>, key: &[String]) -> Vec<Row> {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (pos, row) in rows.iter().enumerate() {
        last.insert(key_of(row, key), pos);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(pos, row)| last.get(&key_of(row, key)) == Some(pos))
        .map(|(_, row)| row)
        .collect()
}

impl InMemoryWarehouse {
    /// Create an empty warehouse with no relations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: create an empty relation.
    pub fn with_table(self, table: impl Into<String>) -> Self {
        let _ = self.create_table(table);
        self
    }

    /// Builder: register the rows a transformation SELECT produces.
    pub fn with_transform<F>(self, sql: &str, transform: F) -> Self
    where
        F: Fn(&TableView<'_>) -> Result<Vec<Row>, WarehouseError> + Send + Sync + 'static,
    {
        let _ = self.register_transform(sql, transform);
        self
    }

    /// Create an empty relation; an existing relation is left untouched.
    pub fn create_table(&self, table: impl Into<String>) -> Result<(), WarehouseError> {
        let mut state = self.state.write().map_err(|_| WarehouseError::LockPoisoned)?;
        state.tables.entry(table.into()).or_default();
        Ok(())
    }

    /// Drop a relation, making it unavailable.
    pub fn drop_table(&self, table: &str) -> Result<(), WarehouseError> {
        let mut state = self.state.write().map_err(|_| WarehouseError::LockPoisoned)?;
        state.tables.remove(table);
        Ok(())
    }

    pub fn register_transform<F>(&self, sql: &str, transform: F) -> Result<(), WarehouseError>
    where
        F: Fn(&TableView<'_>) -> Result<Vec<Row>, WarehouseError> + Send + Sync + 'static,
    {
        let mut transforms = self
            .transforms
            .write()
            .map_err(|_| WarehouseError::LockPoisoned)?;
        transforms.insert(normalize(sql), Arc::new(transform));
        Ok(())
    }

    /// Register the value a free-form `sql` quality predicate evaluates to.
    pub fn register_query<F>(&self, sql: &str, query: F) -> Result<(), WarehouseError>
    where
        F: Fn(&TableView<'_>) -> Result<Scalar, WarehouseError> + Send + Sync + 'static,
    {
        let mut queries = self
            .queries
            .write()
            .map_err(|_| WarehouseError::LockPoisoned)?;
        queries.insert(normalize(sql), Arc::new(query));
        Ok(())
    }

    /// Seed rows directly, bypassing the statement log.
    pub fn insert_rows(&self, table: &str, rows: Vec<Row>) -> Result<(), WarehouseError> {
        let mut state = self.state.write().map_err(|_| WarehouseError::LockPoisoned)?;
        state.table_mut(table)?.extend(rows);
        Ok(())
    }

    /// Snapshot of a relation's rows.
    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        let state = self.state.read().ok()?;
        state.tables.get(table).cloned()
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        let state = self.state.read().ok()?;
        state.tables.get(table).map(Vec::len)
    }

    /// Make the next `times` operations on `target` fail with `error`.
    ///
    /// `target` is a relation name, or the SQL text of a free-form query.
    pub fn fail_next(&self, target: impl Into<String>, times: usize, error: WarehouseError) {
        if let Ok(mut state) = self.state.write() {
            state.faults.push(Fault {
                target: target.into(),
                remaining: times,
                error,
            });
        }
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.write() {
            state.offline = offline;
        }
    }

    /// Successfully executed statements, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .read()
            .map(|s| s.log.clone())
            .unwrap_or_default()
    }

    fn transform(&self, sql: &str) -> Result<Transform, WarehouseError> {
        let transforms = self
            .transforms
            .read()
            .map_err(|_| WarehouseError::LockPoisoned)?;
        transforms.get(&normalize(sql)).cloned().ok_or_else(|| {
            WarehouseError::QueryFailed(format!("no transform registered for: {}", sql.trim()))
        })
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn execute(&self, statement: &Statement) -> Result<u64, WarehouseError> {
        let mut state = self.state.write().map_err(|_| WarehouseError::LockPoisoned)?;
        state.check(statement.table())?;

        let affected = match statement {
            Statement::Truncate { table } => {
                let rows = state.table_mut(table)?;
                let removed = rows.len();
                rows.clear();
                removed
            }
            Statement::InsertRows { table, rows } => {
                state.table_mut(table)?.extend(rows.iter().cloned());
                rows.len()
            }
            Statement::InsertSelect { table, sql } => {
                state.table_mut(table)?;
                let produced = (self.transform(sql)?)(&TableView {
                    tables: &state.tables,
                })?;
                let count = produced.len();
                state.table_mut(table)?.extend(produced);
                count
            }
            Statement::Replace { table, sql } => {
                state.table_mut(table)?;
                let produced = (self.transform(sql)?)(&TableView {
                    tables: &state.tables,
                })?;
                let count = produced.len();
                *state.table_mut(table)? = produced;
                count
            }
            Statement::Upsert { table, key, sql } => {
                state.table_mut(table)?;
                let produced = (self.transform(sql)?)(&TableView {
                    tables: &state.tables,
                })?;
                let members = last_per_key(produced, key);
                let incoming: HashSet<String> = members.iter().map(|r| key_of(r, key)).collect();
                let rows = state.table_mut(table)?;
                rows.retain(|r| !incoming.contains(&key_of(r, key)));
                let count = members.len();
                rows.extend(members);
                count
            }
        };

        state.log.push(statement.to_string());
        Ok(affected as u64)
    }

    async fn query(&self, predicate: &Predicate) -> Result<Scalar, WarehouseError> {
        let mut state = self.state.write().map_err(|_| WarehouseError::LockPoisoned)?;

        match predicate {
            Predicate::RowCount { table } => {
                state.check(table)?;
                let rows = state.table_mut(table)?;
                Ok(Scalar::Int(rows.len() as i64))
            }
            Predicate::NullCount { table, column } => {
                state.check(table)?;
                let rows = state.table_mut(table)?;
                let nulls = rows
                    .iter()
                    .filter(|r| r.get(column).is_none_or(Value::is_null))
                    .count();
                Ok(Scalar::Int(nulls as i64))
            }
            Predicate::Sql { sql } => {
                state.check(sql)?;
                let query = {
                    let queries = self
                        .queries
                        .read()
                        .map_err(|_| WarehouseError::LockPoisoned)?;
                    queries.get(&normalize(sql)).cloned()
                };
                let query = query.ok_or_else(|| {
                    WarehouseError::QueryFailed(format!("no query registered for: {}", sql.trim()))
                })?;
                query(&TableView {
                    tables: &state.tables,
                })
            }
        }
    }
}
