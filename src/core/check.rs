//! Data-quality predicates and their expected results.
//!
//! A quality gate holds an ordered list of [`QualityCheck`]s. Each check
//! pairs a [`Predicate`] (what to measure) with an [`Expectation`] (what the
//! measurement must look like). Predicates are an explicit enum rather than
//! free-form SQL so they can be evaluated by an in-memory warehouse and
//! rendered to SQL for a real one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single scalar produced by a warehouse query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
}

impl Scalar {
    /// Numeric view of the scalar; booleans count as 0/1.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Null => None,
            Scalar::Bool(b) => Some(i64::from(*b)),
            Scalar::Int(i) => Some(*i),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "NULL"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
        }
    }
}

/// What a quality check measures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Number of rows in a relation.
    RowCount { table: String },
    /// Number of rows whose `column` is NULL.
    NullCount { table: String, column: String },
    /// Arbitrary single-value SQL.
    Sql { sql: String },
}

impl Predicate {
    pub fn row_count(table: impl Into<String>) -> Self {
        Predicate::RowCount {
            table: table.into(),
        }
    }

    pub fn null_count(table: impl Into<String>, column: impl Into<String>) -> Self {
        Predicate::NullCount {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn sql(sql: impl Into<String>) -> Self {
        Predicate::Sql { sql: sql.into() }
    }

    /// Render the predicate as the SQL a warehouse would run.
    pub fn to_sql(&self) -> String {
        match self {
            Predicate::RowCount { table } => format!("SELECT COUNT(*) FROM {}", table),
            Predicate::NullCount { table, column } => {
                format!("SELECT COUNT(*) FROM {} WHERE {} IS NULL", table, column)
            }
            Predicate::Sql { sql } => sql.clone(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// The result a predicate must produce for the check to pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    Equals(Scalar),
    GreaterThan(i64),
    LessThan(i64),
}

impl Expectation {
    /// Check whether `actual` satisfies this expectation.
    ///
    /// Ordering comparisons never match NULL.
    pub fn matches(&self, actual: &Scalar) -> bool {
        match self {
            Expectation::Equals(expected) => match (expected, actual) {
                (Scalar::Null, Scalar::Null) => true,
                (Scalar::Null, _) | (_, Scalar::Null) => false,
                (e, a) => e.as_i64() == a.as_i64(),
            },
            Expectation::GreaterThan(bound) => actual.as_i64().is_some_and(|v| v > *bound),
            Expectation::LessThan(bound) => actual.as_i64().is_some_and(|v| v < *bound),
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Equals(v) => write!(f, "= {}", v),
            Expectation::GreaterThan(v) => write!(f, "> {}", v),
            Expectation::LessThan(v) => write!(f, "< {}", v),
        }
    }
}

/// One entry of a quality gate: a predicate and its expected result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheck {
    #[serde(flatten)]
    pub predicate: Predicate,
    pub expect: Expectation,
}

impl QualityCheck {
    pub fn new(predicate: Predicate, expect: Expectation) -> Self {
        Self { predicate, expect }
    }

    /// `predicate == value`, the shape of the original `dq_checks` entries.
    pub fn equals(predicate: Predicate, value: impl Into<Scalar>) -> Self {
        Self::new(predicate, Expectation::Equals(value.into()))
    }

    /// The default check for a table given without explicit checks: it must
    /// contain at least one row.
    pub fn has_rows(table: impl Into<String>) -> Self {
        Self::new(Predicate::row_count(table), Expectation::GreaterThan(0))
    }
}
