//! Core domain types: identifiers, tasks, quality checks, retry policy, the
//! task graph and the per-run record.

pub mod check;
pub mod graph;
pub mod retry;
pub mod run;
pub mod task;
pub mod types;
