//! Per-execution run record.
//!
//! A [`RunContext`] owns everything that changes while a graph executes:
//! task states, attempt counts, failures and the overall status. The graph
//! itself is shared read-only. Only the executor mutates a context, and
//! once the run is finalized every further mutation is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::graph::Graph;
use super::task::{TaskKind, TaskState};
use super::types::{PipelineId, RunId, TaskId};

/// Errors raised when the run record is mutated out of order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// A state change that would move a task backwards or out of a
    /// terminal state.
    #[error("task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    /// The task is not part of this run's graph.
    #[error("task not found: {0}")]
    UnknownTask(TaskId),

    /// The run already has a final status.
    #[error("run {0} is already finalized")]
    Finalized(RunId),
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a successful attempt produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Rows landed or written; zero for tasks that write nothing.
    pub rows: u64,
}

impl TaskOutput {
    pub fn rows(rows: u64) -> Self {
        Self { rows }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// Why a task attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Stable machine-readable reason, e.g. `source_unreachable`.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
    /// The attempt (1-based) that produced this failure.
    pub attempt: u32,
}

impl TaskFailure {
    pub fn new(reason: impl Into<String>, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
            attempt,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (attempt {})",
            self.reason, self.message, self.attempt
        )
    }
}

/// Mutable per-task state within a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub state: TaskState,
    /// Attempts dispatched so far.
    pub attempt_count: u32,
    /// When the pending retry becomes due, if one is scheduled.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// The most recent failure; for a Failed task, the one that ended it.
    pub failure: Option<TaskFailure>,
    pub output: Option<TaskOutput>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            state: TaskState::Pending,
            attempt_count: 0,
            next_attempt_at: None,
            failure: None,
            output: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// The record of one execution of a graph.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: RunId,
    graph: Arc<Graph>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: RunStatus,
    aborted: bool,
    records: HashMap<TaskId, TaskRecord>,
}

impl RunContext {
    /// Start a new run of `graph`; every task begins Pending.
    pub fn new(graph: Arc<Graph>) -> Self {
        let records = graph
            .tasks()
            .map(|t| (t.id.clone(), TaskRecord::new()))
            .collect();

        Self {
            run_id: RunId::new(),
            graph,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Running,
            aborted: false,
            records,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn pipeline(&self) -> &PipelineId {
        self.graph.id()
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Whether the run was stopped by an abort request.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn record(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.records.get(id)
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.records.get(id).map(|r| r.state)
    }

    /// Attempts dispatched for a task; zero for unknown tasks.
    pub fn attempts(&self, id: &TaskId) -> u32 {
        self.records.get(id).map_or(0, |r| r.attempt_count)
    }

    pub fn failure(&self, id: &TaskId) -> Option<&TaskFailure> {
        self.records.get(id).and_then(|r| r.failure.as_ref())
    }

    /// Tasks currently in `state`, in declaration order.
    pub fn tasks_in(&self, state: TaskState) -> Vec<&TaskId> {
        self.graph
            .tasks()
            .map(|t| &t.id)
            .filter(|id| self.state(id) == Some(state))
            .collect()
    }

    /// Check if nothing is left to do.
    pub fn is_settled(&self) -> bool {
        !self.records.values().any(|r| {
            matches!(
                r.state,
                TaskState::Pending | TaskState::Ready | TaskState::Running
            )
        })
    }

    fn record_mut(&mut self, id: &TaskId) -> Result<&mut TaskRecord, RunError> {
        if self.status != RunStatus::Running {
            return Err(RunError::Finalized(self.run_id));
        }
        self.records
            .get_mut(id)
            .ok_or_else(|| RunError::UnknownTask(id.clone()))
    }

    /// Move a task to `next`, enforcing forward-only transitions.
    pub fn transition(&mut self, id: &TaskId, next: TaskState) -> Result<(), RunError> {
        let record = self.record_mut(id)?;
        if !record.state.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                task: id.clone(),
                from: record.state,
                to: next,
            });
        }

        let now = Utc::now();
        record.state = next;
        match next {
            TaskState::Running => record.started_at = Some(now),
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped => {
                record.next_attempt_at = None;
                record.ended_at = Some(now);
            }
            TaskState::Pending | TaskState::Ready => {}
        }
        Ok(())
    }

    /// Count a dispatched attempt and return its 1-based number.
    pub fn begin_attempt(&mut self, id: &TaskId) -> Result<u32, RunError> {
        let record = self.record_mut(id)?;
        if record.state != TaskState::Running {
            return Err(RunError::InvalidTransition {
                task: id.clone(),
                from: record.state,
                to: TaskState::Running,
            });
        }
        record.attempt_count += 1;
        record.next_attempt_at = None;
        Ok(record.attempt_count)
    }

    /// Remember a failed attempt whose retry is due at `at`.
    pub fn schedule_retry(
        &mut self,
        id: &TaskId,
        failure: TaskFailure,
        at: DateTime<Utc>,
    ) -> Result<(), RunError> {
        let record = self.record_mut(id)?;
        record.failure = Some(failure);
        record.next_attempt_at = Some(at);
        Ok(())
    }

    pub fn succeed(&mut self, id: &TaskId, output: TaskOutput) -> Result<(), RunError> {
        self.transition(id, TaskState::Succeeded)?;
        let record = self.record_mut(id)?;
        record.output = Some(output);
        record.failure = None;
        Ok(())
    }

    pub fn fail(&mut self, id: &TaskId, failure: TaskFailure) -> Result<(), RunError> {
        self.transition(id, TaskState::Failed)?;
        self.record_mut(id)?.failure = Some(failure);
        Ok(())
    }

    /// Fail a task that was waiting for a retry, keeping its last error.
    pub fn fail_pending_retry(&mut self, id: &TaskId) -> Result<(), RunError> {
        self.transition(id, TaskState::Failed)
    }

    /// Set the final status. Succeeded only if every task succeeded and the
    /// run was not aborted.
    pub fn finalize(&mut self, aborted: bool) -> Result<RunStatus, RunError> {
        if self.status != RunStatus::Running {
            return Err(RunError::Finalized(self.run_id));
        }
        let all_succeeded = self
            .records
            .values()
            .all(|r| r.state == TaskState::Succeeded);

        self.aborted = aborted;
        self.status = if all_succeeded && !aborted {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        self.ended_at = Some(Utc::now());
        Ok(self.status)
    }

    /// A serializable snapshot for operational tooling.
    pub fn summary(&self) -> RunSummary {
        let tasks = self
            .graph
            .tasks()
            .filter_map(|task| {
                let record = self.records.get(&task.id)?;
                Some(TaskSummary {
                    id: task.id.clone(),
                    kind: task.kind(),
                    state: record.state,
                    attempts: record.attempt_count,
                    rows: record.output.map(|o| o.rows),
                    failure: record.failure.clone(),
                })
            })
            .collect();

        RunSummary {
            run_id: self.run_id,
            pipeline: self.pipeline().clone(),
            status: self.status,
            aborted: self.aborted,
            started_at: self.started_at,
            ended_at: self.ended_at,
            tasks,
        }
    }
}

/// Serializable view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub pipeline: PipelineId,
    pub status: RunStatus,
    pub aborted: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
}
