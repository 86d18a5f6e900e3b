//! Lifecycle events and event handling.
//!
//! The executor emits an [`Event`] for every run and task transition that
//! matters operationally. Handlers are awaited in registration order on the
//! coordinator, so a slow handler slows dispatch; keep them cheap.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::run::RunStatus;
use crate::core::types::{PipelineId, RunId, TaskId};

/// Lifecycle events emitted during a run.
#[derive(Debug, Clone)]
pub enum Event {
    /// A run has started.
    RunStarted {
        run_id: RunId,
        pipeline: PipelineId,
        task_count: usize,
        timestamp: Instant,
    },

    /// An attempt of a task was dispatched.
    TaskStarted {
        run_id: RunId,
        task_id: TaskId,
        /// 1-based attempt number.
        attempt: u32,
        timestamp: Instant,
    },

    /// A task completed successfully.
    TaskSucceeded {
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        rows: u64,
        duration: Duration,
        timestamp: Instant,
    },

    /// An attempt failed and another one has been scheduled.
    ///
    /// Emitted when the retry is scheduled, before the delay elapses.
    TaskRetrying {
        run_id: RunId,
        task_id: TaskId,
        /// The attempt that just failed.
        attempt: u32,
        /// Total attempts the policy allows.
        max_attempts: u32,
        delay: Duration,
        error: String,
        timestamp: Instant,
    },

    /// A task failed for good.
    TaskFailed {
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        reason: String,
        error: String,
        timestamp: Instant,
    },

    /// A task will not run because an upstream task failed or was skipped.
    TaskSkipped {
        run_id: RunId,
        task_id: TaskId,
        upstream: TaskId,
        timestamp: Instant,
    },

    /// A run reached its final status.
    RunFinished {
        run_id: RunId,
        pipeline: PipelineId,
        status: RunStatus,
        aborted: bool,
        duration: Duration,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::RunStarted { timestamp, .. }
            | Event::TaskStarted { timestamp, .. }
            | Event::TaskSucceeded { timestamp, .. }
            | Event::TaskRetrying { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::TaskSkipped { timestamp, .. }
            | Event::RunFinished { timestamp, .. } => *timestamp,
        }
    }

    /// Get the run the event belongs to.
    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::TaskStarted { run_id, .. }
            | Event::TaskSucceeded { run_id, .. }
            | Event::TaskRetrying { run_id, .. }
            | Event::TaskFailed { run_id, .. }
            | Event::TaskSkipped { run_id, .. }
            | Event::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// Get the task the event is about, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Event::TaskStarted { task_id, .. }
            | Event::TaskSucceeded { task_id, .. }
            | Event::TaskRetrying { task_id, .. }
            | Event::TaskFailed { task_id, .. }
            | Event::TaskSkipped { task_id, .. } => Some(task_id),
            Event::RunStarted { .. } | Event::RunFinished { .. } => None,
        }
    }

    /// Short snake_case name of the event kind, as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "run_started",
            Event::TaskStarted { .. } => "task_started",
            Event::TaskSucceeded { .. } => "task_succeeded",
            Event::TaskRetrying { .. } => "task_retrying",
            Event::TaskFailed { .. } => "task_failed",
            Event::TaskSkipped { .. } => "task_skipped",
            Event::RunFinished { .. } => "run_finished",
        }
    }

    /// Create a RunStarted event.
    pub fn run_started(run_id: RunId, pipeline: PipelineId, task_count: usize) -> Self {
        Event::RunStarted {
            run_id,
            pipeline,
            task_count,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskStarted event.
    pub fn task_started(run_id: RunId, task_id: TaskId, attempt: u32) -> Self {
        Event::TaskStarted {
            run_id,
            task_id,
            attempt,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskSucceeded event.
    pub fn task_succeeded(
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        rows: u64,
        duration: Duration,
    ) -> Self {
        Event::TaskSucceeded {
            run_id,
            task_id,
            attempt,
            rows,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskRetrying event.
    pub fn task_retrying(
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    ) -> Self {
        Event::TaskRetrying {
            run_id,
            task_id,
            attempt,
            max_attempts,
            delay,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskFailed event.
    pub fn task_failed(
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        reason: String,
        error: String,
    ) -> Self {
        Event::TaskFailed {
            run_id,
            task_id,
            attempt,
            reason,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskSkipped event.
    pub fn task_skipped(run_id: RunId, task_id: TaskId, upstream: TaskId) -> Self {
        Event::TaskSkipped {
            run_id,
            task_id,
            upstream,
            timestamp: Instant::now(),
        }
    }

    /// Create a RunFinished event.
    pub fn run_finished(
        run_id: RunId,
        pipeline: PipelineId,
        status: RunStatus,
        aborted: bool,
        duration: Duration,
    ) -> Self {
        Event::RunFinished {
            run_id,
            pipeline,
            status,
            aborted,
            duration,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
