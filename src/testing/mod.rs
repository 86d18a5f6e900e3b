//! Testing utilities for users of the stagehand library.
//!
//! - [`ScriptedRunner`]: a [`TaskRunner`] whose outcomes are scripted per task
//! - [`RecordingHandler`]: an [`EventHandler`] that keeps every event
//! - [`TestHarness`]: runs a graph against a scripted runner and checks the result

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::core::check::Scalar;
use crate::core::graph::Graph;
use crate::core::retry::RetryPolicy;
use crate::core::run::{RunContext, RunStatus, TaskOutput};
use crate::core::task::Task;
use crate::core::types::TaskId;
use crate::events::{Event, EventHandler};
use crate::execution::{Executor, RunConfig};
use crate::operators::{QualityError, TaskError, TaskRunner};

/// One scripted attempt outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Succeed, reporting this many rows.
    Rows(u64),
    /// Fail with a retryable error.
    Transient(String),
    /// Fail with an error that is never retried.
    Fatal(String),
    /// Fail a quality gate on the given predicate.
    Violation(String),
    /// Panic with the given message.
    Panic(String),
}

impl Step {
    pub fn rows(rows: u64) -> Self {
        Step::Rows(rows)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Step::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Step::Fatal(message.into())
    }

    pub fn violation(predicate: impl Into<String>) -> Self {
        Step::Violation(predicate.into())
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Step::Panic(message.into())
    }

    fn into_result(self) -> Result<TaskOutput, TaskError> {
        match self {
            Step::Rows(rows) => Ok(TaskOutput::rows(rows)),
            Step::Transient(message) => Err(TaskError::Transient(message)),
            Step::Fatal(message) => Err(TaskError::Fatal(message)),
            Step::Violation(predicate) => Err(TaskError::Quality(QualityError::Violation {
                index: 0,
                predicate,
                expected: "> 0".to_string(),
                actual: Scalar::Int(0),
            })),
            Step::Panic(message) => panic!("{message}"),
        }
    }
}

/// A task runner that plays back scripted outcomes.
///
/// Each attempt of a task takes the next [`Step`] from that task's script;
/// once the script runs out (or if there never was one) attempts succeed
/// with no rows.
///
/// # Example
///
/// ```
/// use stagehand::testing::{ScriptedRunner, Step};
///
/// let runner = ScriptedRunner::new()
///     .script("Stage_events", [Step::transient("connection reset"), Step::rows(8056)])
///     .into_arc();
/// assert!(runner.started().is_empty());
/// ```
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<TaskId, VecDeque<Step>>>,
    latency: HashMap<TaskId, Duration>,
    default_latency: Duration,
    started: Mutex<Vec<TaskId>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcomes of successive attempts of `task_id`.
    pub fn script(self, task_id: impl Into<TaskId>, steps: impl IntoIterator<Item = Step>) -> Self {
        self.lock_scripts()
            .insert(task_id.into(), steps.into_iter().collect());
        self
    }

    /// Make every attempt of `task_id` take `latency` before finishing.
    pub fn with_latency(mut self, task_id: impl Into<TaskId>, latency: Duration) -> Self {
        self.latency.insert(task_id.into(), latency);
        self
    }

    /// Latency for tasks without their own.
    pub fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Task ids in the order their attempts started, retries included.
    pub fn started(&self) -> Vec<TaskId> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many attempts of `task_id` were started.
    pub fn call_count(&self, task_id: &TaskId) -> usize {
        self.started().iter().filter(|id| *id == task_id).count()
    }

    /// The largest number of attempts observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, VecDeque<Step>>> {
        // A panicking step unwinds while no lock is held, so poisoning only
        // follows a bug in this type.
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, task: &Task, _attempt: u32) -> Result<TaskOutput, TaskError> {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task.id.clone());
        let step = self
            .lock_scripts()
            .get_mut(&task.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Rows(0));

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let latency = self
            .latency
            .get(&task.id)
            .copied()
            .unwrap_or(self.default_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        step.into_result()
    }
}

/// An event handler that records every event it sees.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events about `task_id`, in emission order.
    pub fn task_events(&self, task_id: &TaskId) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.task_id() == Some(task_id))
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Runs graphs against a [`ScriptedRunner`].
///
/// Retries default to three attempts with no delay so tests do not wait.
pub struct TestHarness {
    config: RunConfig,
    runner: Arc<ScriptedRunner>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            config: RunConfig::default().with_retry(RetryPolicy::fixed(3, Duration::ZERO)),
            runner: ScriptedRunner::new().into_arc(),
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_runner(mut self, runner: ScriptedRunner) -> Self {
        self.runner = runner.into_arc();
        self
    }

    pub fn runner(&self) -> &ScriptedRunner {
        &self.runner
    }

    /// Run the graph.
    ///
    /// # Panics
    /// If the executor reports an internal state error.
    pub async fn execute(&self, graph: impl Into<Arc<Graph>>) -> RunContext {
        let runner: Arc<dyn TaskRunner> = self.runner.clone();
        match Executor::new(self.config.clone(), runner).run(graph).await {
            Ok(ctx) => ctx,
            Err(err) => panic!("executor state error: {err}"),
        }
    }

    /// Run the graph and panic unless it succeeded.
    pub async fn execute_and_assert_success(&self, graph: impl Into<Arc<Graph>>) -> RunContext {
        let ctx = self.execute(graph).await;
        assert_eq!(
            ctx.status(),
            RunStatus::Succeeded,
            "expected run to succeed: {:?}",
            ctx.summary()
        );
        ctx
    }

    /// Run the graph and panic unless it failed.
    pub async fn execute_and_assert_failure(&self, graph: impl Into<Arc<Graph>>) -> RunContext {
        let ctx = self.execute(graph).await;
        assert_eq!(
            ctx.status(),
            RunStatus::Failed,
            "expected run to fail: {:?}",
            ctx.summary()
        );
        ctx
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
