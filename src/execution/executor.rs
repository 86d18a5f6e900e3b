//! Pipeline executor.
//!
//! A single coordinator owns the [`RunContext`] and makes every scheduling
//! decision. Attempts run as spawned tokio tasks; the coordinator waits on
//! three things at once: an attempt finishing, a scheduled retry coming
//! due, and an abort request. Because only the coordinator mutates run
//! state, readiness checks and skip propagation never race.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::graph::Graph;
use crate::core::retry::RetryPolicy;
use crate::core::run::{RunContext, RunError, TaskOutput};
use crate::core::task::TaskState;
use crate::core::types::TaskId;
use crate::events::{Event, EventBus};
use crate::operators::{TaskError, TaskRunner};

use super::config::RunConfig;
use super::retry_queue::RetryQueue;

/// Runs pipeline graphs to completion.
pub struct Executor {
    config: RunConfig,
    runner: Arc<dyn TaskRunner>,
    event_bus: Option<Arc<EventBus>>,
}

impl Executor {
    pub fn new(config: RunConfig, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            config,
            runner,
            event_bus: None,
        }
    }

    /// Builder: emit lifecycle events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run every task of `graph` using the configured retry policy.
    ///
    /// Task failures never surface as `Err`; they are recorded in the
    /// returned context. An `Err` means run state was driven into an
    /// impossible transition.
    pub async fn run(&self, graph: impl Into<Arc<Graph>>) -> Result<RunContext, RunError> {
        self.execute(graph.into(), self.config.retry.clone(), CancellationToken::new())
            .await
    }

    /// Run `graph` with `policy` as the default retry policy. Tasks that
    /// carry their own policy keep it.
    pub async fn run_with_policy(
        &self,
        graph: impl Into<Arc<Graph>>,
        policy: &RetryPolicy,
    ) -> Result<RunContext, RunError> {
        self.execute(graph.into(), policy.clone(), CancellationToken::new())
            .await
    }

    /// Run `graph` until it settles or `abort` is cancelled.
    ///
    /// On abort, attempts already in flight are allowed to finish, tasks
    /// waiting for a retry fail with their last error, nothing else is
    /// dispatched, and the run ends Failed.
    pub async fn run_until(
        &self,
        graph: impl Into<Arc<Graph>>,
        abort: CancellationToken,
    ) -> Result<RunContext, RunError> {
        self.execute(graph.into(), self.config.retry.clone(), abort)
            .await
    }

    async fn execute(
        &self,
        graph: Arc<Graph>,
        policy: RetryPolicy,
        abort: CancellationToken,
    ) -> Result<RunContext, RunError> {
        let ctx = RunContext::new(Arc::clone(&graph));
        let span = info_span!(
            "pipeline_run",
            pipeline = %graph.id(),
            run_id = %ctx.run_id(),
            owner = %self.config.owner,
            execution_date = %self.config.execution_date,
        );

        Coordinator {
            executor: self,
            graph,
            policy,
            ctx,
            ready: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
            retries: RetryQueue::new(),
            aborted: false,
        }
        .drive(abort)
        .instrument(span)
        .await
    }
}

/// A finished attempt as seen by the coordinator.
struct Completion {
    task_id: TaskId,
    attempt: u32,
    started: Instant,
    outcome: Result<TaskOutput, TaskError>,
}

/// Mutable state of one run. Lives only inside [`Executor::execute`].
struct Coordinator<'a> {
    executor: &'a Executor,
    graph: Arc<Graph>,
    policy: RetryPolicy,
    ctx: RunContext,
    /// Tasks waiting for a dispatch slot: newly Ready tasks and due retries.
    ready: VecDeque<TaskId>,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    retries: RetryQueue,
    aborted: bool,
}

impl Coordinator<'_> {
    async fn drive(mut self, abort: CancellationToken) -> Result<RunContext, RunError> {
        let run_started = Instant::now();
        let run_id = self.ctx.run_id();
        let pipeline = self.graph.id().clone();

        info!(tasks = self.graph.len(), "starting run");
        self.emit(Event::run_started(run_id, pipeline.clone(), self.graph.len()))
            .await;

        let graph = Arc::clone(&self.graph);
        for root in graph.roots() {
            self.ctx.transition(root, TaskState::Ready)?;
            self.ready.push_back(root.clone());
        }

        loop {
            if !self.aborted && abort.is_cancelled() {
                self.abort().await?;
            }
            if !self.aborted {
                self.dispatch_ready().await?;
            }
            if self.in_flight.is_empty() && (self.aborted || self.retries.is_empty()) {
                break;
            }

            tokio::select! {
                biased;

                _ = abort.cancelled(), if !self.aborted => self.abort().await?,

                Some(done) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.complete(done).await?;
                }

                Some(task_id) = self.retries.next_due(), if !self.aborted && !self.retries.is_empty() => {
                    debug!(task = %task_id, "retry due");
                    self.ready.push_back(task_id);
                }

                else => break,
            }
        }

        let status = self.ctx.finalize(self.aborted)?;
        let duration = run_started.elapsed();
        info!(
            status = %status,
            aborted = self.aborted,
            succeeded = self.ctx.tasks_in(TaskState::Succeeded).len(),
            failed = self.ctx.tasks_in(TaskState::Failed).len(),
            skipped = self.ctx.tasks_in(TaskState::Skipped).len(),
            duration_ms = duration.as_millis() as u64,
            "run finished"
        );
        self.emit(Event::run_finished(run_id, pipeline, status, self.aborted, duration))
            .await;

        Ok(self.ctx)
    }

    /// Takes `&mut self` so the run future stays `Send`; the coordinator
    /// owns a `FuturesUnordered`, which is not `Sync`.
    async fn emit(&mut self, event: Event) {
        if let Some(bus) = self.executor.event_bus.clone() {
            bus.emit(event).await;
        }
    }

    /// The task's own policy if it has one, else the run's.
    fn policy_for(&self, task_id: &TaskId) -> RetryPolicy {
        self.graph
            .get(task_id)
            .and_then(|task| task.retry.clone())
            .unwrap_or_else(|| self.policy.clone())
    }

    async fn dispatch_ready(&mut self) -> Result<(), RunError> {
        while self.in_flight.len() < self.executor.config.max_concurrency {
            let Some(task_id) = self.ready.pop_front() else {
                break;
            };
            self.dispatch(task_id).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, task_id: TaskId) -> Result<(), RunError> {
        let task = self
            .graph
            .get(&task_id)
            .cloned()
            .ok_or_else(|| RunError::UnknownTask(task_id.clone()))?;

        // Retries come back already Running.
        if self.ctx.state(&task_id) == Some(TaskState::Ready) {
            self.ctx.transition(&task_id, TaskState::Running)?;
        }
        let attempt = self.ctx.begin_attempt(&task_id)?;

        debug!(task = %task_id, kind = %task.kind(), attempt, "dispatching attempt");
        self.emit(Event::task_started(self.ctx.run_id(), task_id.clone(), attempt))
            .await;

        let runner = Arc::clone(&self.executor.runner);
        let span = info_span!("task_attempt", task = %task_id, kind = %task.kind(), attempt);
        let handle =
            tokio::spawn(async move { runner.run(&task, attempt).await }.instrument(span));

        let started = Instant::now();
        self.in_flight.push(
            async move {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(err) => Err(join_failure(err)),
                };
                Completion {
                    task_id,
                    attempt,
                    started,
                    outcome,
                }
            }
            .boxed(),
        );
        Ok(())
    }

    async fn complete(&mut self, done: Completion) -> Result<(), RunError> {
        let Completion {
            task_id,
            attempt,
            started,
            outcome,
        } = done;
        let run_id = self.ctx.run_id();

        match outcome {
            Ok(output) => {
                self.ctx.succeed(&task_id, output)?;
                info!(task = %task_id, attempt, rows = output.rows, "task succeeded");
                self.emit(Event::task_succeeded(
                    run_id,
                    task_id.clone(),
                    attempt,
                    output.rows,
                    started.elapsed(),
                ))
                .await;

                if !self.aborted {
                    self.promote_downstream(&task_id)?;
                }
            }
            Err(err) => {
                let failure = err.to_failure(attempt);
                let policy = self.policy_for(&task_id);

                if !self.aborted && err.is_retryable() && policy.should_retry(attempt) {
                    let delay = policy.get_delay();
                    let due_at = chrono::Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    self.ctx.schedule_retry(&task_id, failure, due_at)?;
                    self.retries.push(Instant::now() + delay, task_id.clone());

                    warn!(
                        task = %task_id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "attempt failed, retry scheduled"
                    );
                    self.emit(Event::task_retrying(
                        run_id,
                        task_id,
                        attempt,
                        policy.max_attempts,
                        delay,
                        err.to_string(),
                    ))
                    .await;
                } else {
                    error!(
                        task = %task_id,
                        attempt,
                        reason = err.reason_code(),
                        error = %err,
                        "task failed"
                    );
                    self.ctx.fail(&task_id, failure)?;
                    self.emit(Event::task_failed(
                        run_id,
                        task_id.clone(),
                        attempt,
                        err.reason_code().to_string(),
                        err.to_string(),
                    ))
                    .await;

                    if !self.aborted {
                        self.skip_downstream(&task_id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Mark downstream tasks Ready once all of their upstream succeeded.
    fn promote_downstream(&mut self, task_id: &TaskId) -> Result<(), RunError> {
        let graph = Arc::clone(&self.graph);
        for next in graph.downstream(task_id) {
            if self.ctx.state(next) != Some(TaskState::Pending) {
                continue;
            }
            let satisfied = graph
                .upstream(next)
                .iter()
                .all(|up| self.ctx.state(up) == Some(TaskState::Succeeded));
            if satisfied {
                debug!(task = %next, "task ready");
                self.ctx.transition(next, TaskState::Ready)?;
                self.ready.push_back(next.clone());
            }
        }
        Ok(())
    }

    /// Skip everything reachable downstream of `task_id` that has not run.
    async fn skip_downstream(&mut self, task_id: &TaskId) -> Result<(), RunError> {
        let graph = Arc::clone(&self.graph);
        let mut frontier = VecDeque::from([task_id.clone()]);

        while let Some(cause) = frontier.pop_front() {
            for next in graph.downstream(&cause) {
                if !matches!(
                    self.ctx.state(next),
                    Some(TaskState::Pending | TaskState::Ready)
                ) {
                    continue;
                }
                self.ctx.transition(next, TaskState::Skipped)?;
                self.ready.retain(|queued| queued != next);
                info!(task = %next, upstream = %cause, "task skipped");
                self.emit(Event::task_skipped(
                    self.ctx.run_id(),
                    next.clone(),
                    cause.clone(),
                ))
                .await;
                frontier.push_back(next.clone());
            }
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), RunError> {
        self.aborted = true;
        warn!(
            in_flight = self.in_flight.len(),
            waiting_retries = self.retries.len(),
            "abort requested, dispatch stopped"
        );

        // Due retries still queued for a slot are Running too.
        let mut waiting = self.retries.drain();
        for task_id in self.ready.drain(..) {
            if self.ctx.state(&task_id) == Some(TaskState::Running) {
                waiting.push(task_id);
            }
        }

        let run_id = self.ctx.run_id();
        for task_id in waiting {
            self.ctx.fail_pending_retry(&task_id)?;
            let attempt = self.ctx.attempts(&task_id);
            let (reason, message) = self
                .ctx
                .failure(&task_id)
                .map(|f| (f.reason.clone(), f.message.clone()))
                .unwrap_or_else(|| ("aborted".to_string(), "run aborted".to_string()));
            warn!(task = %task_id, attempt, "pending retry abandoned");
            self.emit(Event::task_failed(run_id, task_id, attempt, reason, message))
                .await;
        }
        Ok(())
    }
}

fn join_failure(err: JoinError) -> TaskError {
    if !err.is_panic() {
        return TaskError::Fatal("attempt was cancelled".to_string());
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    TaskError::Panicked(message)
}
