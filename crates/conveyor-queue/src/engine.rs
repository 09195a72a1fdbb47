//! The queue engine: worker pool, retry/backoff, suspension, shutdown, and
//! resume-on-start.
//!
//! # Design
//! - Workers pull from the scheduler and drive one task at a time; a task
//!   suspends by returning control, never by parking its worker.
//! - Every status transition is validated against the lifecycle table and
//!   persisted before the next iteration can observe it.
//! - Iterations run inside a spawned child task so panics and deadline
//!   overruns are contained without killing the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use conveyor_telemetry::with_correlation_id;

use crate::error::{QueueError, QueueResult};
use crate::metrics::{QueueMetrics, QueueMetricsSnapshot};
use crate::record::TaskRecord;
use crate::registry::TaskRegistry;
use crate::repo::TaskRepository;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::status::TaskStatus;
use crate::task::{StepContext, StepOutcome, Task, TaskFactoryRegistry};

/// Tunables for a queue instance; every knob has a default.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Diagnostics label carried in every log line.
    pub name: String,
    /// Fixed worker concurrency.
    pub worker_count: usize,
    /// Retries beyond the first attempt before a failure is terminal.
    pub max_retry: u32,
    /// Fixed retry delay; when `None` the exponential backoff applies.
    pub retry_delay: Option<Duration>,
    /// Base of the exponential backoff.
    pub backoff_factor: f64,
    /// Upper bound on any backoff delay.
    pub backoff_max: Duration,
    /// Budget for the cumulative time a task may spend inside iterations.
    pub max_task_execution: Duration,
    /// Sleep between empty-queue polls.
    pub task_pull_interval: Duration,
    /// Scheduler capacity; 0 means unbounded.
    pub scheduler_capacity: usize,
    /// Task kinds rehydrated from the repository at start.
    pub resume_kinds: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "conveyor".to_string(),
            worker_count: 1,
            max_retry: 3,
            retry_delay: None,
            backoff_factor: 2.0,
            backoff_max: Duration::from_secs(300),
            max_task_execution: Duration::from_secs(3600),
            task_pull_interval: Duration::from_secs(1),
            scheduler_capacity: 0,
            resume_kinds: Vec::new(),
        }
    }
}

/// Multi-worker task queue with persistence, retry, and suspension.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    repo: Arc<dyn TaskRepository>,
    factories: Arc<TaskFactoryRegistry>,
    registry: Arc<TaskRegistry>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<QueueMetrics>,
    accepting: AtomicBool,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    workers: AsyncMutex<Vec<JoinHandle<()>>>,
}

enum IterationFailure {
    Step { message: String, critical: bool },
    Panicked,
    DeadlineExceeded,
}

impl Queue {
    /// Build a queue over the given repository and factory registry.
    #[must_use]
    pub fn new(
        config: QueueConfig,
        repo: Arc<dyn TaskRepository>,
        factories: Arc<TaskFactoryRegistry>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                scheduler: Arc::new(Scheduler::new(config.scheduler_capacity)),
                config,
                repo,
                factories,
                registry: Arc::new(TaskRegistry::new()),
                metrics: Arc::new(QueueMetrics::default()),
                accepting: AtomicBool::new(true),
                started: AtomicBool::new(false),
                shutdown_tx,
                workers: AsyncMutex::new(Vec::new()),
            }),
        }
    }

    /// Diagnostics label for this queue.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Registry of in-flight tasks, for mid-flight inspection.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Point-in-time copy of the queue counters.
    #[must_use]
    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Rehydrate pending tasks from the repository, then spin up workers.
    ///
    /// # Errors
    ///
    /// Returns an error when called twice or when the repository cannot be
    /// read during resume-on-start.
    pub async fn start(&self) -> QueueResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }
        self.inner.resume_pending().await?;

        let mut workers = self.inner.workers.lock().await;
        for worker in 0..self.inner.config.worker_count.max(1) {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            workers.push(tokio::spawn(worker_loop(inner, shutdown_rx, worker)));
        }
        info!(
            queue = %self.inner.config.name,
            workers = workers.len(),
            "queue started"
        );
        Ok(())
    }

    /// Admit a task; returns its queue-assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Shutdown`] after shutdown,
    /// [`QueueError::SchedulerFull`] at capacity, and persistence failures
    /// for persistent tasks.
    pub async fn submit(&self, task: Arc<dyn Task>) -> QueueResult<i64> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::Shutdown);
        }

        let correlation_id = Uuid::new_v4();
        let record = Arc::new(TaskRecord::new(Arc::clone(&task), correlation_id));
        record.set_status(TaskStatus::Queued);

        if task.persistent() {
            let mut row = record
                .snapshot_row()
                .map_err(|source| QueueError::State { source })?;
            self.inner
                .repo
                .create(&mut row)
                .await
                .map_err(|source| QueueError::Repository { source })?;
            record.set_id(row.id);
            record.mark_persisted();
            task.on_attached(&row);
        } else {
            record.set_id(self.inner.registry.next_transient_id());
        }
        task.on_status(TaskStatus::Queued);

        let id = record.id();
        self.inner.registry.insert(id, Arc::clone(&record));
        match self.inner.scheduler.queue(record, Utc::now()) {
            Ok(()) => {
                self.inner.metrics.task_submitted();
                debug!(
                    queue = %self.inner.config.name,
                    task_id = id,
                    kind = %task.kind(),
                    correlation_id = %correlation_id,
                    "task submitted"
                );
                Ok(id)
            }
            Err(err) => {
                self.inner.registry.remove(id);
                if task.persistent() {
                    if let Err(delete_err) = self.inner.repo.delete(id).await {
                        warn!(
                            error = %delete_err,
                            task_id = id,
                            "failed to prune task row after rejected submit"
                        );
                    }
                }
                match err {
                    SchedulerError::Full => Err(QueueError::SchedulerFull),
                    SchedulerError::Shutdown => Err(QueueError::Shutdown),
                }
            }
        }
    }

    /// Stop accepting work, drain the workers, and return once they exit.
    ///
    /// Idempotent; in-flight iterations are given the remainder of their
    /// execution budget before the worker lets go of them.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.scheduler.shutdown();
        let _ = self.inner.shutdown_tx.send(true);

        let mut workers = self.inner.workers.lock().await;
        for handle in workers.drain(..) {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(
                        queue = %self.inner.config.name,
                        "queue worker panicked during shutdown"
                    );
                }
            }
        }
        info!(queue = %self.inner.config.name, "queue shut down");
    }
}

impl QueueInner {
    fn is_shutting_down(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    async fn resume_pending(&self) -> QueueResult<()> {
        if self.config.resume_kinds.is_empty() {
            return Ok(());
        }
        let rows = self
            .repo
            .pending(&self.config.resume_kinds)
            .await
            .map_err(|source| QueueError::Repository { source })?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut resumed = 0_usize;
        for row in rows {
            let task = match self.factories.build(&row) {
                Ok(task) => task,
                Err(err) => {
                    warn!(
                        error = %err,
                        task_id = row.id,
                        kind = %row.kind,
                        "skipping unresumable task row"
                    );
                    continue;
                }
            };
            task.on_attached(&row);
            let record = Arc::new(TaskRecord::from_row(task, &row));
            let dispatch_at = if row.status == TaskStatus::Suspending {
                self.metrics.task_suspended();
                record.resume_at()
            } else {
                Utc::now()
            };
            self.registry.insert(row.id, Arc::clone(&record));
            match self.scheduler.queue(record, dispatch_at) {
                Ok(()) => resumed += 1,
                Err(SchedulerError::Full) => return Err(QueueError::SchedulerFull),
                Err(SchedulerError::Shutdown) => return Err(QueueError::Shutdown),
            }
        }
        info!(
            queue = %self.config.name,
            resumed,
            "resumed pending tasks from repository"
        );
        Ok(())
    }

    /// Validate, apply, and persist one lifecycle transition.
    async fn transition(&self, record: &Arc<TaskRecord>, to: TaskStatus) -> QueueResult<()> {
        let from = record.status();
        if !TaskStatus::can_transition(from, to) {
            warn!(
                queue = %self.config.name,
                task_id = record.id(),
                from = from.map_or("none", TaskStatus::as_str),
                to = %to,
                "illegal task status transition suppressed"
            );
            return Err(QueueError::IllegalTransition { from, to });
        }

        record.set_status(to);
        record.task().on_status(to);
        if from == Some(TaskStatus::Suspending) {
            self.metrics.task_resumed();
        }
        if to == TaskStatus::Suspending {
            self.metrics.task_suspended();
        }

        if record.persisted() {
            match record.snapshot_row() {
                Ok(row) => {
                    if let Err(err) = self.repo.update(&row).await {
                        error!(
                            error = %err,
                            task_id = row.id,
                            "failed to persist task transition"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        error = %err,
                        task_id = record.id(),
                        "failed to snapshot task state for persistence"
                    );
                }
            }
        }
        Ok(())
    }

    async fn run_task(&self, record: &Arc<TaskRecord>) {
        if self.transition(record, TaskStatus::Processing).await.is_err() {
            self.registry.remove(record.id());
            return;
        }

        let task = Arc::clone(record.task());
        let correlation_id = record.correlation_id();
        let owner = task.owner();

        loop {
            let cx = StepContext {
                task_id: record.id(),
                correlation_id,
                owner,
                attempt: record.retry_count(),
            };

            let remaining = self
                .config
                .max_task_execution
                .saturating_sub(record.executed());
            let iteration = if remaining.is_zero() {
                Err(IterationFailure::DeadlineExceeded)
            } else {
                self.run_iteration(record, &task, &cx, remaining).await
            };

            match iteration {
                Ok(StepOutcome::Continue) => {
                    if self.is_shutting_down() {
                        // Park the task as queued so the next boot resumes it.
                        let _ = self.transition(record, TaskStatus::Queued).await;
                        self.registry.remove(record.id());
                        return;
                    }
                }
                Ok(StepOutcome::Suspend { resume_at }) => {
                    self.suspend(record, &cx, resume_at).await;
                    return;
                }
                Ok(StepOutcome::Completed) => {
                    self.finalize(record, &cx, TaskStatus::Completed).await;
                    return;
                }
                Ok(StepOutcome::Cancelled) => {
                    self.finalize(record, &cx, TaskStatus::Cancelled).await;
                    return;
                }
                Err(failure) => {
                    self.handle_failure(record, &cx, failure).await;
                    return;
                }
            }
        }
    }

    async fn run_iteration(
        &self,
        record: &Arc<TaskRecord>,
        task: &Arc<dyn Task>,
        cx: &StepContext,
        remaining: Duration,
    ) -> Result<StepOutcome, IterationFailure> {
        let span = info_span!(
            "task_iteration",
            queue = %self.config.name,
            task_id = cx.task_id,
            kind = %task.kind(),
            correlation_id = %cx.correlation_id,
            attempt = cx.attempt,
        );
        let step_task = Arc::clone(task);
        let step_cx = cx.clone();
        let correlation_id = cx.correlation_id;

        let started = Instant::now();
        let mut handle = tokio::spawn(
            with_correlation_id(correlation_id, async move { step_task.step(&step_cx).await })
                .instrument(span),
        );
        let outcome = match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(step)) => step.map_err(|err| IterationFailure::Step {
                message: err.message,
                critical: err.critical,
            }),
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    Err(IterationFailure::Panicked)
                } else {
                    Err(IterationFailure::Step {
                        message: "task iteration was aborted".to_string(),
                        critical: true,
                    })
                }
            }
            Err(_elapsed) => {
                handle.abort();
                Err(IterationFailure::DeadlineExceeded)
            }
        };

        let elapsed = started.elapsed();
        record.add_executed(elapsed);
        task.on_iteration_complete(elapsed);
        outcome
    }

    async fn handle_failure(
        &self,
        record: &Arc<TaskRecord>,
        cx: &StepContext,
        failure: IterationFailure,
    ) {
        let (message, critical) = match failure {
            IterationFailure::Step { message, critical } => (message, critical),
            IterationFailure::Panicked => ("task iteration panicked".to_string(), true),
            IterationFailure::DeadlineExceeded => {
                ("task execution budget exhausted".to_string(), true)
            }
        };
        record.task().on_error(&message);
        record.record_error(&message);

        let retries = record.retry_count();
        if critical || retries >= self.config.max_retry || self.is_shutting_down() {
            warn!(
                queue = %self.config.name,
                task_id = record.id(),
                correlation_id = %cx.correlation_id,
                error = %message,
                critical,
                retries,
                "task failed terminally"
            );
            self.finalize(record, cx, TaskStatus::Failed).await;
            return;
        }

        let attempt = record.bump_retry();
        record.task().on_retry(attempt);
        let delay = self.config.retry_delay.unwrap_or_else(|| {
            backoff_delay(self.config.backoff_factor, self.config.backoff_max, attempt)
        });
        let resume_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        debug!(
            queue = %self.config.name,
            task_id = record.id(),
            correlation_id = %cx.correlation_id,
            error = %message,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "task failed; retry scheduled"
        );
        self.suspend(record, cx, resume_at).await;
    }

    async fn suspend(&self, record: &Arc<TaskRecord>, cx: &StepContext, resume_at: DateTime<Utc>) {
        record.task().on_suspend(resume_at);
        record.set_resume_at(resume_at);
        let _ = self.transition(record, TaskStatus::Suspending).await;

        if let Err(err) = self.scheduler.queue(Arc::clone(record), resume_at) {
            warn!(
                queue = %self.config.name,
                task_id = record.id(),
                error = %err,
                "failed to re-queue suspending task"
            );
            let message = match err {
                SchedulerError::Full => "scheduler full before task could be re-queued",
                SchedulerError::Shutdown => "queue shut down before task could be re-queued",
            };
            record.task().on_error(message);
            record.record_error(message);
            self.finalize(record, cx, TaskStatus::Failed).await;
        }
    }

    async fn finalize(&self, record: &Arc<TaskRecord>, cx: &StepContext, status: TaskStatus) {
        let _ = self.transition(record, status).await;
        match status {
            TaskStatus::Completed => self.metrics.task_succeeded(),
            TaskStatus::Failed => self.metrics.task_failed(),
            _ => {}
        }
        self.registry.remove(record.id());
        record.task().cleanup(cx, status).await;
    }
}

async fn worker_loop(
    inner: Arc<QueueInner>,
    mut shutdown_rx: watch::Receiver<bool>,
    worker: usize,
) {
    debug!(queue = %inner.config.name, worker, "queue worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if let Some(record) = inner.scheduler.request() {
            inner.metrics.worker_busy();
            inner.run_task(&record).await;
            inner.metrics.worker_idle();
        } else {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                () = tokio::time::sleep(inner.config.task_pull_interval) => {}
            }
        }
    }
    debug!(queue = %inner.config.name, worker, "queue worker stopped");
}

fn backoff_delay(factor: f64, max: Duration, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.min(64)).unwrap_or(i32::MAX);
    let seconds = factor.max(1.0).powi(exponent);
    if seconds.is_finite() && seconds < max.as_secs_f64() {
        Duration::from_secs_f64(seconds)
    } else {
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use crate::repo::MemoryTaskRepository;
    use crate::task::{PublicState, StepError, TaskRow};

    struct ScriptedTask {
        kind: &'static str,
        persistent: bool,
        script: Mutex<VecDeque<Result<StepOutcome, StepError>>>,
        steps: AtomicU32,
        cleanups: AtomicU32,
    }

    impl ScriptedTask {
        fn new(
            kind: &'static str,
            script: Vec<Result<StepOutcome, StepError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                kind,
                persistent: true,
                script: Mutex::new(script.into()),
                steps: AtomicU32::new(0),
                cleanups: AtomicU32::new(0),
            })
        }

        fn steps(&self) -> u32 {
            self.steps.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Task for ScriptedTask {
        fn kind(&self) -> &str {
            self.kind
        }

        fn persistent(&self) -> bool {
            self.persistent
        }

        async fn step(&self, _cx: &StepContext) -> Result<StepOutcome, StepError> {
            self.steps.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(StepOutcome::Completed))
        }

        async fn cleanup(&self, _cx: &StepContext, _final_status: TaskStatus) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingTask;

    #[async_trait::async_trait]
    impl Task for PanickingTask {
        fn kind(&self) -> &str {
            "panicking"
        }

        async fn step(&self, _cx: &StepContext) -> Result<StepOutcome, StepError> {
            panic!("scripted panic");
        }
    }

    struct SlowTask;

    #[async_trait::async_trait]
    impl Task for SlowTask {
        fn kind(&self) -> &str {
            "slow"
        }

        async fn step(&self, _cx: &StepContext) -> Result<StepOutcome, StepError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StepOutcome::Completed)
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            name: "test".to_string(),
            worker_count: 1,
            max_retry: 0,
            retry_delay: Some(Duration::from_millis(20)),
            task_pull_interval: Duration::from_millis(5),
            ..QueueConfig::default()
        }
    }

    fn build_queue(config: QueueConfig) -> (Queue, Arc<MemoryTaskRepository>) {
        let repo = Arc::new(MemoryTaskRepository::new());
        let queue = Queue::new(
            config,
            Arc::clone(&repo) as Arc<dyn TaskRepository>,
            Arc::new(TaskFactoryRegistry::new()),
        );
        (queue, repo)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached within timeout");
    }

    #[tokio::test]
    async fn single_shot_task_completes() {
        let (queue, repo) = build_queue(fast_config());
        queue.start().await.unwrap();

        let task = ScriptedTask::new("single", vec![Ok(StepOutcome::Completed)]);
        let id = queue.submit(task.clone()).await.unwrap();

        let probe = queue.clone();
        wait_for(move || probe.metrics().succeeded == 1).await;

        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed);
        assert!(queue.registry().is_empty());
        assert_eq!(task.cleanups.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_succeed() {
        let config = QueueConfig {
            max_retry: 3,
            ..fast_config()
        };
        let (queue, repo) = build_queue(config);
        queue.start().await.unwrap();

        let task = ScriptedTask::new(
            "flaky",
            vec![
                Err(StepError::retryable("first failure")),
                Err(StepError::retryable("second failure")),
                Ok(StepOutcome::Completed),
            ],
        );
        let id = queue.submit(task.clone()).await.unwrap();

        let probe = queue.clone();
        wait_for(move || probe.metrics().succeeded == 1).await;

        assert_eq!(task.steps(), 3);
        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed);
        assert_eq!(row.public_state.retry_count, 2);
        assert_eq!(
            row.public_state.error_history,
            vec!["first failure", "second failure"]
        );
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn critical_error_bypasses_retry() {
        let config = QueueConfig {
            max_retry: 5,
            ..fast_config()
        };
        let (queue, repo) = build_queue(config);
        queue.start().await.unwrap();

        let task = ScriptedTask::new("critical", vec![Err(StepError::critical("bad config"))]);
        let id = queue.submit(task.clone()).await.unwrap();

        let probe = queue.clone();
        wait_for(move || probe.metrics().failed == 1).await;

        assert_eq!(task.steps(), 1);
        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.public_state.retry_count, 0);
        assert_eq!(row.public_state.last_error.as_deref(), Some("bad config"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_terminally() {
        let config = QueueConfig {
            max_retry: 2,
            ..fast_config()
        };
        let (queue, repo) = build_queue(config);
        queue.start().await.unwrap();

        let task = ScriptedTask::new(
            "doomed",
            vec![
                Err(StepError::retryable("one")),
                Err(StepError::retryable("two")),
                Err(StepError::retryable("three")),
            ],
        );
        let id = queue.submit(task.clone()).await.unwrap();

        let probe = queue.clone();
        wait_for(move || probe.metrics().failed == 1).await;

        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        // Two retries were consumed before the third failure hit the budget.
        assert_eq!(row.public_state.retry_count, 2);
        assert_eq!(row.public_state.error_history.len(), 3);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_blocks_submission_without_writing_rows() {
        let (queue, repo) = build_queue(fast_config());
        queue.start().await.unwrap();
        queue.shutdown().await;

        let task = ScriptedTask::new("late", vec![Ok(StepOutcome::Completed)]);
        let result = queue.submit(task).await;
        assert!(matches!(result, Err(QueueError::Shutdown)));
        assert!(
            repo.pending(&["late".to_string()]).await.unwrap().is_empty(),
            "no row should have been written"
        );
    }

    #[tokio::test]
    async fn pre_seeded_suspending_row_is_resumed() {
        let repo = Arc::new(MemoryTaskRepository::new());
        let resumed_task = ScriptedTask::new("resumable", vec![Ok(StepOutcome::Completed)]);
        let factories = Arc::new(TaskFactoryRegistry::new());
        let factory_task = Arc::clone(&resumed_task);
        factories
            .register("resumable", move |_row| {
                Ok(Arc::clone(&factory_task) as Arc<dyn Task>)
            })
            .unwrap();

        let seeded = repo.seed(TaskRow {
            id: 0,
            kind: "resumable".to_string(),
            status: TaskStatus::Suspending,
            correlation_id: Uuid::new_v4(),
            owner_id: None,
            private_state: None,
            public_state: PublicState {
                resume_time: Utc::now().timestamp() - 1,
                ..PublicState::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let config = QueueConfig {
            resume_kinds: vec!["resumable".to_string()],
            ..fast_config()
        };
        let queue = Queue::new(
            config,
            Arc::clone(&repo) as Arc<dyn TaskRepository>,
            factories,
        );
        queue.start().await.unwrap();

        let probe = queue.clone();
        wait_for(move || probe.metrics().succeeded == 1).await;

        let row = repo.get(seeded).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed);
        assert_eq!(queue.metrics().suspended, 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn future_resume_time_is_respected() {
        let (queue, _repo) = build_queue(fast_config());
        queue.start().await.unwrap();

        let resume_at = Utc::now() + chrono::Duration::seconds(60);
        let task = ScriptedTask::new(
            "parked",
            vec![
                Ok(StepOutcome::Suspend { resume_at }),
                Ok(StepOutcome::Completed),
            ],
        );
        queue.submit(task.clone()).await.unwrap();

        let probe = queue.clone();
        wait_for(move || probe.metrics().suspended == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(task.steps(), 1, "suspended task must not be re-dispatched");
        assert_eq!(queue.metrics().succeeded, 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn panic_is_isolated_and_recorded() {
        let (queue, _repo) = build_queue(fast_config());
        queue.start().await.unwrap();

        let id = queue.submit(Arc::new(PanickingTask)).await.unwrap();
        let probe = queue.clone();
        wait_for(move || probe.metrics().failed == 1).await;
        assert!(queue.registry().get(id).is_none());

        // The worker survives and keeps serving tasks.
        let task = ScriptedTask::new("after-panic", vec![Ok(StepOutcome::Completed)]);
        queue.submit(task).await.unwrap();
        let probe = queue.clone();
        wait_for(move || probe.metrics().succeeded == 1).await;
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn execution_budget_terminates_slow_tasks() {
        let config = QueueConfig {
            max_task_execution: Duration::from_millis(50),
            ..fast_config()
        };
        let (queue, repo) = build_queue(config);
        queue.start().await.unwrap();

        let id = queue.submit(Arc::new(SlowTask)).await.unwrap();
        let probe = queue.clone();
        wait_for(move || probe.metrics().failed == 1).await;

        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(
            row.public_state.last_error.as_deref(),
            Some("task execution budget exhausted")
        );
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn scheduler_capacity_surfaces_backpressure() {
        let config = QueueConfig {
            scheduler_capacity: 1,
            // No workers pulling yet: do not start the queue.
            ..fast_config()
        };
        let (queue, _repo) = build_queue(config);

        let first = ScriptedTask::new("cap", vec![Ok(StepOutcome::Completed)]);
        queue.submit(first).await.unwrap();
        let second = ScriptedTask::new("cap", vec![Ok(StepOutcome::Completed)]);
        let result = queue.submit(second).await;
        assert!(matches!(result, Err(QueueError::SchedulerFull)));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(2.0, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2.0, max, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(2.0, max, 10), max);
    }
}
