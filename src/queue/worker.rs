use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{ClaimedTask, FailOutcome, TaskQueue};

/// A handler failure. Retryable failures are re-queued while the task has
/// attempts left.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Task: DeserializeOwned + Send + Sync + 'static;

    async fn handle(&self, task: &Self::Task) -> Result<(), TaskError>;

    /// Called once when a task fails for the last time.
    async fn on_exhausted(&self, _task: &Self::Task, _error: &QueueError) {}

    /// Called after a task reaches a final state, success or exhaustion.
    async fn on_settled(&self, _task: &Self::Task) {}
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum tasks handled at once.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Active tasks without a heartbeat for this long are assumed orphaned
    /// and returned to pending. Held tasks are heartbeated every quarter of
    /// this interval.
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(30),
        }
    }
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(5);

fn lock(held: &Mutex<HashSet<Uuid>>) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
    held.lock().unwrap_or_else(|e| e.into_inner())
}

/// Pulls tasks from one queue and runs them through a handler with bounded
/// concurrency.
pub struct QueueWorker<H: TaskHandler> {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<H>,
    config: WorkerConfig,
}

impl<H: TaskHandler> QueueWorker<H> {
    pub fn new(queue: Arc<dyn TaskQueue>, handler: Arc<H>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config: WorkerConfig {
                concurrency: config.concurrency.max(1),
                ..config
            },
        }
    }

    /// Poll until `cancel` fires, then wait for in-flight tasks to finish.
    ///
    /// Alongside polling, the worker heartbeats the tasks it holds and
    /// returns stale active tasks to pending, so work orphaned by a crashed
    /// process is redelivered within `stale_after`.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), QueueError> {
        let name = self.queue.name().to_string();

        let stale = self.queue.recover_stale(self.config.stale_after).await?;
        if stale > 0 {
            tracing::warn!(queue = %name, "Recovered {stale} stale active tasks");
        }

        tracing::info!(
            queue = %name,
            concurrency = self.config.concurrency,
            "Worker started, polling every {:?}",
            self.config.poll_interval
        );

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let held: Arc<Mutex<HashSet<Uuid>>> = Arc::default();

        let sweep_every = (self.config.stale_after / 4).max(MIN_SWEEP_INTERVAL);
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep(&name, &held).await;
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let limit = permits.available_permits() + 1;
            let tasks = match self.queue.claim(limit).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::error!(queue = %name, "Failed to claim tasks: {e}");
                    Vec::new()
                }
            };

            if tasks.is_empty() {
                drop(first);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        self.sweep(&name, &held).await;
                        continue;
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                }
            }

            let mut first = Some(first);
            for task in tasks {
                let permit = match first.take() {
                    Some(p) => p,
                    None => match permits.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                let task_id = task.id;
                lock(&held).insert(task_id);

                let queue = self.queue.clone();
                let handler = self.handler.clone();
                let held = held.clone();
                tokio::spawn(async move {
                    process(queue.as_ref(), handler.as_ref(), task).await;
                    lock(&held).remove(&task_id);
                    drop(permit);
                });
            }
        }

        tracing::info!(queue = %name, "Shutdown signal received, draining in-flight tasks");
        let total = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        let _ = permits.acquire_many(total).await;
        tracing::info!(queue = %name, "Worker stopped");
        Ok(())
    }

    /// Heartbeat held tasks, then reclaim tasks whose holder went quiet.
    async fn sweep(&self, name: &str, held: &Mutex<HashSet<Uuid>>) {
        let ids: Vec<Uuid> = lock(held).iter().copied().collect();
        if let Err(e) = self.queue.heartbeat(&ids).await {
            tracing::error!(queue = %name, "Failed to heartbeat held tasks: {e}");
        }
        match self.queue.recover_stale(self.config.stale_after).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(queue = %name, "Recovered {n} stale active tasks"),
            Err(e) => tracing::error!(queue = %name, "Failed to recover stale tasks: {e}"),
        }
    }

    /// Claim one batch of due tasks and handle them all. Returns how many
    /// were handled.
    pub async fn run_once(&self) -> Result<usize, QueueError> {
        let tasks = self.queue.claim(self.config.concurrency).await?;
        let count = tasks.len();
        futures::future::join_all(
            tasks
                .into_iter()
                .map(|task| process(self.queue.as_ref(), self.handler.as_ref(), task)),
        )
        .await;
        Ok(count)
    }

    /// Handle batches until no task is due.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        loop {
            let handled = self.run_once().await?;
            if handled == 0 {
                return Ok(total);
            }
            total += handled;
        }
    }
}

async fn process<H: TaskHandler>(queue: &dyn TaskQueue, handler: &H, task: ClaimedTask) {
    let typed: H::Task = match serde_json::from_value(task.payload) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(queue = queue.name(), task_id = %task.id, "Undecodable payload: {e}");
            if let Err(e) = queue
                .fail(task.id, &format!("Undecodable payload: {e}"), false)
                .await
            {
                tracing::error!(queue = queue.name(), task_id = %task.id, "Failed to mark task failed: {e}");
            }
            return;
        }
    };

    match handler.handle(&typed).await {
        Ok(()) => {
            if let Err(e) = queue.complete(task.id).await {
                tracing::error!(queue = queue.name(), task_id = %task.id, "Failed to complete task: {e}");
            }
            handler.on_settled(&typed).await;
        }
        Err(err) => match queue.fail(task.id, &err.message, err.retryable).await {
            Ok(FailOutcome::Retrying { delay }) => {
                tracing::warn!(
                    queue = queue.name(),
                    task_id = %task.id,
                    attempt = task.attempts,
                    max_attempts = task.max_attempts,
                    "Task failed, retrying in {delay:?}: {err}"
                );
            }
            Ok(FailOutcome::Exhausted) => {
                tracing::error!(
                    queue = queue.name(),
                    task_id = %task.id,
                    attempts = task.attempts,
                    "Task failed permanently: {err}"
                );
                let exhausted = QueueError::RetryExhausted {
                    task_id: task.id,
                    attempts: task.attempts,
                    last_error: err.message,
                };
                handler.on_exhausted(&typed, &exhausted).await;
                handler.on_settled(&typed).await;
            }
            Err(e) => {
                tracing::error!(queue = queue.name(), task_id = %task.id, "Failed to record task failure: {e}");
            }
        },
    }
}
