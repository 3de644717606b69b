use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{
    ClaimedTask, EnqueueResult, FailOutcome, NewTask, QueueCounts, RetryPolicy, TaskQueue, status,
};

#[derive(Debug, Clone)]
struct MemTask {
    id: Uuid,
    run_id: Uuid,
    payload: serde_json::Value,
    status: &'static str,
    attempts: i32,
    dedupe_key: Option<String>,
    last_error: Option<String>,
    run_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

/// In-process queue with the same state machine as [`super::PgTaskQueue`].
/// Used by tests and single-process one-shot imports.
pub struct MemoryTaskQueue {
    name: String,
    policy: RetryPolicy,
    tasks: Mutex<Vec<MemTask>>,
}

impl MemoryTaskQueue {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MemTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Payloads of every task ever enqueued, oldest first.
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.lock().iter().map(|t| t.payload.clone()).collect()
    }

    /// Last recorded error for a task.
    pub fn last_error(&self, id: Uuid) -> Option<String> {
        self.lock()
            .iter()
            .find(|t| t.id == id)
            .and_then(|t| t.last_error.clone())
    }

    /// Make every delayed task due immediately.
    pub fn release_delayed(&self) {
        let now = Utc::now();
        for task in self.lock().iter_mut() {
            if task.status == status::PENDING && task.run_at > now {
                task.run_at = now;
            }
        }
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, task: NewTask) -> Result<EnqueueResult, QueueError> {
        let mut tasks = self.lock();
        if let Some(key) = &task.dedupe_key
            && let Some(existing) = tasks.iter().find(|t| t.dedupe_key.as_ref() == Some(key))
        {
            return Ok(EnqueueResult::Duplicate(existing.id));
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        tasks.push(MemTask {
            id,
            run_id: task.run_id,
            payload: task.payload,
            status: status::PENDING,
            attempts: 0,
            dedupe_key: task.dedupe_key,
            last_error: None,
            run_at: now + chrono_delay(task.delay),
            updated_at: now,
            finished_at: None,
        });
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError> {
        let now = Utc::now();
        let mut tasks = self.lock();

        let mut due: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == status::PENDING && t.run_at <= now)
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| tasks[i].run_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for i in due {
            let task = &mut tasks[i];
            task.status = status::ACTIVE;
            task.attempts += 1;
            task.updated_at = now;
            claimed.push(ClaimedTask {
                id: task.id,
                run_id: task.run_id,
                payload: task.payload.clone(),
                attempts: task.attempts,
                max_attempts: self.policy.max_attempts,
            });
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let mut tasks = self.lock();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(QueueError::NotFound(id))?;
        let now = Utc::now();
        task.status = status::COMPLETED;
        task.updated_at = now;
        task.finished_at = Some(now);
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let mut tasks = self.lock();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(QueueError::NotFound(id))?;

        let now = Utc::now();
        task.last_error = Some(error.to_string());
        task.updated_at = now;

        if retryable && task.attempts < self.policy.max_attempts {
            let delay = self.policy.backoff(task.attempts);
            task.status = status::PENDING;
            task.run_at = now + chrono_delay(delay);
            Ok(FailOutcome::Retrying { delay })
        } else {
            task.status = status::FAILED;
            task.finished_at = Some(now);
            Ok(FailOutcome::Exhausted)
        }
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = Utc::now();
        let mut counts = QueueCounts::default();
        for task in self.lock().iter() {
            match task.status {
                status::PENDING if task.run_at <= now => counts.waiting += 1,
                status::PENDING => counts.delayed += 1,
                status::ACTIVE => counts.active += 1,
                status::COMPLETED => counts.completed += 1,
                status::FAILED => counts.failed += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn pending_for_run(&self, run_id: Uuid) -> Result<i64, QueueError> {
        Ok(self
            .lock()
            .iter()
            .filter(|t| {
                t.run_id == run_id && (t.status == status::PENDING || t.status == status::ACTIVE)
            })
            .count() as i64)
    }

    async fn heartbeat(&self, ids: &[Uuid]) -> Result<u64, QueueError> {
        let now = Utc::now();
        let mut touched = 0;
        for task in self.lock().iter_mut() {
            if task.status == status::ACTIVE && ids.contains(&task.id) {
                task.updated_at = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn recover_stale(&self, stale_after: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = now - chrono_delay(stale_after);
        let mut recovered = 0;
        for task in self.lock().iter_mut() {
            if task.status == status::ACTIVE && task.updated_at <= cutoff {
                task.status = status::PENDING;
                task.run_at = now;
                task.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut tasks = self.lock();
        let len = tasks.len();
        tasks.retain(|t| !matches!(t.finished_at, Some(at) if at < before));
        Ok((len - tasks.len()) as u64)
    }
}
