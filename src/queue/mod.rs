//! Durable task queues for the two pipeline stages.
//!
//! A queue stores JSON payloads with retry metadata. Delivery is
//! at-least-once: a task is claimed, handled, then completed or failed; a
//! failed task is re-queued with exponential backoff until its attempts run
//! out.
//!
//! ```text
//! enqueue ─► pending ──claim──► active ──complete──► completed
//!              ▲                  │
//!              └──── backoff ─────┤ fail (attempts left)
//!                                 └──── fail (exhausted) ──► failed
//! ```

pub mod memory;
pub mod postgres;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::job::JobRecord;
use crate::models::source::FeedSource;

pub use memory::MemoryTaskQueue;
pub use postgres::PgTaskQueue;
pub use worker::{QueueWorker, TaskError, TaskHandler, WorkerConfig};

pub const FETCH_QUEUE: &str = "fetch";
pub const RECORD_QUEUE: &str = "record";

/// Retrieve and parse one feed for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchTask {
    pub source: FeedSource,
    pub feed_url: String,
    pub run_id: Uuid,
}

/// Dedup/upsert one fetched record into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordTask {
    pub record: JobRecord,
    pub source: FeedSource,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    const MAX_BACKOFF: Duration = Duration::from_secs(3600);

    pub fn new(max_attempts: i32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the retry that follows attempt number `attempts`
    /// (1-based): `base * 2^(attempts - 1)`, capped at one hour.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = (attempts.max(1) - 1).min(20) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(Self::MAX_BACKOFF)
    }
}

/// A task about to be enqueued.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub run_id: Uuid,
    pub payload: serde_json::Value,
    pub delay: Duration,
    pub dedupe_key: Option<String>,
}

impl NewTask {
    pub fn new<T: Serialize>(run_id: Uuid, task: &T) -> Result<Self, QueueError> {
        Ok(Self {
            run_id,
            payload: serde_json::to_value(task)?,
            delay: Duration::ZERO,
            dedupe_key: None,
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Only one task per queue may carry a given key.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Created(Uuid),
    /// A task with the same dedupe key already exists.
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn task_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// A task handed to a worker. `attempts` already includes this delivery.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub delayed: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueCounts {
    /// Tasks not yet finished.
    pub fn depth(&self) -> i64 {
        self.waiting + self.active + self.delayed
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue(&self, task: NewTask) -> Result<EnqueueResult, QueueError>;

    /// Claim up to `limit` due tasks, marking them active and counting an
    /// attempt.
    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedTask>, QueueError>;

    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Record a failed attempt. Retryable failures with attempts left go back
    /// to pending after the policy's backoff.
    async fn fail(&self, id: Uuid, error: &str, retryable: bool)
    -> Result<FailOutcome, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Pending or active tasks belonging to one run.
    async fn pending_for_run(&self, run_id: Uuid) -> Result<i64, QueueError>;

    /// Mark the given active tasks as still held by a live worker.
    async fn heartbeat(&self, ids: &[Uuid]) -> Result<u64, QueueError>;

    /// Return tasks stuck in `active` for longer than `stale_after` to
    /// pending. Returns how many were recovered.
    async fn recover_stale(&self, stale_after: Duration) -> Result<u64, QueueError>;

    /// Delete completed and failed tasks finished before `before`.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, QueueError>;
}

/// Status values persisted for tasks.
pub(crate) mod status {
    pub const PENDING: &str = "pending";
    pub const ACTIVE: &str = "active";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}
