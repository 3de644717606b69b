//! Persistence seam for stored jobs and the run ledger.
//!
//! The pipeline only talks to [`Store`]; `PgStore` backs production and
//! `MemoryStore` backs tests and local dry runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::import_run::{CounterDelta, FailureDetail, ImportRun, ImportStats};
use crate::models::job::{JobRecord, StoredJob};
use crate::models::source::FeedSource;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Look up a job by its natural key.
    async fn find_job(
        &self,
        external_id: &str,
        source: FeedSource,
    ) -> Result<Option<StoredJob>, StoreError>;

    /// Insert a new active job. Fails with [`StoreError::DuplicateKey`] when
    /// the natural key already exists.
    async fn insert_job(&self, record: &JobRecord) -> Result<StoredJob, StoreError>;

    /// Overwrite every field of an existing job.
    async fn update_job(&self, id: i64, record: &JobRecord) -> Result<(), StoreError>;

    async fn create_run(&self, source: FeedSource, feed_url: &str)
    -> Result<ImportRun, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError>;

    /// Set `total_fetched`. Returns false if the run is not running.
    async fn set_total_fetched(&self, id: Uuid, total: i32) -> Result<bool, StoreError>;

    /// Atomically add `delta` to the run's counters. Returns false if the run
    /// is not running, in which case nothing changed.
    async fn increment_counters(&self, id: Uuid, delta: CounterDelta) -> Result<bool, StoreError>;

    /// Atomically bump `failed_count` and append `detail`.
    async fn record_failure(&self, id: Uuid, detail: FailureDetail) -> Result<bool, StoreError>;

    /// Transition to `Completed` if the run is still running and its counter
    /// rule holds. Returns the terminal snapshot only for the caller that won
    /// the transition.
    async fn complete_run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError>;

    /// Transition to `Failed` if the run is still running.
    async fn fail_run(&self, id: Uuid, error: &str) -> Result<Option<ImportRun>, StoreError>;

    /// Newest first, with the total number of runs.
    async fn list_runs(&self, limit: i64, offset: i64)
    -> Result<(Vec<ImportRun>, i64), StoreError>;

    async fn run_stats(&self) -> Result<ImportStats, StoreError>;

    /// Delete runs started before `cutoff`. Returns the number removed.
    async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
