use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::import_run::{
    CounterDelta, FailureDetail, ImportRun, ImportStats, RunStatus,
};
use crate::models::job::{JobRecord, StoredJob};
use crate::models::source::FeedSource;
use crate::store::Store;

#[derive(Default)]
struct Inner {
    jobs: Vec<StoredJob>,
    next_job_id: i64,
    runs: HashMap<Uuid, ImportRun>,
}

/// In-process store. Every operation runs under one lock, which gives the
/// same atomicity the Postgres statements provide.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked mid-update;
        // the data is still usable for inspection.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(run: &mut ImportRun, status: RunStatus) {
        let now = Utc::now();
        run.status = status;
        run.completed_at = Some(now);
        run.duration_ms = Some((now - run.started_at).num_milliseconds());
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_job(
        &self,
        external_id: &str,
        source: FeedSource,
    ) -> Result<Option<StoredJob>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .iter()
            .find(|j| j.record.external_id == external_id && j.record.source == source)
            .cloned())
    }

    async fn insert_job(&self, record: &JobRecord) -> Result<StoredJob, StoreError> {
        let mut inner = self.lock();
        let exists = inner.jobs.iter().any(|j| {
            j.record.external_id == record.external_id && j.record.source == record.source
        });
        if exists {
            return Err(StoreError::DuplicateKey(record.natural_key()));
        }
        inner.next_job_id += 1;
        let now = Utc::now();
        let job = StoredJob {
            id: inner.next_job_id,
            record: record.clone(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.push(job.clone());
        Ok(job)
    }

    async fn update_job(&self, id: i64, record: &JobRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("Job {id} not found")))?;
        job.record = record.clone();
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn create_run(
        &self,
        source: FeedSource,
        feed_url: &str,
    ) -> Result<ImportRun, StoreError> {
        let run = ImportRun::new(source, feed_url);
        self.lock().runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError> {
        Ok(self.lock().runs.get(&id).cloned())
    }

    async fn set_total_fetched(&self, id: Uuid, total: i32) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Running => {
                run.total_fetched = total;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_counters(&self, id: Uuid, delta: CounterDelta) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Running => {
                run.total_imported += to_i32(delta.imported());
                run.new_count += to_i32(delta.new);
                run.updated_count += to_i32(delta.updated);
                run.unchanged_count += to_i32(delta.unchanged);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(&self, id: Uuid, detail: FailureDetail) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Running => {
                run.failed_count += 1;
                run.failure_details.push(detail);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_run(&self, id: Uuid) -> Result<Option<ImportRun>, StoreError> {
        let mut inner = self.lock();
        match inner.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Running && run.is_drained() => {
                Self::finish(run, RunStatus::Completed);
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn fail_run(&self, id: Uuid, error: &str) -> Result<Option<ImportRun>, StoreError> {
        let mut inner = self.lock();
        match inner.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Running => {
                run.error = Some(error.to_string());
                Self::finish(run, RunStatus::Failed);
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ImportRun>, i64), StoreError> {
        let inner = self.lock();
        let mut runs: Vec<ImportRun> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = runs.len() as i64;
        let page = runs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn run_stats(&self) -> Result<ImportStats, StoreError> {
        let inner = self.lock();
        let mut stats = ImportStats::default();
        for run in inner.runs.values() {
            stats.total_imports += 1;
            stats.total_jobs_fetched += i64::from(run.total_fetched);
            stats.total_jobs_imported += i64::from(run.total_imported);
            stats.total_new_jobs += i64::from(run.new_count);
            stats.total_updated_jobs += i64::from(run.updated_count);
            stats.total_unchanged_jobs += i64::from(run.unchanged_count);
            stats.total_failed_jobs += i64::from(run.failed_count);
            match run.status {
                RunStatus::Completed => stats.completed_imports += 1,
                RunStatus::Failed => stats.failed_imports += 1,
                RunStatus::Running => stats.running_imports += 1,
            }
        }
        Ok(stats)
    }

    async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.runs.len();
        inner.runs.retain(|_, run| run.started_at >= cutoff);
        Ok((before - inner.runs.len()) as u64)
    }
}
