use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{QueueError, RecordError, StoreError};
use crate::models::import_run::{CounterDelta, FailureDetail};
use crate::models::job::JobRecord;
use crate::pipeline::completion::CompletionTracker;
use crate::queue::{RecordTask, TaskError, TaskHandler};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
    Unchanged(i64),
}

impl UpsertOutcome {
    pub fn job_id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => {
                *id
            }
        }
    }

    fn delta(&self) -> CounterDelta {
        match self {
            UpsertOutcome::Inserted(_) => CounterDelta::inserted(),
            UpsertOutcome::Updated(_) => CounterDelta::updated(),
            UpsertOutcome::Unchanged(_) => CounterDelta::unchanged(),
        }
    }
}

/// Applies one fetched record to the job store and the run's counters.
pub struct UpsertEngine {
    store: Arc<dyn Store>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Upsert the record and count the outcome against the run. A failed
    /// upsert is recorded on the run and returns `Ok(None)`; only a failure to
    /// record that failure is returned as an error.
    pub async fn apply(&self, task: &RecordTask) -> Result<Option<UpsertOutcome>, StoreError> {
        match self.upsert_and_count(task).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                tracing::warn!(run_id = %task.run_id, "Record failed: {e}");
                self.record_failure(task.run_id, &task.record, &e.to_string())
                    .await?;
                Ok(None)
            }
        }
    }

    /// Bump `failed_count` and append a failure detail for the record.
    pub async fn record_failure(
        &self,
        run_id: Uuid,
        record: &JobRecord,
        error: &str,
    ) -> Result<(), StoreError> {
        let detail = FailureDetail {
            record_key: record.natural_key(),
            error: error.to_string(),
            timestamp: Utc::now(),
        };
        if !self.store.record_failure(run_id, detail).await? {
            tracing::debug!(%run_id, "Run no longer running, failure not counted");
        }
        Ok(())
    }

    async fn upsert_and_count(&self, task: &RecordTask) -> Result<UpsertOutcome, RecordError> {
        let record = &task.record;
        let outcome = self.upsert(record).await.map_err(|source| RecordError::Upsert {
            key: record.natural_key(),
            source,
        })?;

        let counted = self
            .store
            .increment_counters(task.run_id, outcome.delta())
            .await
            .map_err(|source| RecordError::Upsert {
                key: record.natural_key(),
                source,
            })?;
        if !counted {
            tracing::debug!(run_id = %task.run_id, "Run no longer running, outcome not counted");
        }
        Ok(outcome)
    }

    async fn upsert(&self, record: &JobRecord) -> Result<UpsertOutcome, StoreError> {
        match self.store.find_job(&record.external_id, record.source).await? {
            None => {
                let job = self.store.insert_job(record).await?;
                Ok(UpsertOutcome::Inserted(job.id))
            }
            Some(existing) if existing.differs_from(record) => {
                self.store.update_job(existing.id, record).await?;
                Ok(UpsertOutcome::Updated(existing.id))
            }
            Some(existing) => Ok(UpsertOutcome::Unchanged(existing.id)),
        }
    }
}

/// Process-stage handler: one record task per call.
pub struct RecordStage {
    engine: UpsertEngine,
    tracker: Arc<CompletionTracker>,
}

impl RecordStage {
    pub fn new(store: Arc<dyn Store>, tracker: Arc<CompletionTracker>) -> Self {
        Self {
            engine: UpsertEngine::new(store),
            tracker,
        }
    }
}

#[async_trait]
impl TaskHandler for RecordStage {
    type Task = RecordTask;

    async fn handle(&self, task: &RecordTask) -> Result<(), TaskError> {
        self.engine
            .apply(task)
            .await
            .map(|_| ())
            .map_err(|e| TaskError::retryable(format!("Failed to record failure: {e}")))
    }

    async fn on_exhausted(&self, task: &RecordTask, error: &QueueError) {
        if let Err(e) = self
            .engine
            .record_failure(task.run_id, &task.record, &error.to_string())
            .await
        {
            tracing::error!(
                run_id = %task.run_id,
                record_key = %task.record.natural_key(),
                "Dropping record failure after retries: {e}"
            );
        }
    }

    async fn on_settled(&self, task: &RecordTask) {
        if let Err(e) = self.tracker.evaluate(task.run_id).await {
            tracing::error!(run_id = %task.run_id, "Completion check failed: {e}");
        }
    }
}
