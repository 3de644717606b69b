use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::feeds::FeedFetcher;
use crate::models::job::JobRecord;
use crate::pipeline::PipelineConfig;
use crate::pipeline::completion::CompletionTracker;
use crate::queue::{FetchTask, NewTask, RecordTask, TaskError, TaskHandler, TaskQueue};
use crate::store::Store;

/// Fetch-stage handler: retrieves one feed, records how many postings it
/// holds, and fans them out to the record queue.
pub struct FetchStage {
    fetcher: Arc<dyn FeedFetcher>,
    store: Arc<dyn Store>,
    record_queue: Arc<dyn TaskQueue>,
    tracker: Arc<CompletionTracker>,
    config: PipelineConfig,
}

impl FetchStage {
    pub fn new(
        fetcher: Arc<dyn FeedFetcher>,
        store: Arc<dyn Store>,
        record_queue: Arc<dyn TaskQueue>,
        tracker: Arc<CompletionTracker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            record_queue,
            tracker,
            config,
        }
    }

    /// Enqueue one record task per posting. Records are grouped into batches
    /// of `batch_size`; batch `k` becomes due `k * batch_stagger` from now.
    async fn fan_out(&self, task: &FetchTask, records: Vec<JobRecord>) -> Result<usize, QueueError> {
        let batch_size = self.config.batch_size.max(1);
        let mut created = 0;

        for (index, record) in records.into_iter().enumerate() {
            let batch = u32::try_from(index / batch_size).unwrap_or(u32::MAX);
            let dedupe_key = format!("record:{}:{}", task.run_id, record.external_id);
            let payload = RecordTask {
                record,
                source: task.source,
                run_id: task.run_id,
            };
            let result = self
                .record_queue
                .enqueue(
                    NewTask::new(task.run_id, &payload)?
                        .with_delay(self.config.batch_stagger.saturating_mul(batch))
                        .with_dedupe_key(dedupe_key),
                )
                .await?;
            if result.is_created() {
                created += 1;
            }
        }
        Ok(created)
    }
}

/// Keep one record per external id. The last occurrence wins and takes the
/// position of the first.
fn collapse_duplicates(records: Vec<JobRecord>) -> Vec<JobRecord> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut unique: Vec<JobRecord> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(&record.external_id) {
            Some(&i) => unique[i] = record,
            None => {
                positions.insert(record.external_id.clone(), unique.len());
                unique.push(record);
            }
        }
    }
    unique
}

#[async_trait]
impl TaskHandler for FetchStage {
    type Task = FetchTask;

    async fn handle(&self, task: &FetchTask) -> Result<(), TaskError> {
        let run_id = task.run_id;

        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        let run = match run {
            None => {
                tracing::warn!(%run_id, "Fetch task for unknown run, skipping");
                return Ok(());
            }
            Some(run) if run.is_terminal() => {
                tracing::info!(%run_id, status = %run.status, "Run already finished, skipping fetch");
                return Ok(());
            }
            Some(run) => run,
        };

        let fetched = self
            .fetcher
            .fetch(task.source, &task.feed_url)
            .await
            .map_err(|e| TaskError {
                message: e.to_string(),
                retryable: e.is_retryable(),
            })?;
        let raw_count = fetched.len();
        let records = collapse_duplicates(fetched);
        if records.len() < raw_count {
            tracing::info!(
                %run_id,
                duplicates = raw_count - records.len(),
                "Collapsed duplicate postings in feed"
            );
        }

        // A redelivered fetch keeps the total from the first attempt; its
        // fan-out only fills in record tasks the first attempt never queued.
        let fetched_total = i32::try_from(records.len()).unwrap_or(i32::MAX);
        let total = if run.total_fetched > 0 {
            if run.total_fetched != fetched_total {
                tracing::warn!(
                    %run_id,
                    recorded = run.total_fetched,
                    fetched = fetched_total,
                    "Feed changed since the first fetch, keeping the recorded total"
                );
            }
            run.total_fetched
        } else {
            let running = self
                .store
                .set_total_fetched(run_id, fetched_total)
                .await
                .map_err(|e| TaskError::retryable(e.to_string()))?;
            if !running {
                tracing::info!(%run_id, "Run finished while fetching, dropping records");
                return Ok(());
            }
            fetched_total
        };

        let created = self
            .fan_out(task, records)
            .await
            .map_err(|e| TaskError::retryable(format!("Failed to enqueue records: {e}")))?;
        tracing::info!(%run_id, source = %task.source, total, created, "Queued records");

        if let Err(e) = self.tracker.evaluate(run_id).await {
            tracing::error!(%run_id, "Completion check failed: {e}");
        }
        Ok(())
    }

    async fn on_exhausted(&self, task: &FetchTask, error: &QueueError) {
        let message = match error {
            QueueError::RetryExhausted { last_error, .. } => last_error.clone(),
            other => other.to_string(),
        };
        if let Err(e) = self.tracker.fail(task.run_id, &message).await {
            tracing::error!(run_id = %task.run_id, "Failed to mark run failed: {e}");
        }
    }
}
