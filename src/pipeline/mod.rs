//! The import pipeline.
//!
//! ```text
//! start_run ─► ledger (Running) ─► fetch queue ─► FetchStage ─► record queue
//!                                                     │               │
//!                                          total_fetched set    RecordStage
//!                                                                     │
//!                                            CompletionTracker ◄─ on_settled
//! ```

pub mod completion;
pub mod fetch;
pub mod process;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::error::{ImportError, StoreError};
use crate::feeds::FeedFetcher;
use crate::models::import_run::{ImportRun, ImportStats, RunPage};
use crate::models::source::FeedSource;
use crate::notify::RunNotifier;
use crate::queue::{FetchTask, NewTask, QueueCounts, QueueWorker, TaskQueue, WorkerConfig};
use crate::store::Store;

pub use completion::CompletionTracker;
pub use fetch::FetchStage;
pub use process::{RecordStage, UpsertEngine, UpsertOutcome};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Records per fan-out batch.
    pub batch_size: usize,
    /// Extra delay added per batch index.
    pub batch_stagger: Duration,
    /// Delay between run creation and the fetch task becoming due.
    pub fetch_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_stagger: Duration::from_secs(10),
            fetch_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    pub fetch: QueueCounts,
    pub record: QueueCounts,
}

/// Run trigger and read API over the ledger and the queues.
#[derive(Clone)]
pub struct ImportService {
    store: Arc<dyn Store>,
    fetch_queue: Arc<dyn TaskQueue>,
    record_queue: Arc<dyn TaskQueue>,
    config: PipelineConfig,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn Store>,
        fetch_queue: Arc<dyn TaskQueue>,
        record_queue: Arc<dyn TaskQueue>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            fetch_queue,
            record_queue,
            config,
        }
    }

    /// Create a `Running` run and schedule its fetch. Returns without waiting
    /// for any processing.
    pub async fn start_run(
        &self,
        source: FeedSource,
        feed_url: &str,
    ) -> Result<ImportRun, ImportError> {
        let feed_url = validate_feed_url(feed_url)?;
        let run = self.store.create_run(source, &feed_url).await?;

        let task = FetchTask {
            source,
            feed_url: feed_url.clone(),
            run_id: run.id,
        };
        let enqueued = match NewTask::new(run.id, &task) {
            Ok(t) => {
                self.fetch_queue
                    .enqueue(
                        t.with_delay(self.config.fetch_delay)
                            .with_dedupe_key(format!("fetch:{}", run.id)),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = enqueued {
            // Nothing is queued for this run, so it can never complete.
            if let Err(fail_err) = self
                .store
                .fail_run(run.id, &format!("Failed to enqueue fetch: {e}"))
                .await
            {
                tracing::error!(run_id = %run.id, "Failed to mark run failed: {fail_err}");
            }
            return Err(e.into());
        }

        tracing::info!(run_id = %run.id, %source, feed_url = %feed_url, "Import run started");
        Ok(run)
    }

    pub async fn get_run(&self, id: Uuid) -> Result<ImportRun, ImportError> {
        self.store
            .get_run(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Import run {id} not found")).into())
    }

    /// Newest first. `page` is 1-based; `limit` is clamped to
    /// `1..=MAX_PAGE_LIMIT`.
    pub async fn history(&self, page: i64, limit: i64) -> Result<RunPage, ImportError> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = (page - 1).saturating_mul(limit);
        let (imports, total) = self.store.list_runs(limit, offset).await?;
        Ok(RunPage::new(imports, page, limit, total))
    }

    pub async fn stats(&self) -> Result<ImportStats, ImportError> {
        Ok(self.store.run_stats().await?)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, ImportError> {
        Ok(QueueStatus {
            fetch: self.fetch_queue.counts().await?,
            record: self.record_queue.counts().await?,
        })
    }
}

fn validate_feed_url(feed_url: &str) -> Result<String, ImportError> {
    let trimmed = feed_url.trim();
    let url = Url::parse(trimmed).map_err(|_| ImportError::InvalidFeedUrl(trimmed.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ImportError::InvalidFeedUrl(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Everything needed to run imports in one process: the service plus the
/// two stage handlers sharing one completion tracker.
pub struct ImportPipeline {
    service: ImportService,
    fetch_stage: Arc<FetchStage>,
    record_stage: Arc<RecordStage>,
    fetch_queue: Arc<dyn TaskQueue>,
    record_queue: Arc<dyn TaskQueue>,
}

impl ImportPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        fetch_queue: Arc<dyn TaskQueue>,
        record_queue: Arc<dyn TaskQueue>,
        fetcher: Arc<dyn FeedFetcher>,
        notifier: RunNotifier,
        config: PipelineConfig,
    ) -> Self {
        let tracker = Arc::new(CompletionTracker::new(
            store.clone(),
            record_queue.clone(),
            notifier,
        ));
        let fetch_stage = Arc::new(FetchStage::new(
            fetcher,
            store.clone(),
            record_queue.clone(),
            tracker.clone(),
            config.clone(),
        ));
        let record_stage = Arc::new(RecordStage::new(store.clone(), tracker));
        let service = ImportService::new(store, fetch_queue.clone(), record_queue.clone(), config);

        Self {
            service,
            fetch_stage,
            record_stage,
            fetch_queue,
            record_queue,
        }
    }

    pub fn service(&self) -> &ImportService {
        &self.service
    }

    pub fn fetch_worker(&self, config: WorkerConfig) -> QueueWorker<FetchStage> {
        QueueWorker::new(self.fetch_queue.clone(), self.fetch_stage.clone(), config)
    }

    pub fn record_worker(&self, config: WorkerConfig) -> QueueWorker<RecordStage> {
        QueueWorker::new(self.record_queue.clone(), self.record_stage.clone(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::import_run::RunStatus;
    use crate::queue::{MemoryTaskQueue, RetryPolicy};
    use crate::store::MemoryStore;

    fn service() -> (ImportService, Arc<MemoryStore>, Arc<MemoryTaskQueue>) {
        let store = Arc::new(MemoryStore::new());
        let fetch = Arc::new(MemoryTaskQueue::new(
            "fetch",
            RetryPolicy::new(3, Duration::ZERO),
        ));
        let record = Arc::new(MemoryTaskQueue::new(
            "record",
            RetryPolicy::new(3, Duration::ZERO),
        ));
        let service = ImportService::new(
            store.clone(),
            fetch.clone(),
            record,
            PipelineConfig::default(),
        );
        (service, store, fetch)
    }

    #[tokio::test]
    async fn start_run_schedules_delayed_fetch() {
        let (service, _store, fetch) = service();
        let run = service
            .start_run(FeedSource::Jobicy, " https://jobicy.com/?feed=job_feed ")
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.feed_url, "https://jobicy.com/?feed=job_feed");

        let counts = fetch.counts().await.unwrap();
        assert_eq!(counts.delayed, 1);
        let payloads = fetch.payloads();
        assert_eq!(payloads[0]["run_id"], run.id.to_string());
        assert_eq!(payloads[0]["source"], "jobicy");
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let (service, store, _fetch) = service();
        for url in ["", "not a url", "ftp://jobicy.com/feed", "file:///etc/passwd"] {
            let err = service.start_run(FeedSource::Jobicy, url).await.unwrap_err();
            assert!(matches!(err, ImportError::InvalidFeedUrl(_)), "{url}");
        }
        assert_eq!(store.run_stats().await.unwrap().total_imports, 0);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let (service, _store, _fetch) = service();
        let err = service.get_run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ImportError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn history_paginates_newest_first() {
        let (service, _store, _fetch) = service();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = service
                .start_run(FeedSource::HigherEdJobs, "https://www.higheredjobs.com/rss/articleFeed.cfm")
                .await
                .unwrap();
            ids.push(run.id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let first = service.history(1, 2).await.unwrap();
        assert_eq!(first.imports.len(), 2);
        assert_eq!(first.imports[0].id, ids[2]);
        assert_eq!(first.total_count, 3);
        assert_eq!(first.total_pages, 2);
        assert!(first.has_more);

        let second = service.history(2, 2).await.unwrap();
        assert_eq!(second.imports.len(), 1);
        assert!(!second.has_more);

        let clamped = service.history(0, 0).await.unwrap();
        assert_eq!(clamped.page, 1);
        assert_eq!(clamped.limit, 1);
    }

    #[tokio::test]
    async fn queue_status_reports_both_channels() {
        let (service, _store, _fetch) = service();
        service
            .start_run(FeedSource::Jobicy, "https://jobicy.com/?feed=job_feed")
            .await
            .unwrap();
        let status = service.queue_status().await.unwrap();
        assert_eq!(status.fetch.depth(), 1);
        assert_eq!(status.record.depth(), 0);
    }
}
