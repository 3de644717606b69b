use std::sync::Arc;

use uuid::Uuid;

use crate::error::ImportError;
use crate::models::import_run::ImportRun;
use crate::notify::RunNotifier;
use crate::queue::TaskQueue;
use crate::store::Store;

/// Decides when a run is done and performs its terminal transitions.
///
/// The counter rule (`processed >= total_fetched`) is authoritative. When it
/// does not hold but the run has no record tasks left in the queue, the run
/// is re-read and the rule checked again; a run whose counters are still
/// behind stays `Running` and is logged. Every transition is a conditional
/// write, so concurrent evaluations publish at most one event.
pub struct CompletionTracker {
    store: Arc<dyn Store>,
    record_queue: Arc<dyn TaskQueue>,
    notifier: RunNotifier,
}

impl CompletionTracker {
    pub fn new(
        store: Arc<dyn Store>,
        record_queue: Arc<dyn TaskQueue>,
        notifier: RunNotifier,
    ) -> Self {
        Self {
            store,
            record_queue,
            notifier,
        }
    }

    /// Returns the terminal snapshot if this call completed the run.
    pub async fn evaluate(&self, run_id: Uuid) -> Result<Option<ImportRun>, ImportError> {
        if let Some(run) = self.store.complete_run(run_id).await? {
            self.finished(&run);
            return Ok(Some(run));
        }

        let pending = self.record_queue.pending_for_run(run_id).await?;
        if pending > 0 {
            return Ok(None);
        }

        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(None);
        };
        if run.is_terminal() {
            return Ok(None);
        }
        if !run.is_drained() {
            tracing::warn!(
                %run_id,
                processed = run.processed(),
                total_fetched = run.total_fetched,
                "Record queue drained but run counters are behind"
            );
            return Ok(None);
        }

        let completed = self.store.complete_run(run_id).await?;
        if let Some(run) = &completed {
            self.finished(run);
        }
        Ok(completed)
    }

    /// Fail a running run. Returns the terminal snapshot if this call made
    /// the transition.
    pub async fn fail(&self, run_id: Uuid, error: &str) -> Result<Option<ImportRun>, ImportError> {
        let failed = self.store.fail_run(run_id, error).await?;
        if let Some(run) = &failed {
            tracing::error!(%run_id, source = %run.source, "Import run failed: {error}");
            self.notifier.publish(run);
        }
        Ok(failed)
    }

    fn finished(&self, run: &ImportRun) {
        tracing::info!(
            run_id = %run.id,
            source = %run.source,
            fetched = run.total_fetched,
            new = run.new_count,
            updated = run.updated_count,
            unchanged = run.unchanged_count,
            failed = run.failed_count,
            duration_ms = run.duration_ms,
            "Import run completed"
        );
        self.notifier.publish(run);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::models::import_run::{CounterDelta, RunStatus};
    use crate::models::source::FeedSource;
    use crate::queue::{MemoryTaskQueue, NewTask, RetryPolicy};
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryTaskQueue>,
        notifier: RunNotifier,
        tracker: CompletionTracker,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new(
            "record",
            RetryPolicy::new(3, Duration::ZERO),
        ));
        let notifier = RunNotifier::default();
        let tracker = CompletionTracker::new(store.clone(), queue.clone(), notifier.clone());
        Fixture {
            store,
            queue,
            notifier,
            tracker,
        }
    }

    #[tokio::test]
    async fn completes_once_counters_catch_up() {
        let f = fixture();
        let mut rx = f.notifier.subscribe();
        let run = f.store.create_run(FeedSource::Jobicy, "u").await.unwrap();
        f.store.set_total_fetched(run.id, 2).await.unwrap();
        f.queue
            .enqueue(NewTask::new(run.id, &json!({})).unwrap())
            .await
            .unwrap();

        f.store
            .increment_counters(run.id, CounterDelta::inserted())
            .await
            .unwrap();
        assert!(f.tracker.evaluate(run.id).await.unwrap().is_none());

        f.store
            .increment_counters(run.id, CounterDelta::updated())
            .await
            .unwrap();
        let done = f.tracker.evaluate(run.id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(rx.recv().await.unwrap().id, run.id);

        // Already terminal: nothing changes and nothing is published.
        assert!(f.tracker.evaluate(run.id).await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn drained_queue_does_not_override_counter_rule() {
        let f = fixture();
        let run = f.store.create_run(FeedSource::Jobicy, "u").await.unwrap();
        f.store.set_total_fetched(run.id, 3).await.unwrap();
        f.store
            .increment_counters(run.id, CounterDelta::inserted())
            .await
            .unwrap();

        assert!(f.tracker.evaluate(run.id).await.unwrap().is_none());
        let run = f.store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn fail_publishes_once() {
        let f = fixture();
        let mut rx = f.notifier.subscribe();
        let run = f.store.create_run(FeedSource::Jobicy, "u").await.unwrap();

        let failed = f.tracker.fail(run.id, "timeout").await.unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(f.tracker.fail(run.id, "again").await.unwrap().is_none());

        assert_eq!(rx.recv().await.unwrap().error.as_deref(), Some("timeout"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_run_is_ignored() {
        let f = fixture();
        assert!(f.tracker.evaluate(Uuid::new_v4()).await.unwrap().is_none());
    }
}
