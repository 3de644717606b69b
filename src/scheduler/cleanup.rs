use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ImportError;
use crate::queue::TaskQueue;
use crate::scheduler::{Clock, ScheduledAction};
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub runs_deleted: u64,
    pub tasks_purged: u64,
}

/// Deletes runs older than the retention window, plus finished queue rows
/// older than the same cutoff.
pub struct RetentionCleanup {
    store: Arc<dyn Store>,
    queues: Vec<Arc<dyn TaskQueue>>,
    retention: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl RetentionCleanup {
    pub fn new(
        store: Arc<dyn Store>,
        queues: Vec<Arc<dyn TaskQueue>>,
        retention_days: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queues,
            retention: chrono::Duration::days(i64::from(retention_days)),
            clock,
        }
    }

    pub async fn sweep(&self) -> Result<CleanupReport, ImportError> {
        let cutoff = self.clock.now() - self.retention;
        tracing::info!(%cutoff, "Cleaning up import runs");

        let runs_deleted = self.store.delete_runs_before(cutoff).await?;
        let mut tasks_purged = 0;
        for queue in &self.queues {
            tasks_purged += queue.purge_finished(cutoff).await?;
        }

        tracing::info!(runs_deleted, tasks_purged, "Cleanup completed");
        Ok(CleanupReport {
            runs_deleted,
            tasks_purged,
        })
    }
}

#[async_trait]
impl ScheduledAction for RetentionCleanup {
    async fn run(&self) -> anyhow::Result<()> {
        self.sweep().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::models::source::FeedSource;
    use crate::queue::{MemoryTaskQueue, NewTask, RetryPolicy};
    use crate::scheduler::ManualClock;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn sweeps_runs_and_finished_tasks_past_retention() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new(
            "record",
            RetryPolicy::new(3, Duration::ZERO),
        ));
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let run = store.create_run(FeedSource::Jobicy, "u").await.unwrap();
        queue
            .enqueue(NewTask::new(run.id, &serde_json::json!({})).unwrap())
            .await
            .unwrap();
        let claimed = queue.claim(1).await.unwrap().remove(0);
        queue.complete(claimed.id).await.unwrap();
        queue
            .enqueue(NewTask::new(Uuid::new_v4(), &serde_json::json!({})).unwrap())
            .await
            .unwrap();

        let cleanup = RetentionCleanup::new(
            store.clone(),
            vec![queue.clone() as Arc<dyn TaskQueue>],
            30,
            clock.clone(),
        );

        assert_eq!(cleanup.sweep().await.unwrap(), CleanupReport::default());

        clock.advance(chrono::Duration::days(31));
        let report = cleanup.sweep().await.unwrap();
        assert_eq!(report.runs_deleted, 1);
        assert_eq!(report.tasks_purged, 1);
        assert!(store.get_run(run.id).await.unwrap().is_none());
        // Unfinished tasks are never purged.
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }
}
