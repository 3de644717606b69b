use tokio::sync::broadcast;

use crate::models::import_run::ImportRun;

/// Fan-out of terminal run snapshots to live subscribers (the SSE stream).
/// Delivery is best-effort: with no subscribers, or a lagging one, events are
/// dropped and clients fall back to polling the run.
#[derive(Clone)]
pub struct RunNotifier {
    tx: broadcast::Sender<ImportRun>,
}

impl RunNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, run: &ImportRun) -> usize {
        match self.tx.send(run.clone()) {
            Ok(n) => {
                tracing::debug!(run_id = %run.id, subscribers = n, "Published run event");
                n
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportRun> {
        self.tx.subscribe()
    }
}

impl Default for RunNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::source::FeedSource;

    #[tokio::test]
    async fn subscribers_receive_published_runs() {
        let notifier = RunNotifier::default();
        let mut rx = notifier.subscribe();
        let run = ImportRun::new(FeedSource::Jobicy, "https://jobicy.com/?feed=job_feed");

        assert_eq!(notifier.publish(&run), 1);
        assert_eq!(rx.recv().await.unwrap().id, run.id);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let notifier = RunNotifier::default();
        let run = ImportRun::new(FeedSource::HigherEdJobs, "u");
        assert_eq!(notifier.publish(&run), 0);
    }
}
