use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use crate::models::import_run::ImportRun;
use crate::models::source::FeedSource;
use crate::pipeline::ImportService;
use crate::scheduler::ScheduledAction;

const JOBICY_FEED: &str = "https://jobicy.com/?feed=job_feed";

/// A feed imported on every scheduled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportTarget {
    pub source: FeedSource,
    pub url: String,
    pub name: String,
}

impl ImportTarget {
    fn jobicy(query: &str, name: &str) -> Self {
        Self {
            source: FeedSource::Jobicy,
            url: format!("{JOBICY_FEED}{query}"),
            name: name.to_string(),
        }
    }
}

/// The built-in target list: eight Jobicy category feeds and the
/// HigherEdJobs article feed.
pub fn default_targets() -> Vec<ImportTarget> {
    vec![
        ImportTarget::jobicy("", "All Jobs"),
        ImportTarget::jobicy(
            "&job_categories=smm&job_types=full-time",
            "Social Media Marketing",
        ),
        ImportTarget::jobicy(
            "&job_categories=seller&job_types=full-time&search_region=france",
            "Sales - France",
        ),
        ImportTarget::jobicy("&job_categories=design-multimedia", "Design & Multimedia"),
        ImportTarget::jobicy("&job_categories=data-science", "Data Science"),
        ImportTarget::jobicy("&job_categories=copywriting", "Copywriting"),
        ImportTarget::jobicy("&job_categories=business", "Business"),
        ImportTarget::jobicy("&job_categories=management", "Management"),
        ImportTarget {
            source: FeedSource::HigherEdJobs,
            url: "https://www.higheredjobs.com/rss/articleFeed.cfm".to_string(),
            name: "Higher Education Jobs".to_string(),
        },
    ]
}

/// Load targets from a JSON array of `{source, url, name}` objects.
pub fn load_targets(path: &Path) -> anyhow::Result<Vec<ImportTarget>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read targets file {}", path.display()))?;
    let targets: Vec<ImportTarget> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid targets file {}", path.display()))?;
    if targets.is_empty() {
        anyhow::bail!("Targets file {} lists no targets", path.display());
    }
    Ok(targets)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RunAllSummary {
    pub started: Vec<ImportRun>,
    pub failed: Vec<String>,
}

/// Starts runs for configured targets through the same path as the HTTP
/// trigger. Runs are only started, never awaited.
#[derive(Clone)]
pub struct TargetRunner {
    service: ImportService,
    targets: Vec<ImportTarget>,
    inter_target_delay: Duration,
}

impl TargetRunner {
    pub fn new(
        service: ImportService,
        targets: Vec<ImportTarget>,
        inter_target_delay: Duration,
    ) -> Self {
        Self {
            service,
            targets,
            inter_target_delay,
        }
    }

    pub fn targets(&self) -> &[ImportTarget] {
        &self.targets
    }

    /// Start a run for every target in order, pausing between targets. A
    /// target that fails to start is logged and skipped.
    pub async fn run_all(&self) -> RunAllSummary {
        tracing::info!(targets = self.targets.len(), "Starting import for all targets");
        let mut summary = RunAllSummary::default();

        for (i, target) in self.targets.iter().enumerate() {
            if i > 0 && !self.inter_target_delay.is_zero() {
                tokio::time::sleep(self.inter_target_delay).await;
            }
            match self.service.start_run(target.source, &target.url).await {
                Ok(run) => {
                    tracing::info!(run_id = %run.id, target = %target.name, "Started import");
                    summary.started.push(run);
                }
                Err(e) => {
                    tracing::error!(target = %target.name, "Failed to start import: {e}");
                    summary.failed.push(target.name.clone());
                }
            }
        }

        tracing::info!(
            started = summary.started.len(),
            failed = summary.failed.len(),
            "Finished starting imports"
        );
        summary
    }

    /// Start a run for one explicit feed.
    pub async fn run_single(
        &self,
        source: FeedSource,
        feed_url: &str,
    ) -> Result<ImportRun, ImportError> {
        self.service.start_run(source, feed_url).await
    }
}

#[async_trait]
impl ScheduledAction for TargetRunner {
    async fn run(&self) -> anyhow::Result<()> {
        let summary = self.run_all().await;
        if summary.started.is_empty() && !summary.failed.is_empty() {
            anyhow::bail!("No imports could be started ({} targets failed)", summary.failed.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::PipelineConfig;
    use crate::queue::{MemoryTaskQueue, RetryPolicy, TaskQueue};
    use crate::store::{MemoryStore, Store};

    fn runner(targets: Vec<ImportTarget>) -> (TargetRunner, Arc<MemoryStore>, Arc<MemoryTaskQueue>) {
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
        (TargetRunner::new(service, targets, Duration::ZERO), store, fetch)
    }

    #[test]
    fn default_list_has_nine_feeds() {
        let targets = default_targets();
        assert_eq!(targets.len(), 9);
        assert_eq!(targets[0].url, "https://jobicy.com/?feed=job_feed");
        assert_eq!(
            targets[3].url,
            "https://jobicy.com/?feed=job_feed&job_categories=design-multimedia"
        );
        assert_eq!(
            targets
                .iter()
                .filter(|t| t.source == FeedSource::HigherEdJobs)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn run_all_continues_past_bad_targets() {
        let mut targets = default_targets();
        targets.insert(
            1,
            ImportTarget {
                source: FeedSource::Jobicy,
                url: "not a url".to_string(),
                name: "Broken".to_string(),
            },
        );
        let (runner, store, fetch) = runner(targets);

        let summary = runner.run_all().await;
        assert_eq!(summary.started.len(), 9);
        assert_eq!(summary.failed, vec!["Broken".to_string()]);
        assert_eq!(store.run_stats().await.unwrap().running_imports, 9);
        assert_eq!(fetch.counts().await.unwrap().depth(), 9);
    }

    #[tokio::test]
    async fn run_single_uses_explicit_feed() {
        let (runner, _store, _fetch) = runner(default_targets());
        let run = runner
            .run_single(FeedSource::HigherEdJobs, "https://www.higheredjobs.com/rss/articleFeed.cfm")
            .await
            .unwrap();
        assert_eq!(run.source, FeedSource::HigherEdJobs);
    }

    #[test]
    fn loads_targets_file() {
        let path = std::env::temp_dir().join(format!("targets-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"source": "jobicy", "url": "https://jobicy.com/?feed=job_feed", "name": "All"}]"#,
        )
        .unwrap();

        let targets = load_targets(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].source, FeedSource::Jobicy);
    }

    #[test]
    fn empty_targets_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("targets-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[]").unwrap();
        let result = load_targets(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
