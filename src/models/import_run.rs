use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::source::FeedSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("Unknown run status '{other}'")),
        }
    }
}

/// One record that could not be applied during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub record_key: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// One ingestion attempt against a single feed.
///
/// The counters only ever grow while the run is `Running`. Once the run is
/// `Completed`, `total_imported + unchanged_count + failed_count` equals
/// `total_fetched`.
#[derive(Debug, Clone, Serialize)]
pub struct ImportRun {
    pub id: Uuid,
    pub source: FeedSource,
    pub feed_url: String,
    pub total_fetched: i32,
    pub total_imported: i32,
    pub new_count: i32,
    pub updated_count: i32,
    pub unchanged_count: i32,
    pub failed_count: i32,
    pub failure_details: Vec<FailureDetail>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl ImportRun {
    pub fn new(source: FeedSource, feed_url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            feed_url: feed_url.to_string(),
            total_fetched: 0,
            total_imported: 0,
            new_count: 0,
            updated_count: 0,
            unchanged_count: 0,
            failed_count: 0,
            failure_details: Vec::new(),
            status: RunStatus::Running,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Records that reached an outcome, whatever the outcome was.
    pub fn processed(&self) -> i32 {
        self.total_imported + self.unchanged_count + self.failed_count
    }

    /// The counter rule for completion.
    pub fn is_drained(&self) -> bool {
        self.processed() >= self.total_fetched
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Counter increments applied atomically to a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub new: u32,
    pub updated: u32,
    pub unchanged: u32,
}

impl CounterDelta {
    pub fn inserted() -> Self {
        Self {
            new: 1,
            ..Self::default()
        }
    }

    pub fn updated() -> Self {
        Self {
            updated: 1,
            ..Self::default()
        }
    }

    pub fn unchanged() -> Self {
        Self {
            unchanged: 1,
            ..Self::default()
        }
    }

    /// Contribution to `total_imported`.
    pub fn imported(&self) -> u32 {
        self.new + self.updated
    }
}

/// Aggregates across every stored run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub total_imports: i64,
    pub total_jobs_fetched: i64,
    pub total_jobs_imported: i64,
    pub total_new_jobs: i64,
    pub total_updated_jobs: i64,
    pub total_unchanged_jobs: i64,
    pub total_failed_jobs: i64,
    pub completed_imports: i64,
    pub failed_imports: i64,
    pub running_imports: i64,
}

/// One page of run history, newest first.
#[derive(Debug, Serialize)]
pub struct RunPage {
    pub imports: Vec<ImportRun>,
    pub page: i64,
    pub limit: i64,
    pub total_count: i64,
    pub has_more: bool,
    pub total_pages: i64,
}

impl RunPage {
    pub fn new(imports: Vec<ImportRun>, page: i64, limit: i64, total_count: i64) -> Self {
        let offset = (page - 1) * limit;
        Self {
            imports,
            page,
            limit,
            total_count,
            has_more: offset + limit < total_count,
            total_pages: (total_count + limit - 1) / limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_starts_running_with_zero_counters() {
        let run = ImportRun::new(FeedSource::Jobicy, "https://jobicy.com/?feed=job_feed");
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.processed(), 0);
        assert!(run.completed_at.is_none());
        // Nothing fetched yet, so the counter rule is trivially satisfied.
        assert!(run.is_drained());
    }

    #[test]
    fn drained_counts_unchanged_and_failed() {
        let mut run = ImportRun::new(FeedSource::Jobicy, "u");
        run.total_fetched = 4;
        run.total_imported = 2;
        run.unchanged_count = 1;
        assert!(!run.is_drained());
        run.failed_count = 1;
        assert!(run.is_drained());
    }

    #[test]
    fn page_math() {
        let page = RunPage::new(Vec::new(), 1, 50, 120);
        assert!(page.has_more);
        assert_eq!(page.total_pages, 3);

        let last = RunPage::new(Vec::new(), 3, 50, 120);
        assert!(!last.has_more);
    }

    #[test]
    fn delta_imported_excludes_unchanged() {
        assert_eq!(CounterDelta::inserted().imported(), 1);
        assert_eq!(CounterDelta::updated().imported(), 1);
        assert_eq!(CounterDelta::unchanged().imported(), 0);
    }
}
