use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::source::FeedSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    FullTime,
    PartTime,
    Contract,
    Internship,
    Remote,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullTime => "full-time",
            JobType::PartTime => "part-time",
            JobType::Contract => "contract",
            JobType::Internship => "internship",
            JobType::Remote => "remote",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full-time" => Ok(JobType::FullTime),
            "part-time" => Ok(JobType::PartTime),
            "contract" => Ok(JobType::Contract),
            "internship" => Ok(JobType::Internship),
            "remote" => Ok(JobType::Remote),
            other => Err(format!("Unknown job type '{other}'")),
        }
    }
}

/// A job posting in canonical shape, as produced by a feed parser.
///
/// `(external_id, source)` is the natural key: the same pair always refers
/// to the same posting no matter which run fetched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub external_id: String,
    pub source: FeedSource,
    pub title: String,
    pub description: String,
    pub company: String,
    pub location: String,
    pub job_type: JobType,
    pub category: String,
    pub salary: Option<String>,
    pub url: String,
    pub published_at: DateTime<Utc>,
}

impl JobRecord {
    /// `source:external_id`, as shown in failure details.
    pub fn natural_key(&self) -> String {
        format!("{}:{}", self.source, self.external_id)
    }
}

/// A job as persisted by the store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredJob {
    pub id: i64,
    #[serde(flatten)]
    pub record: JobRecord,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredJob {
    /// True when any of the tracked fields differ from `incoming`.
    ///
    /// Only title, description, company, location and salary are compared;
    /// a change limited to other fields is not treated as an update.
    pub fn differs_from(&self, incoming: &JobRecord) -> bool {
        let current = &self.record;
        current.title != incoming.title
            || current.description != incoming.description
            || current.company != incoming.company
            || current.location != incoming.location
            || current.salary != incoming.salary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord {
            external_id: "abc".to_string(),
            source: FeedSource::Jobicy,
            title: "Rust Engineer".to_string(),
            description: "Build things".to_string(),
            company: "Acme".to_string(),
            location: "Remote".to_string(),
            job_type: JobType::FullTime,
            category: "engineering".to_string(),
            salary: None,
            url: "https://example.com/jobs/abc".to_string(),
            published_at: Utc::now(),
        }
    }

    fn stored(record: JobRecord) -> StoredJob {
        StoredJob {
            id: 1,
            record,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn tracked_field_change_is_detected() {
        let existing = stored(record());
        let mut incoming = record();
        incoming.salary = Some("$100k".to_string());
        assert!(existing.differs_from(&incoming));
    }

    #[test]
    fn untracked_field_change_is_ignored() {
        let existing = stored(record());
        let mut incoming = record();
        incoming.category = "design".to_string();
        incoming.job_type = JobType::Contract;
        assert!(!existing.differs_from(&incoming));
    }

    #[test]
    fn job_type_round_trips_through_str() {
        for ty in [
            JobType::FullTime,
            JobType::PartTime,
            JobType::Contract,
            JobType::Internship,
            JobType::Remote,
        ] {
            assert_eq!(ty.as_str().parse::<JobType>(), Ok(ty));
        }
    }

    #[test]
    fn natural_key_includes_source() {
        assert_eq!(record().natural_key(), "jobicy:abc");
    }
}
