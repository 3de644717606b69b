use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// External feed providers the importer knows how to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    Jobicy,
    HigherEdJobs,
}

impl FeedSource {
    pub const ALL: [FeedSource; 2] = [FeedSource::Jobicy, FeedSource::HigherEdJobs];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedSource::Jobicy => "jobicy",
            FeedSource::HigherEdJobs => "higheredjobs",
        }
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeedSource::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown feed source '{s}'"))
    }
}
