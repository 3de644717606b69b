//! Feed fetching and parsing.
//!
//! Each source implements [`FeedParser`]; [`HttpFeedFetcher`] performs the
//! HTTP call and hands the body to the parser for the run's source.

pub mod higheredjobs;
pub mod jobicy;
pub mod rss;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::models::job::JobRecord;
use crate::models::source::FeedSource;

pub use rss::RssItem;

/// Source-specific extraction from RSS items into canonical records.
pub trait FeedParser: Send + Sync {
    fn source(&self) -> FeedSource;

    /// Convert one item. Optional fields fall back to defaults; only an item
    /// that cannot be keyed at all is an error.
    fn parse_item(&self, item: &RssItem) -> Result<JobRecord, FetchError>;

    /// Parse a whole feed body. Unusable items are skipped; the feed fails
    /// only if it is malformed or none of its items could be converted.
    fn parse(&self, body: &str) -> Result<Vec<JobRecord>, FetchError> {
        let items = rss::parse_items(body)?;
        let item_count = items.len();

        let mut records = Vec::with_capacity(item_count);
        for (index, item) in items.iter().enumerate() {
            match self.parse_item(item) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(source = %self.source(), index, "Skipping feed item: {e}");
                }
            }
        }

        if item_count > 0 && records.is_empty() {
            return Err(FetchError::Parse(format!(
                "none of {item_count} items in the {} feed could be parsed",
                self.source()
            )));
        }
        Ok(records)
    }
}

/// Look up the parser for a source.
pub fn parser_for(source: FeedSource) -> Box<dyn FeedParser> {
    match source {
        FeedSource::Jobicy => Box::new(jobicy::Jobicy),
        FeedSource::HigherEdJobs => Box::new(higheredjobs::HigherEdJobs),
    }
}

/// Retrieves a feed and returns its records in feed order.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, source: FeedSource, feed_url: &str)
    -> Result<Vec<JobRecord>, FetchError>;
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent("JobImporter/1.0")
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(
        &self,
        source: FeedSource,
        feed_url: &str,
    ) -> Result<Vec<JobRecord>, FetchError> {
        tracing::info!(%source, feed_url, "Fetching feed");

        let resp = self
            .client
            .get(feed_url)
            .header("Accept", "application/xml, text/xml, */*")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Network(format!("Request to {feed_url} timed out"))
                } else {
                    FetchError::Network(format!("Request to {feed_url} failed: {e}"))
                }
            })?;

        if !resp.status().is_success() {
            return Err(FetchError::Network(format!(
                "{feed_url} returned {}",
                resp.status()
            )));
        }

        let body = resp.text().await.map_err(|e| {
            FetchError::Network(format!("Failed to read body from {feed_url}: {e}"))
        })?;

        let records = parser_for(source).parse(&body)?;
        tracing::info!(%source, feed_url, count = records.len(), "Parsed feed");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_registry_matches_source() {
        for source in FeedSource::ALL {
            assert_eq!(parser_for(source).source(), source);
        }
    }

    #[test]
    fn skips_unkeyed_items() {
        let xml = r#"<rss><channel>
            <item><title>No link</title></item>
            <item><title>Has link</title><link>https://jobicy.com/jobs/9-dev</link></item>
        </channel></rss>"#;
        let records = parser_for(FeedSource::Jobicy).parse(xml).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Has link");
    }

    #[test]
    fn all_items_unusable_is_parse_error() {
        let xml = "<rss><channel><item><title>x</title></item></channel></rss>";
        let err = parser_for(FeedSource::HigherEdJobs).parse(xml).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }
}
