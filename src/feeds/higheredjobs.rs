use crate::error::FetchError;
use crate::feeds::FeedParser;
use crate::feeds::rss::{RssItem, external_id_for};
use crate::models::job::{JobRecord, JobType};
use crate::models::source::FeedSource;

/// HigherEdJobs items carry no employer metadata, so those fields are fixed.
pub struct HigherEdJobs;

impl FeedParser for HigherEdJobs {
    fn source(&self) -> FeedSource {
        FeedSource::HigherEdJobs
    }

    fn parse_item(&self, item: &RssItem) -> Result<JobRecord, FetchError> {
        let link = item
            .link()
            .ok_or_else(|| FetchError::Parse("item has no link".to_string()))?;

        Ok(JobRecord {
            external_id: external_id_for(link),
            source: FeedSource::HigherEdJobs,
            title: item.title().unwrap_or("Untitled Position").to_string(),
            description: item
                .description()
                .unwrap_or("No description available")
                .to_string(),
            company: "Higher Education Institution".to_string(),
            location: "United States".to_string(),
            job_type: JobType::FullTime,
            category: "education".to_string(),
            salary: None,
            url: link.to_string(),
            published_at: item.published_at(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_fixed_institution_fields() {
        let record = HigherEdJobs
            .parse_item(&RssItem {
                title: Some("Assistant Professor of Chemistry".to_string()),
                description: Some("Company: ignored here".to_string()),
                link: Some("https://www.higheredjobs.com/details.cfm?JobCode=1".to_string()),
                pub_date: Some("Mon, 02 Jun 2025 12:00:00 GMT".to_string()),
            })
            .unwrap();

        assert_eq!(record.company, "Higher Education Institution");
        assert_eq!(record.location, "United States");
        assert_eq!(record.category, "education");
        assert_eq!(record.job_type, JobType::FullTime);
        assert_eq!(record.source, FeedSource::HigherEdJobs);
        assert_eq!(record.published_at.to_rfc3339(), "2025-06-02T12:00:00+00:00");
    }
}
