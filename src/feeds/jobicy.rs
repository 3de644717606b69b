use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::FetchError;
use crate::feeds::FeedParser;
use crate::feeds::rss::{RssItem, external_id_for};
use crate::models::job::{JobRecord, JobType};
use crate::models::source::FeedSource;

static COMPANY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Company:\s*([^\n<]+)").expect("valid regex"));
static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Location:\s*([^\n<]+)").expect("valid regex"));
static SALARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Salary:\s*([^\n<]+)").expect("valid regex"));

/// Jobicy publishes structured data only for title, link and date; company,
/// location and salary are scraped from `Label: value` lines in the
/// description.
pub struct Jobicy;

impl FeedParser for Jobicy {
    fn source(&self) -> FeedSource {
        FeedSource::Jobicy
    }

    fn parse_item(&self, item: &RssItem) -> Result<JobRecord, FetchError> {
        let link = item
            .link()
            .ok_or_else(|| FetchError::Parse("item has no link".to_string()))?;
        let title = item.title().unwrap_or("Untitled Position");
        let description = item.description().unwrap_or("No description available");

        Ok(JobRecord {
            external_id: external_id_for(link),
            source: FeedSource::Jobicy,
            title: title.to_string(),
            description: description.to_string(),
            company: labelled(&COMPANY_RE, description)
                .unwrap_or_else(|| "Unknown Company".to_string()),
            location: labelled(&LOCATION_RE, description).unwrap_or_else(|| "Remote".to_string()),
            job_type: job_type_from_title(title),
            category: category_from_url(link).unwrap_or_else(|| "general".to_string()),
            salary: labelled(&SALARY_RE, description),
            url: link.to_string(),
            published_at: item.published_at(),
        })
    }
}

fn labelled(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn job_type_from_title(title: &str) -> JobType {
    let lower = title.to_lowercase();
    if lower.contains("part-time") {
        JobType::PartTime
    } else if lower.contains("contract") {
        JobType::Contract
    } else if lower.contains("intern") {
        JobType::Internship
    } else {
        JobType::FullTime
    }
}

/// Last path segment of the posting URL.
fn category_from_url(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    url.path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, description: &str, link: &str) -> RssItem {
        RssItem {
            title: Some(title.to_string()),
            description: Some(description.to_string()),
            link: Some(link.to_string()),
            pub_date: None,
        }
    }

    #[test]
    fn extracts_labelled_fields() {
        let record = Jobicy
            .parse_item(&item(
                "Part-Time Copywriter",
                "<p>Company: Acme Corp</p>\nLocation: Berlin, Germany\nSalary: €40k",
                "https://jobicy.com/jobs/123-copywriter",
            ))
            .unwrap();

        assert_eq!(record.company, "Acme Corp");
        assert_eq!(record.location, "Berlin, Germany");
        assert_eq!(record.salary.as_deref(), Some("€40k"));
        assert_eq!(record.job_type, JobType::PartTime);
        assert_eq!(record.category, "123-copywriter");
        assert_eq!(record.source, FeedSource::Jobicy);
        assert_eq!(
            record.external_id,
            external_id_for("https://jobicy.com/jobs/123-copywriter")
        );
    }

    #[test]
    fn falls_back_to_defaults() {
        let record = Jobicy
            .parse_item(&RssItem {
                link: Some("https://jobicy.com/".to_string()),
                ..RssItem::default()
            })
            .unwrap();

        assert_eq!(record.title, "Untitled Position");
        assert_eq!(record.description, "No description available");
        assert_eq!(record.company, "Unknown Company");
        assert_eq!(record.location, "Remote");
        assert_eq!(record.job_type, JobType::FullTime);
        assert_eq!(record.category, "general");
        assert_eq!(record.salary, None);
    }

    #[test]
    fn unparseable_link_still_yields_record() {
        let record = Jobicy
            .parse_item(&item("Contract Designer", "", "not a url"))
            .unwrap();
        assert_eq!(record.category, "general");
        assert_eq!(record.job_type, JobType::Contract);
    }

    #[test]
    fn item_without_link_is_rejected() {
        let err = Jobicy.parse_item(&RssItem::default()).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[test]
    fn intern_keyword_maps_to_internship() {
        assert_eq!(job_type_from_title("Marketing Intern"), JobType::Internship);
        assert_eq!(job_type_from_title("Staff Engineer"), JobType::FullTime);
    }
}
