//! Minimal RSS 2.0 model shared by the feed parsers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::FetchError;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

/// One `<item>` with the text fields every parser needs. Values are trimmed
/// and empty strings collapse to `None`.
#[derive(Debug, Default, Deserialize)]
pub struct RssItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(rename = "pubDate", default)]
    pub pub_date: Option<String>,
}

impl RssItem {
    pub fn title(&self) -> Option<&str> {
        non_empty(self.title.as_deref())
    }

    pub fn description(&self) -> Option<&str> {
        non_empty(self.description.as_deref())
    }

    pub fn link(&self) -> Option<&str> {
        non_empty(self.link.as_deref())
    }

    /// `pubDate` as RFC 2822, falling back to now.
    pub fn published_at(&self) -> DateTime<Utc> {
        non_empty(self.pub_date.as_deref())
            .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Parse an RSS document into its items.
pub fn parse_items(xml: &str) -> Result<Vec<RssItem>, FetchError> {
    let rss: Rss = quick_xml::de::from_str(xml)
        .map_err(|e| FetchError::Parse(format!("Invalid RSS document: {e}")))?;
    Ok(rss.channel.items)
}

/// Stable identifier for a posting, derived from its canonical URL.
pub fn external_id_for(url: &str) -> String {
    BASE64.encode(url.trim().as_bytes())
}
