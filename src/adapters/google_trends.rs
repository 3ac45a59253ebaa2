//! Google Trends daily trending searches.
//!
//! The source handle is a two-letter country code (`KE`, `US`, ...). The feed
//! reports an approximate search volume per term; it is converted into
//! estimated engagement so trends can be scored next to social posts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument};

use super::rss::{FeedEntry, parse_feed};
use super::{PlatformAdapter, RegionHints, send_text};
use crate::error::AdapterError;
use crate::models::{NormalizedItem, Platform, Source};
use crate::utils::{collapse_whitespace, html_to_text, parse_traffic};

const DEFAULT_BASE_URL: &str = "https://trends.google.com";

#[derive(Debug, Clone)]
pub struct GoogleTrendsAdapter {
    client: reqwest::Client,
    region: RegionHints,
    base_url: String,
}

impl GoogleTrendsAdapter {
    pub fn new(client: reqwest::Client, region: RegionHints) -> Self {
        Self {
            client,
            region,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn feed_url(&self, geo: &str) -> String {
        format!(
            "{}/trends/trendingsearches/daily/rss?geo={}",
            self.base_url,
            urlencoding::encode(geo)
        )
    }

    fn normalize(&self, entry: FeedEntry, geo: &str, now: DateTime<Utc>) -> NormalizedItem {
        let title = collapse_whitespace(&entry.title);
        let description = html_to_text(&entry.summary);
        let content = if description.is_empty() {
            title.clone()
        } else {
            format!("{title}\n\n{description}")
        };

        let traffic = entry.traffic.as_deref().and_then(parse_traffic).unwrap_or(0);
        let posted_at = entry.published.unwrap_or(now);
        let (is_regional, location) = self.region.detect(&content);
        let url = if entry.link.is_empty() {
            format!("{}/trending?geo={}", self.base_url, urlencoding::encode(geo))
        } else {
            entry.link.clone()
        };

        NormalizedItem {
            platform: Platform::GoogleTrends,
            external_id: format!("{geo}:{}:{}", posted_at.format("%Y-%m-%d"), title.to_lowercase()),
            author: "Google Trends".to_string(),
            content,
            url,
            posted_at: Some(posted_at),
            likes: (traffic / 100).max(100),
            comments: (traffic / 500).max(10),
            shares: (traffic / 1000).max(5),
            views: traffic * 10,
            is_regional,
            location,
            raw_payload: json!({
                "title": entry.title,
                "description": description,
                "traffic": entry.traffic,
                "news_count": entry.news_items,
                "link": entry.link,
            }),
        }
    }
}

#[async_trait]
impl PlatformAdapter for GoogleTrendsAdapter {
    fn platform(&self) -> Platform {
        Platform::GoogleTrends
    }

    #[instrument(level = "info", skip_all, fields(geo = %source.handle))]
    async fn fetch(&self, source: &Source, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
        let geo = match source.handle.trim() {
            "" => "US".to_string(),
            code => code.to_uppercase(),
        };
        let body = send_text(self.client.get(self.feed_url(&geo))).await?;
        let feed = parse_feed(&body)?;
        let now = Utc::now();

        let items: Vec<NormalizedItem> = feed
            .entries
            .into_iter()
            .take(limit)
            .map(|entry| self.normalize(entry, &geo, now))
            .collect();
        info!(count = items.len(), "Fetched trending searches");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use std::time::Duration;

    const TRENDS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss xmlns:ht="https://trends.google.com/trends/trendingsearches/daily" version="2.0">
  <channel>
    <title>Daily Search Trends</title>
    <item>
      <title>Harambee Stars</title>
      <ht:approx_traffic>20K+</ht:approx_traffic>
      <description>Kenya vs Gabon</description>
      <link>https://trends.google.com/trends/trendingsearches/daily?geo=KE#Harambee</link>
      <pubDate>Sat, 01 Mar 2025 08:00:00 +0000</pubDate>
      <ht:news_item>
        <ht:news_item_title>Stars win</ht:news_item_title>
      </ht:news_item>
      <ht:news_item>
        <ht:news_item_title>Coach speaks</ht:news_item_title>
      </ht:news_item>
    </item>
    <item>
      <title>Oscars</title>
      <ht:approx_traffic>500+</ht:approx_traffic>
    </item>
  </channel>
</rss>"#;

    fn adapter() -> GoogleTrendsAdapter {
        let client = crate::adapters::http_client("test", Duration::from_secs(5)).unwrap();
        GoogleTrendsAdapter::new(client, RegionHints::new(&RegionConfig::default()))
    }

    #[test]
    fn reads_traffic_and_news_items() {
        let feed = parse_feed(TRENDS).unwrap();
        assert_eq!(feed.entries[0].traffic.as_deref(), Some("20K+"));
        assert_eq!(feed.entries[0].news_items, 2);
        assert_eq!(feed.entries[0].summary, "Kenya vs Gabon");
        assert_eq!(feed.entries[1].news_items, 0);
    }

    #[test]
    fn traffic_becomes_estimated_engagement() {
        let feed = parse_feed(TRENDS).unwrap();
        let now = Utc::now();
        let adapter = adapter();
        let mut entries = feed.entries.into_iter();

        let stars = adapter.normalize(entries.next().unwrap(), "KE", now);
        assert_eq!((stars.likes, stars.comments, stars.shares, stars.views), (200, 40, 20, 200_000));
        assert_eq!(stars.content, "Harambee Stars\n\nKenya vs Gabon");
        assert_eq!(stars.external_id, "KE:2025-03-01:harambee stars");
        assert_eq!(stars.is_regional, Some(true));

        let oscars = adapter.normalize(entries.next().unwrap(), "KE", now);
        assert_eq!((oscars.likes, oscars.comments, oscars.shares), (100, 10, 5));
        assert_eq!(oscars.posted_at, Some(now));
        assert_eq!(oscars.url, "https://trends.google.com/trending?geo=KE");
        assert_eq!(oscars.is_regional, None);
    }

    #[test]
    fn feed_url_encodes_country() {
        let adapter = adapter().with_base_url("http://127.0.0.1:9/");
        assert_eq!(
            adapter.feed_url("K E"),
            "http://127.0.0.1:9/trends/trendingsearches/daily/rss?geo=K%20E"
        );
    }
}
