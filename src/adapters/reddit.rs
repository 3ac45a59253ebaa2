//! Reddit public JSON listings.
//!
//! The source handle is a subreddit name (`kenya`, `r/worldnews`). Upvotes map
//! to likes; shares and views are estimated from the post score. Search runs
//! against `search.json`, which is how hashtags are tracked on Reddit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, instrument};

use super::{PlatformAdapter, RegionHints, send_text};
use crate::error::AdapterError;
use crate::models::{NormalizedItem, Platform, Source};

const DEFAULT_BASE_URL: &str = "https://www.reddit.com";
const MAX_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    subreddit: String,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    ups: i64,
    #[serde(default)]
    num_comments: i64,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    created_utc: Option<f64>,
}

/// `r/Kenya`, `/r/kenya/` and `kenya` all name the same subreddit.
fn subreddit_name(handle: &str) -> String {
    let trimmed = handle.trim().trim_matches('/');
    let name = trimmed
        .strip_prefix("r/")
        .unwrap_or(trimmed)
        .trim_matches('/');
    if name.is_empty() {
        "popular".to_string()
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct RedditAdapter {
    client: reqwest::Client,
    region: RegionHints,
    base_url: String,
}

impl RedditAdapter {
    pub fn new(client: reqwest::Client, region: RegionHints) -> Self {
        Self {
            client,
            region,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Parse a listing body into normalized items, skipping malformed children.
    fn parse_listing(&self, body: &str, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
        let listing: Listing = serde_json::from_str(body)
            .map_err(|e| AdapterError::Parse(format!("reddit listing: {e}")))?;
        let items = listing
            .data
            .children
            .into_iter()
            .filter_map(|child| {
                let post: Post = serde_json::from_value(child.data.clone()).ok()?;
                Some(self.normalize(post, child.data))
            })
            .take(limit)
            .collect();
        Ok(items)
    }

    fn normalize(&self, post: Post, raw: serde_json::Value) -> NormalizedItem {
        let content = if post.selftext.trim().is_empty() {
            post.title.clone()
        } else {
            format!("{}\n\n{}", post.title, post.selftext)
        };
        let url = match (&post.permalink, &post.url) {
            (Some(permalink), _) if !permalink.is_empty() => format!("{}{permalink}", self.base_url),
            (_, Some(url)) if url.starts_with('/') => format!("{}{url}", self.base_url),
            (_, Some(url)) => url.clone(),
            _ => format!("{}/comments/{}", self.base_url, post.id),
        };

        let (is_regional, location) = match self.region.detect(&content) {
            (None, _) => self.region.detect(&post.subreddit),
            hit => hit,
        };

        NormalizedItem {
            platform: Platform::Reddit,
            external_id: post.id.clone(),
            author: format!("u/{}", post.author.as_deref().unwrap_or("[deleted]")),
            content,
            url,
            posted_at: post
                .created_utc
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0)),
            likes: post.ups.max(0),
            comments: post.num_comments.max(0),
            shares: (post.score / 10).max(0),
            views: (post.score * 5).max(0),
            is_regional,
            location,
            raw_payload: raw,
        }
    }
}

#[async_trait]
impl PlatformAdapter for RedditAdapter {
    fn platform(&self) -> Platform {
        Platform::Reddit
    }

    #[instrument(level = "info", skip_all, fields(handle = %source.handle))]
    async fn fetch(&self, source: &Source, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
        let subreddit = subreddit_name(&source.handle);
        let url = format!("{}/r/{}/hot.json", self.base_url, urlencoding::encode(&subreddit));
        let body = send_text(
            self.client
                .get(url)
                .query(&[("limit", limit.clamp(1, MAX_PAGE).to_string())]),
        )
        .await?;
        let items = self.parse_listing(&body, limit)?;
        info!(count = items.len(), %subreddit, "Fetched Reddit posts");
        Ok(items)
    }

    #[instrument(level = "info", skip_all, fields(%term))]
    async fn search(&self, term: &str, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
        let url = format!(
            "{}/search.json?q={}&sort=hot",
            self.base_url,
            urlencoding::encode(term)
        );
        let body = send_text(
            self.client
                .get(url)
                .query(&[("limit", limit.clamp(1, MAX_PAGE).to_string())]),
        )
        .await?;
        let items = self.parse_listing(&body, limit)?;
        info!(count = items.len(), "Searched Reddit");
        Ok(items)
    }
}
