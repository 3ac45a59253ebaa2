//! Facebook Graph API page posts.
//!
//! Only Pages are supported: the source must carry the Page id in
//! `account_id`. Facebook has no trending endpoint, so these sources are
//! normally listed under `aggregator.platforms` and ranked by the trend
//! aggregator rather than polled one by one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::{PlatformAdapter, send_text};
use crate::error::AdapterError;
use crate::models::{NormalizedItem, Platform, Source};

const GRAPH_BASE_URL: &str = "https://graph.facebook.com/v18.0";
const POST_FIELDS: &str =
    "id,message,created_time,likes.summary(true),comments.summary(true),shares,permalink_url";

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Summary {
    #[serde(default)]
    total_count: i64,
}

#[derive(Debug, Default, Deserialize)]
struct Counted {
    #[serde(default)]
    summary: Summary,
}

#[derive(Debug, Default, Deserialize)]
struct Shares {
    #[serde(default)]
    count: i64,
}

#[derive(Debug, Deserialize)]
struct PagePost {
    id: String,
    #[serde(default)]
    message: String,
    created_time: Option<String>,
    #[serde(default)]
    likes: Counted,
    #[serde(default)]
    comments: Counted,
    #[serde(default)]
    shares: Shares,
    permalink_url: Option<String>,
}

/// Graph timestamps look like `2025-03-01T10:00:00+0000`.
fn parse_created_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[derive(Clone)]
pub struct FacebookAdapter {
    client: reqwest::Client,
    access_token: Option<String>,
    base_url: String,
}

impl std::fmt::Debug for FacebookAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacebookAdapter")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl FacebookAdapter {
    pub fn new(client: reqwest::Client, access_token: Option<String>) -> Self {
        Self {
            client,
            access_token: access_token.filter(|t| !t.trim().is_empty()),
            base_url: GRAPH_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn parse_page(&self, body: &str, source: &Source, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
        let page: Page = serde_json::from_str(body)
            .map_err(|e| AdapterError::Parse(format!("graph page posts: {e}")))?;
        let items = page
            .data
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<PagePost>(raw.clone()) {
                Ok(post) => Some(Self::normalize(post, raw, source)),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed Graph post");
                    None
                }
            })
            .take(limit)
            .collect();
        Ok(items)
    }

    fn normalize(post: PagePost, raw: serde_json::Value, source: &Source) -> NormalizedItem {
        let url = post
            .permalink_url
            .clone()
            .unwrap_or_else(|| format!("https://facebook.com/{}", post.id));
        NormalizedItem {
            platform: Platform::Facebook,
            external_id: post.id,
            author: source.label().to_string(),
            content: post.message,
            url,
            posted_at: post.created_time.as_deref().and_then(parse_created_time),
            likes: post.likes.summary.total_count,
            comments: post.comments.summary.total_count,
            shares: post.shares.count,
            views: 0,
            is_regional: None,
            location: None,
            raw_payload: raw,
        }
    }
}

#[async_trait]
impl PlatformAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    #[instrument(level = "info", skip_all, fields(handle = %source.handle))]
    async fn fetch(&self, source: &Source, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or(AdapterError::MissingCredentials(Platform::Facebook))?;
        let page_id = source
            .account_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(AdapterError::Unsupported("facebook source without a page id"))?;

        let url = format!("{}/{}/posts", self.base_url, urlencoding::encode(page_id));
        let request = self.client.get(url).query(&[
            ("access_token", token.to_string()),
            ("fields", POST_FIELDS.to_string()),
            ("limit", limit.clamp(1, 100).to_string()),
        ]);
        let body = send_text(request).await?;
        let items = self.parse_page(&body, source, limit)?;
        info!(count = items.len(), %page_id, "Fetched Facebook page posts");
        Ok(items)
    }
}
