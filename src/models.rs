//! Data models shared by every stage of the pipeline.
//!
//! - [`Platform`]: closed set of content platforms, stored as text.
//! - [`Source`] / [`Hashtag`]: pollable origins held by the registry.
//! - [`NormalizedItem`]: what an adapter hands back for one piece of content.
//! - [`RawItem`]: an ingested, deduplicated item.
//! - [`Story`]: the scored projection of exactly one raw item.
//! - [`PollRun`]: append-only audit record of one polling attempt.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{UnknownPlatform, UnknownStatus};

/// Cadence applied when a source has no usable `cadence_minutes`.
pub const DEFAULT_CADENCE_MINUTES: i64 = 30;

/// A content platform. Adapters are registered per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    #[serde(alias = "Twitter")]
    X,
    Facebook,
    Instagram,
    TikTok,
    Reddit,
    #[serde(rename = "RSS", alias = "Rss")]
    Rss,
    GoogleTrends,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::X,
        Platform::Facebook,
        Platform::Instagram,
        Platform::TikTok,
        Platform::Reddit,
        Platform::Rss,
        Platform::GoogleTrends,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::X => "X",
            Platform::Facebook => "Facebook",
            Platform::Instagram => "Instagram",
            Platform::TikTok => "TikTok",
            Platform::Reddit => "Reddit",
            Platform::Rss => "RSS",
            Platform::GoogleTrends => "GoogleTrends",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        if wanted.eq_ignore_ascii_case("twitter") {
            return Ok(Platform::X);
        }
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

impl TryFrom<String> for Platform {
    type Error = UnknownPlatform;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A configured, pollable content origin: an account, page, subreddit or feed URL.
///
/// Sources are never deleted; deactivation is a soft flag.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Source {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    /// Account handle, subreddit, page name or feed URL depending on the platform.
    pub handle: String,
    pub display_name: Option<String>,
    /// Platform-side id (e.g. a Facebook Page id).
    pub account_id: Option<String>,
    pub is_active: bool,
    pub is_trusted: bool,
    pub is_regional: bool,
    pub location: Option<String>,
    pub cadence_minutes: Option<i64>,
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Set after a rate-limit response; the source is not due before this instant.
    pub backoff_until: Option<DateTime<Utc>>,
}

impl Source {
    /// Polling cadence in minutes, falling back to `default` when unset or non-positive.
    pub fn cadence(&self, default: i64) -> i64 {
        match self.cadence_minutes {
            Some(minutes) if minutes > 0 => minutes,
            _ if default > 0 => default,
            _ => DEFAULT_CADENCE_MINUTES,
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.handle)
    }
}

/// A tracked query term. Items found through it have no owning source.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Hashtag {
    pub id: i64,
    pub tag: String,
    /// `"all"` or a single platform name.
    pub platform_scope: String,
    pub is_regional: bool,
    pub is_active: bool,
    pub posts_per_hashtag: i64,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl Hashtag {
    /// Platforms this hashtag should be searched on.
    pub fn platforms(&self) -> Vec<Platform> {
        if self.platform_scope.eq_ignore_ascii_case("all") {
            return Platform::ALL.to_vec();
        }
        self.platform_scope.parse().map(|p| vec![p]).unwrap_or_default()
    }

    /// Search term without a leading `#`.
    pub fn term(&self) -> &str {
        self.tag.trim_start_matches('#')
    }
}

/// One item as produced by a platform adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub platform: Platform,
    pub external_id: String,
    pub author: String,
    pub content: String,
    pub url: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub views: i64,
    /// Adapter-level region signal; takes precedence over the owning source's flag.
    pub is_regional: Option<bool>,
    pub location: Option<String>,
    pub raw_payload: serde_json::Value,
}

/// An ingested item, unique on `(platform, external_id)`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RawItem {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    pub external_id: String,
    pub source_id: Option<i64>,
    pub hashtag_id: Option<i64>,
    pub author: String,
    pub content: String,
    pub url: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub views: i64,
    pub is_regional: bool,
    pub location: Option<String>,
    pub raw_payload: String,
    pub ingested_at: DateTime<Utc>,
}

/// The scored, consumer-facing projection of one [`RawItem`].
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Story {
    pub id: i64,
    pub raw_item_id: i64,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    pub author: String,
    pub content: String,
    pub url: String,
    pub posted_at: DateTime<Utc>,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub views: i64,
    pub engagement_velocity: f64,
    pub credibility_score: f64,
    pub topic_relevance_score: f64,
    pub overall_score: f64,
    pub reason: String,
    pub headline: String,
    pub topic: String,
    pub is_regional: bool,
    pub location: Option<String>,
    pub is_active: bool,
}

/// Lifecycle of a [`PollRun`]: created `Running`, finalized exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Running,
    Success,
    Error,
    RateLimited,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Running => "running",
            PollStatus::Success => "success",
            PollStatus::Error => "error",
            PollStatus::RateLimited => "rate_limited",
        }
    }
}

impl TryFrom<String> for PollStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, <PollStatus as TryFrom<String>>::Error> {
        match value.as_str() {
            "running" => Ok(PollStatus::Running),
            "success" => Ok(PollStatus::Success),
            "error" => Ok(PollStatus::Error),
            "rate_limited" => Ok(PollStatus::RateLimited),
            _ => Err(UnknownStatus(value)),
        }
    }
}

/// What a [`PollRun`] was polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    Source,
    Hashtag,
    Aggregation,
}

impl PollKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollKind::Source => "source",
            PollKind::Hashtag => "hashtag",
            PollKind::Aggregation => "aggregation",
        }
    }
}

impl TryFrom<String> for PollKind {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "source" => Ok(PollKind::Source),
            "hashtag" => Ok(PollKind::Hashtag),
            "aggregation" => Ok(PollKind::Aggregation),
            _ => Err(UnknownStatus(value)),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PollRun {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub kind: PollKind,
    pub source_id: Option<i64>,
    pub hashtag_id: Option<i64>,
    pub platform: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: PollStatus,
    pub items_fetched: i64,
    pub items_processed: i64,
    pub items_kept: i64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

/// Counters written when a [`PollRun`] is finalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollCounts {
    pub fetched: usize,
    pub processed: usize,
    pub kept: usize,
}
