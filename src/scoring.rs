//! Trending score computation.
//!
//! Everything here is a pure function of its inputs and an explicit `now`:
//! no I/O, no clock reads, no global settings. The engine is built once from
//! an immutable [`ScoringConfig`] and shared by the scheduler, the aggregator
//! and the `rescore` command.
//!
//! # Components
//!
//! - **Engagement velocity**: `likes + 2*comments + 3*shares + 0.1*views` per
//!   elapsed hour, with elapsed hours floored at 0.1.
//! - **Credibility**: 100 for trusted sources or listed handles, otherwise 50.
//! - **Topic relevance**: keyword matches plus regional, location and
//!   indicator boosts, capped at 100.
//! - **Overall**: `0.5*min(v/10, 100) + 0.3*credibility + 0.2*relevance`
//!   plus additive regional boosts. The result is not capped: regional
//!   content is meant to outrank everything else.
//!
//! A story is kept only when it clears **both** the score floor and the
//! velocity floor.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::config::ScoringConfig;
use crate::error::ScoringInputError;
use crate::models::{Platform, RawItem};
use crate::utils::collapse_whitespace;

const MIN_ELAPSED_HOURS: f64 = 0.1;
const HEADLINE_MAX_CHARS: usize = 100;

static TRENDS_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*Trending search in [A-Z]{2}\s*").expect("static regex must compile")
});

/// How a free-text location relates to the priority region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationMatch {
    Exact,
    Adjacent,
    Unrelated,
}

/// The fields of one raw item that scoring depends on.
#[derive(Debug, Clone)]
pub struct ScoreInput<'a> {
    pub platform: Platform,
    pub author: &'a str,
    pub content: &'a str,
    pub posted_at: Option<DateTime<Utc>>,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub views: i64,
    pub is_trusted_source: bool,
    pub is_regional: bool,
    pub location: Option<&'a str>,
}

impl<'a> ScoreInput<'a> {
    pub fn from_raw(item: &'a RawItem, is_trusted_source: bool) -> Self {
        Self {
            platform: item.platform,
            author: &item.author,
            content: &item.content,
            posted_at: item.posted_at,
            likes: item.likes,
            comments: item.comments,
            shares: item.shares,
            views: item.views,
            is_trusted_source,
            is_regional: item.is_regional,
            location: item.location.as_deref(),
        }
    }
}

/// Every score component for one item plus the keep decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreCard {
    pub engagement_velocity: f64,
    pub credibility: f64,
    pub topic_relevance: f64,
    pub overall: f64,
    pub reason: String,
    pub keep: bool,
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    config: ScoringConfig,
    keywords: Vec<String>,
    indicators: Vec<String>,
    regional_locations: Vec<String>,
    adjacent_locations: Vec<String>,
    trusted_handles: Vec<String>,
}

impl ScoringEngine {
    /// Build an engine; keyword lists are lower-cased once here.
    pub fn new(config: ScoringConfig) -> Self {
        let lower = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        let keywords = lower(&config.trending_keywords)
            .into_iter()
            .chain(lower(&config.regional_keywords))
            .collect();
        Self {
            keywords,
            indicators: lower(&config.trending_indicators),
            regional_locations: lower(&config.regional_locations),
            adjacent_locations: lower(&config.adjacent_locations),
            trusted_handles: lower(&config.trusted_handles),
            config,
        }
    }

    /// Weighted engagement per elapsed hour.
    ///
    /// # Errors
    ///
    /// [`ScoringInputError`] when the timestamp is missing or a counter is negative.
    pub fn engagement_velocity(
        &self,
        likes: i64,
        comments: i64,
        shares: i64,
        views: i64,
        posted_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<f64, ScoringInputError> {
        for (name, value) in [
            ("likes", likes),
            ("comments", comments),
            ("shares", shares),
            ("views", views),
        ] {
            if value < 0 {
                return Err(ScoringInputError::NegativeCounter(name, value));
            }
        }
        let posted_at = posted_at.ok_or(ScoringInputError::MissingTimestamp)?;

        let elapsed_hours = (now - posted_at).num_milliseconds() as f64 / 3_600_000.0;
        let hours = elapsed_hours.max(MIN_ELAPSED_HOURS);
        let weighted =
            likes as f64 + comments as f64 * 2.0 + shares as f64 * 3.0 + views as f64 * 0.1;
        Ok(weighted / hours)
    }

    pub fn credibility(&self, author: &str, is_trusted_source: bool) -> f64 {
        let handle = author.trim().to_lowercase();
        if is_trusted_source || self.trusted_handles.iter().any(|h| *h == handle) {
            100.0
        } else {
            50.0
        }
    }

    pub fn location_match(&self, location: Option<&str>) -> LocationMatch {
        let Some(location) = location.map(str::to_lowercase) else {
            return LocationMatch::Unrelated;
        };
        if self.regional_locations.iter().any(|l| location.contains(l.as_str())) {
            LocationMatch::Exact
        } else if self.adjacent_locations.iter().any(|l| location.contains(l.as_str())) {
            LocationMatch::Adjacent
        } else {
            LocationMatch::Unrelated
        }
    }

    pub fn topic_relevance(&self, content: &str, is_regional: bool, location: Option<&str>) -> f64 {
        if content.trim().is_empty() {
            return 0.0;
        }
        let text = content.to_lowercase();
        let cfg = &self.config;

        let matches = self.keywords.iter().filter(|k| text.contains(k.as_str())).count();
        let base = (matches as f64 * 20.0).min(100.0);
        let regional = if is_regional { cfg.regional_relevance_boost } else { 0.0 };
        let place = match self.location_match(location) {
            LocationMatch::Exact => cfg.exact_location_relevance_boost,
            LocationMatch::Adjacent => cfg.adjacent_location_relevance_boost,
            LocationMatch::Unrelated => 0.0,
        };
        let indicator = if self.indicators.iter().any(|i| text.contains(i.as_str())) {
            cfg.indicator_boost
        } else {
            0.0
        };

        (base + regional + place + indicator).min(100.0)
    }

    /// Weighted base score plus regional boosts. Deliberately not capped at 100.
    pub fn overall(
        &self,
        velocity: f64,
        credibility: f64,
        relevance: f64,
        is_regional: bool,
        location: Option<&str>,
    ) -> f64 {
        let cfg = &self.config;
        let mut score =
            (velocity / 10.0).min(100.0) * 0.5 + credibility * 0.3 + relevance * 0.2;
        if is_regional {
            score += cfg.regional_score_boost;
        }
        score += match self.location_match(location) {
            LocationMatch::Exact => cfg.exact_location_score_boost,
            LocationMatch::Adjacent => cfg.adjacent_location_score_boost,
            LocationMatch::Unrelated => 0.0,
        };
        score
    }

    /// Comma-joined explanation of which signals fired.
    pub fn reason(
        &self,
        input: &ScoreInput<'_>,
        velocity: f64,
        credibility: f64,
        relevance: f64,
    ) -> String {
        let mut reasons: Vec<&str> = Vec::new();
        let min_velocity = self.config.min_velocity;

        if velocity >= min_velocity * 2.0 {
            reasons.push("High engagement velocity");
        } else if velocity >= min_velocity {
            reasons.push("Rising engagement");
        }
        if credibility >= 80.0 {
            reasons.push("Trusted source");
        }
        if relevance >= 60.0 {
            reasons.push("Trending topic");
        }
        if input.is_regional {
            reasons.push("Regional content");
        }
        match self.location_match(input.location) {
            LocationMatch::Exact => reasons.push("Regional location"),
            LocationMatch::Adjacent => reasons.push("Adjacent-region location"),
            LocationMatch::Unrelated => {}
        }
        if input.likes >= 1000 || input.comments >= 100 || input.shares >= 50 {
            reasons.push("High engagement metrics");
        }

        if reasons.is_empty() {
            "Moderate engagement".to_string()
        } else {
            reasons.join(", ")
        }
    }

    /// AND gate over both floors.
    pub fn should_keep(&self, overall: f64, velocity: f64) -> bool {
        overall >= self.config.min_score && velocity >= self.config.min_velocity
    }

    /// Score one item from scratch. Malformed inputs score a velocity of zero.
    pub fn score(&self, input: &ScoreInput<'_>, now: DateTime<Utc>) -> ScoreCard {
        let velocity = self
            .engagement_velocity(
                input.likes,
                input.comments,
                input.shares,
                input.views,
                input.posted_at,
                now,
            )
            .unwrap_or_else(|e| {
                warn!(author = input.author, platform = %input.platform, error = %e, "Scoring input rejected; using zero velocity");
                0.0
            });
        let credibility = self.credibility(input.author, input.is_trusted_source);
        let relevance = self.topic_relevance(input.content, input.is_regional, input.location);
        let overall = self.overall(
            velocity,
            credibility,
            relevance,
            input.is_regional,
            input.location,
        );

        ScoreCard {
            engagement_velocity: velocity,
            credibility,
            topic_relevance: relevance,
            overall,
            reason: self.reason(input, velocity, credibility, relevance),
            keep: self.should_keep(overall, velocity),
        }
    }
}

/// Short display title for a story.
///
/// Google Trends items carry the search term as content, so it is used whole
/// after stripping the "Trending search in XX" suffix. Anything shorter than
/// three characters becomes "`author` on `platform`".
pub fn derive_headline(platform: Platform, author: &str, content: &str) -> String {
    let headline = if platform == Platform::GoogleTrends {
        TRENDS_SUFFIX.replace_all(&collapse_whitespace(content), " ").trim().to_string()
    } else {
        collapse_whitespace(content)
    };

    if headline.chars().count() < 3 {
        return format!("{author} on {platform}");
    }
    if headline.chars().count() > HEADLINE_MAX_CHARS {
        let cut: String = headline.chars().take(HEADLINE_MAX_CHARS - 3).collect();
        return format!("{cut}...");
    }
    headline
}

/// Coarse topic category from keyword families; first family wins.
pub fn derive_topic(content: &str) -> &'static str {
    const FAMILIES: [(&str, &[&str]); 4] = [
        ("Politics", &["politics", "election", "government"]),
        ("Entertainment", &["entertainment", "music", "movie", "celebrity"]),
        ("Sports", &["sports", "football", "cricket", "athletics"]),
        ("Tech", &["tech", "technology", "innovation", "startup"]),
    ];
    let text = content.to_lowercase();
    FAMILIES
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map(|(topic, _)| *topic)
        .unwrap_or("General")
}
