//! YAML configuration with defaults for every knob.
//!
//! An absent config file is not an error: [`AppConfig::default`] describes a
//! working deployment with no seeded sources. Each section is an immutable value
//! handed to the component that needs it; nothing reads configuration from
//! global state.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::ConfigError;
use crate::models::{DEFAULT_CADENCE_MINUTES, Platform};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub scheduler: SchedulerConfig,
    pub scoring: ScoringConfig,
    pub aggregator: AggregatorConfig,
    pub region: RegionConfig,
    pub credentials: Credentials,
    pub sources: Vec<SourceSeed>,
    pub hashtags: Vec<HashtagSeed>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://trend_radar.db".to_string(),
            max_connections: 4,
            scheduler: SchedulerConfig::default(),
            scoring: ScoringConfig::default(),
            aggregator: AggregatorConfig::default(),
            region: RegionConfig::default(),
            credentials: Credentials::default(),
            sources: Vec::new(),
            hashtags: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, falling back to defaults when the file is missing.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file not found; using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&raw)?;
        info!(
            sources = config.sources.len(),
            hashtags = config.hashtags.len(),
            "Loaded configuration"
        );
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between ticks. Per-source cadence is checked on every tick.
    pub tick_interval_secs: u64,
    pub max_concurrent_polls: usize,
    /// Concurrent adapter calls allowed per platform; platforms not listed get `default_platform_concurrency`.
    pub per_platform_concurrency: HashMap<Platform, usize>,
    pub default_platform_concurrency: usize,
    pub fetch_limit: usize,
    pub fetch_timeout_secs: u64,
    pub default_cadence_minutes: i64,
    /// Minimum wait after a rate-limit response, per platform.
    pub rate_limit_backoff_minutes: HashMap<Platform, i64>,
    pub default_backoff_minutes: i64,
    pub hashtag_cadence_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            max_concurrent_polls: 8,
            per_platform_concurrency: HashMap::new(),
            default_platform_concurrency: 2,
            fetch_limit: 50,
            fetch_timeout_secs: 30,
            default_cadence_minutes: DEFAULT_CADENCE_MINUTES,
            rate_limit_backoff_minutes: HashMap::new(),
            default_backoff_minutes: 15,
            hashtag_cadence_minutes: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn platform_concurrency(&self, platform: Platform) -> usize {
        self.per_platform_concurrency
            .get(&platform)
            .copied()
            .unwrap_or(self.default_platform_concurrency)
            .max(1)
    }

    pub fn backoff_minutes(&self, platform: Platform) -> i64 {
        self.rate_limit_backoff_minutes
            .get(&platform)
            .copied()
            .unwrap_or(self.default_backoff_minutes)
            .max(1)
    }
}

/// Inputs of the scoring engine. Every weight and boost is a policy knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub min_score: f64,
    pub min_velocity: f64,
    pub trusted_handles: Vec<String>,
    pub trending_keywords: Vec<String>,
    /// Region-specific phrases, matched alongside `trending_keywords`.
    pub regional_keywords: Vec<String>,
    pub regional_locations: Vec<String>,
    pub adjacent_locations: Vec<String>,
    pub trending_indicators: Vec<String>,
    pub regional_relevance_boost: f64,
    pub exact_location_relevance_boost: f64,
    pub adjacent_location_relevance_boost: f64,
    pub indicator_boost: f64,
    pub regional_score_boost: f64,
    pub exact_location_score_boost: f64,
    pub adjacent_location_score_boost: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_score: 30.0,
            min_velocity: 5.0,
            trusted_handles: Vec::new(),
            trending_keywords: strings(&[
                "breaking", "election", "crisis", "announcement", "scandal", "protest",
                "viral", "trending", "shocking", "exclusive", "investigation", "revealed",
                "outrage", "controversy", "resignation", "arrest", "court", "verdict",
                "emergency", "disaster", "accident", "fire", "flood", "earthquake",
                "pandemic", "outbreak", "health", "medical", "vaccine", "treatment",
                "technology", "innovation", "launch", "release", "update", "hack",
                "celebration", "victory", "champion", "award", "record", "achievement",
                "politics", "government", "policy", "law", "bill", "vote",
                "economy", "market", "stock", "business", "trade", "finance",
                "sports", "match", "game", "tournament", "championship", "win",
                "entertainment", "movie", "music", "celebrity", "premiere", "awards",
            ]),
            regional_keywords: strings(&[
                "Kenya elections", "Nairobi news", "Mombasa", "Kenyan politics",
                "Kenya entertainment", "Kenya sports", "Kenya tech", "Ruto", "Raila",
                "Kenya breaking", "Kenya trending",
            ]),
            regional_locations: strings(&[
                "Nairobi", "Mombasa", "Kisumu", "Nakuru", "Eldoret", "Kenya",
            ]),
            adjacent_locations: strings(&[
                "africa", "lagos", "johannesburg", "cairo", "accra", "dar es salaam", "kampala",
            ]),
            trending_indicators: strings(&[
                "breaking", "viral", "trending", "shocking", "exclusive", "outrage",
                "controversy", "emergency", "scandal",
            ]),
            regional_relevance_boost: 30.0,
            exact_location_relevance_boost: 25.0,
            adjacent_location_relevance_boost: 15.0,
            indicator_boost: 25.0,
            regional_score_boost: 15.0,
            exact_location_score_boost: 10.0,
            adjacent_location_score_boost: 5.0,
        }
    }
}

/// Settings for computing trends on platforms with no native trending endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub platforms: Vec<Platform>,
    pub posts_per_source: usize,
    pub top_n: usize,
    pub min_trend_score: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            platforms: vec![Platform::Facebook],
            posts_per_source: 10,
            top_n: 50,
            min_trend_score: 10.0,
        }
    }
}

/// The operator's priority geography, used by adapters and the continent filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Location assigned to items detected as regional by content.
    pub name: String,
    /// Lower-case words that mark content as regional.
    pub detection_keywords: Vec<String>,
    /// Filter value that expands to `continent_locations`.
    pub continent: String,
    pub continent_locations: Vec<String>,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: "Kenya".to_string(),
            detection_keywords: strings(&[
                "kenya", "nairobi", "mombasa", "kenyan", "ruto", "raila", "kisumu",
            ]),
            continent: "africa".to_string(),
            continent_locations: strings(&[
                "africa", "kenya", "nigeria", "south africa", "ghana", "tanzania", "uganda",
                "nairobi", "mombasa", "lagos", "johannesburg", "cairo", "accra",
                "dar es salaam", "kampala", "kisumu", "nakuru", "eldoret",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub facebook_access_token: Option<String>,
    pub reddit_user_agent: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            facebook_access_token: None,
            reddit_user_agent: concat!("trend_radar/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// A source as declared in configuration; imported by upsert on `(platform, handle)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSeed {
    pub platform: Platform,
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_trusted: bool,
    #[serde(default)]
    pub is_regional: bool,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub cadence_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashtagSeed {
    pub tag: String,
    #[serde(default = "default_scope")]
    pub platform_scope: String,
    #[serde(default = "default_true")]
    pub is_regional: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_posts_per_hashtag")]
    pub posts_per_hashtag: i64,
}

fn default_true() -> bool {
    true
}

fn default_scope() -> String {
    "all".to_string()
}

fn default_posts_per_hashtag() -> i64 {
    20
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load("/definitely/not/here/trend_radar.yaml").unwrap();
        assert_eq!(config.scheduler.default_cadence_minutes, 30);
        assert_eq!(config.aggregator.platforms, vec![Platform::Facebook]);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r##"
database_url: "sqlite::memory:"
scheduler:
  tick_interval_secs: 5
  per_platform_concurrency:
    RSS: 6
  rate_limit_backoff_minutes:
    Twitter: 60
scoring:
  min_score: 40
sources:
  - platform: RSS
    handle: https://feeds.bbci.co.uk/news/rss.xml
    is_trusted: true
    cadence_minutes: 15
  - platform: Reddit
    handle: kenya
    is_regional: true
hashtags:
  - tag: "#Nairobi"
"##
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.scheduler.tick_interval_secs, 5);
        assert_eq!(config.scheduler.fetch_limit, 50);
        assert_eq!(config.scheduler.platform_concurrency(Platform::Rss), 6);
        assert_eq!(config.scheduler.platform_concurrency(Platform::Reddit), 2);
        assert_eq!(config.scheduler.backoff_minutes(Platform::X), 60);
        assert_eq!(config.scheduler.backoff_minutes(Platform::Rss), 15);
        assert_eq!(config.scoring.min_score, 40.0);
        assert_eq!(config.scoring.min_velocity, 5.0);
        assert_eq!(config.sources.len(), 2);
        assert!(config.sources[0].is_active);
        assert_eq!(config.sources[1].cadence_minutes, None);
        assert_eq!(config.hashtags[0].platform_scope, "all");
        assert_eq!(config.hashtags[0].posts_per_hashtag, 20);
    }

    #[test]
    fn malformed_yaml_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "scheduler: [not, a, map]").unwrap();
        assert!(matches!(AppConfig::load(file.path()), Err(ConfigError::Yaml(_))));
    }
}
