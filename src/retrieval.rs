//! Ranked retrieval over scored stories.
//!
//! The order is fixed and defines "trending" for every consumer:
//! `engagement_velocity` desc, region flag desc, `overall_score` desc,
//! `posted_at` desc. Filters only narrow the set; they never change the order.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::Serialize;
use tracing::{info, instrument};

use crate::config::RegionConfig;
use crate::error::StorageError;
use crate::models::{Platform, Story};
use crate::storage::{StoryFilter, Store};

const HIGH_VELOCITY: f64 = 100.0;
const MEDIUM_VELOCITY: f64 = 50.0;
const MIN_KEYWORD_CHARS: usize = 5;

/// Consumer-facing query. `location` matching the configured continent name
/// expands to the continent's location list OR'd with the region flag.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub platform: Option<Platform>,
    pub min_score: Option<f64>,
    pub hours_back: i64,
    pub is_regional: Option<bool>,
    pub location: Option<String>,
    pub topic: Option<String>,
    pub limit: i64,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            platform: None,
            min_score: None,
            hours_back: 24,
            is_regional: None,
            location: None,
            topic: None,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VelocityTier {
    High,
    Medium,
    Low,
}

impl VelocityTier {
    pub fn of(velocity: f64) -> Self {
        if velocity >= HIGH_VELOCITY {
            VelocityTier::High
        } else if velocity >= MEDIUM_VELOCITY {
            VelocityTier::Medium
        } else {
            VelocityTier::Low
        }
    }
}

/// What a story looks like to a dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryView {
    pub id: String,
    pub headline: String,
    pub source: String,
    pub platform: Platform,
    pub engagement: i64,
    pub velocity: VelocityTier,
    pub reason: String,
    pub timestamp: String,
    pub credibility: i64,
    pub url: String,
}

impl From<&Story> for StoryView {
    fn from(story: &Story) -> Self {
        let headline = if story.headline.is_empty() {
            story.content.chars().take(100).collect()
        } else {
            story.headline.clone()
        };
        let reason = if story.reason.is_empty() {
            "High engagement".to_string()
        } else {
            story.reason.clone()
        };
        Self {
            id: story.id.to_string(),
            headline,
            source: story.author.clone(),
            platform: story.platform,
            engagement: story.likes + story.comments + story.shares,
            velocity: VelocityTier::of(story.engagement_velocity),
            reason,
            timestamp: story.posted_at.format("%Y-%m-%d %H:%M").to_string(),
            credibility: story.credibility_score as i64,
            url: story.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedCount {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicCluster {
    pub topic: String,
    pub count: usize,
    /// `"rising"` when the topic has more stories than the per-topic average.
    pub velocity: &'static str,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Insights {
    pub total_stories: usize,
    pub high_velocity: usize,
    pub medium_velocity: usize,
    pub low_velocity: usize,
    pub trending_topics: Vec<NamedCount>,
    pub platform_distribution: BTreeMap<Platform, usize>,
    pub top_keywords: Vec<NamedCount>,
    pub topic_clusters: Vec<TopicCluster>,
}

/// Largest counts first; ties broken by name so output is stable.
fn top_counts<'a>(values: impl Iterator<Item = &'a str>, n: usize) -> Vec<NamedCount> {
    values
        .counts()
        .into_iter()
        .sorted_by(|(a_name, a), (b_name, b)| b.cmp(a).then_with(|| a_name.cmp(b_name)))
        .take(n)
        .map(|(name, count)| NamedCount {
            name: name.to_string(),
            count,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Retrieval {
    store: Store,
    region: RegionConfig,
}

impl Retrieval {
    pub fn new(store: Store, region: RegionConfig) -> Self {
        Self { store, region }
    }

    /// Translate consumer parameters into storage filters at `now`.
    pub fn filter(&self, params: &QueryParams, now: DateTime<Utc>) -> StoryFilter {
        let mut filter = StoryFilter {
            platform: params.platform,
            min_score: params.min_score.filter(|s| *s > 0.0),
            posted_since: Some(now - Duration::hours(params.hours_back.max(1))),
            is_regional: params.is_regional,
            topic: params.topic.clone(),
            limit: params.limit.max(1),
            ..Default::default()
        };
        if let Some(location) = params.location.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            if location.eq_ignore_ascii_case(&self.region.continent) {
                filter.location_any = self.region.continent_locations.clone();
                filter.location_or_regional = true;
            } else {
                filter.location_any = vec![location.to_lowercase()];
            }
        }
        filter
    }

    #[instrument(level = "info", skip_all, fields(platform = ?params.platform, location = ?params.location))]
    pub async fn query(&self, params: &QueryParams, now: DateTime<Utc>) -> Result<Vec<Story>, StorageError> {
        let stories = self.store.query_stories(&self.filter(params, now)).await?;
        info!(count = stories.len(), "Served ranked stories");
        Ok(stories)
    }

    pub async fn query_views(&self, params: &QueryParams, now: DateTime<Utc>) -> Result<Vec<StoryView>, StorageError> {
        let stories = self.query(params, now).await?;
        Ok(stories.iter().map(StoryView::from).collect())
    }

    pub async fn story(&self, id: i64) -> Result<Option<StoryView>, StorageError> {
        Ok(self.store.get_story(id).await?.as_ref().map(StoryView::from))
    }

    /// Aggregate statistics over active stories of the last `hours_back` hours.
    #[instrument(level = "info", skip(self, now))]
    pub async fn insights(&self, hours_back: i64, now: DateTime<Utc>) -> Result<Insights, StorageError> {
        let stories = self
            .store
            .query_stories(&StoryFilter {
                posted_since: Some(now - Duration::hours(hours_back.max(1))),
                limit: i64::MAX,
                ..Default::default()
            })
            .await?;

        let tiers = stories
            .iter()
            .map(|s| VelocityTier::of(s.engagement_velocity))
            .counts();
        let topic_total = stories.iter().map(|s| s.topic.as_str()).unique().count();
        let trending_topics = top_counts(stories.iter().map(|s| s.topic.as_str()), 5);

        let lowered: Vec<String> = stories.iter().map(|s| s.headline.to_lowercase()).collect();
        let top_keywords = top_counts(
            lowered
                .iter()
                .flat_map(|h| h.split_whitespace())
                .filter(|w| w.chars().count() >= MIN_KEYWORD_CHARS),
            10,
        );

        let average = if topic_total == 0 {
            0.0
        } else {
            stories.len() as f64 / topic_total as f64
        };
        let cluster_keywords: Vec<String> = top_keywords.iter().take(3).map(|k| k.name.clone()).collect();
        let topic_clusters = trending_topics
            .iter()
            .map(|t| TopicCluster {
                topic: t.name.clone(),
                count: t.count,
                velocity: if t.count as f64 > average { "rising" } else { "stable" },
                keywords: cluster_keywords.clone(),
            })
            .collect();

        Ok(Insights {
            total_stories: stories.len(),
            high_velocity: tiers.get(&VelocityTier::High).copied().unwrap_or(0),
            medium_velocity: tiers.get(&VelocityTier::Medium).copied().unwrap_or(0),
            low_velocity: tiers.get(&VelocityTier::Low).copied().unwrap_or(0),
            platform_distribution: stories.iter().map(|s| s.platform).counts().into_iter().collect(),
            trending_topics,
            top_keywords,
            topic_clusters,
        })
    }
}
