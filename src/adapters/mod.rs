//! Platform adapters: the only code that talks to the outside world.
//!
//! Each adapter turns one [`Source`] (or a search term) into a list of
//! [`NormalizedItem`]s. Adapters never touch the database and never decide
//! what is trending; they only fetch and normalize.
//!
//! # Supported Platforms
//!
//! | Platform | Module | Method | Notes |
//! |----------|--------|--------|-------|
//! | RSS / Atom | [`rss`] | Feed XML | Engagement is estimated from recency and indicator words |
//! | Reddit | [`reddit`] | Public JSON (`hot.json`, `search.json`) | Supports hashtag search |
//! | Google Trends | [`google_trends`] | Daily trends RSS | Traffic drives estimated engagement |
//! | Facebook | [`facebook`] | Graph API page posts | Needs an access token and a Page id |
//!
//! Adapters are resolved once at startup into an [`AdapterRegistry`] keyed by
//! [`Platform`] and each is wrapped in a [`RetryingAdapter`].

pub mod facebook;
pub mod google_trends;
pub mod reddit;
pub mod retry;
pub mod rss;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::{AppConfig, RegionConfig, SchedulerConfig};
use crate::error::AdapterError;
use crate::models::{NormalizedItem, Platform, Source};
use crate::utils::mentions_any;

pub use retry::RetryingAdapter;

/// Contract every platform client implements.
#[async_trait]
pub trait PlatformAdapter: Send + Sync + fmt::Debug {
    fn platform(&self) -> Platform;

    /// Fetch up to `limit` recent items for `source`, in platform order.
    async fn fetch(&self, source: &Source, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError>;

    /// Search the platform for a query term.
    async fn search(&self, term: &str, limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
        let _ = (term, limit);
        Err(AdapterError::Unsupported("search"))
    }
}

/// Mapping from platform to its adapter, built once.
#[derive(Debug, Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under its own platform, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

/// Per-platform caps on concurrent adapter calls, shared by every caller.
///
/// Source polls, hashtag searches and aggregation fetches all go through the
/// same permits, so one platform never sees more than its configured number
/// of requests at once.
#[derive(Debug)]
pub struct PlatformLimits {
    permits: HashMap<Platform, Semaphore>,
    deadline: Duration,
}

impl PlatformLimits {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            permits: Platform::ALL
                .into_iter()
                .map(|p| (p, Semaphore::new(config.platform_concurrency(p))))
                .collect(),
            deadline: Duration::from_secs(config.fetch_timeout_secs.max(1)),
        }
    }

    /// Run `call` under the platform's permit and the fetch deadline.
    pub async fn call<F>(&self, platform: Platform, call: F) -> Result<Vec<NormalizedItem>, AdapterError>
    where
        F: Future<Output = Result<Vec<NormalizedItem>, AdapterError>>,
    {
        let _permit = match self.permits.get(&platform) {
            Some(permits) => permits.acquire().await.ok(),
            None => None,
        };
        match timeout(self.deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout),
        }
    }
}

/// Content-based detection of the priority region.
#[derive(Debug, Clone, Default)]
pub struct RegionHints {
    name: String,
    keywords: Vec<String>,
}

impl RegionHints {
    pub fn new(config: &RegionConfig) -> Self {
        Self {
            name: config.name.clone(),
            keywords: config
                .detection_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }

    /// `(Some(true), Some(region))` when `text` mentions the region, otherwise no signal.
    ///
    /// No signal lets ingestion fall back to the owning source's flags.
    pub fn detect(&self, text: &str) -> (Option<bool>, Option<String>) {
        if mentions_any(text, &self.keywords) {
            (Some(true), Some(self.name.clone()))
        } else {
            (None, None)
        }
    }
}

/// Build the HTTP client shared by every adapter.
pub fn http_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client, AdapterError> {
    let client = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()?;
    Ok(client)
}

/// Build the registry for every platform with a concrete adapter.
///
/// X, Instagram and TikTok have no adapter; their sources fail with
/// `NoAdapter` and the failure is recorded in their poll runs.
pub fn build_registry(config: &AppConfig) -> Result<AdapterRegistry, AdapterError> {
    let client = http_client(
        &config.credentials.reddit_user_agent,
        Duration::from_secs(config.scheduler.fetch_timeout_secs.max(1)),
    )?;
    let region = RegionHints::new(&config.region);

    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(RetryingAdapter::with_defaults(rss::RssAdapter::new(
        client.clone(),
        region.clone(),
    ))));
    registry.register(Arc::new(RetryingAdapter::with_defaults(reddit::RedditAdapter::new(
        client.clone(),
        region.clone(),
    ))));
    registry.register(Arc::new(RetryingAdapter::with_defaults(
        google_trends::GoogleTrendsAdapter::new(client.clone(), region),
    )));
    registry.register(Arc::new(RetryingAdapter::with_defaults(
        facebook::FacebookAdapter::new(client, config.credentials.facebook_access_token.clone()),
    )));

    info!(platforms = ?registry.platforms(), "Adapters registered");
    Ok(registry)
}

/// Send `request` and return the body, mapping HTTP failures onto [`AdapterError`].
pub(crate) async fn send_text(request: RequestBuilder) -> Result<String, AdapterError> {
    let response = request.send().await?;
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(AdapterError::RateLimited { retry_after });
    }
    if !status.is_success() {
        return Err(AdapterError::HttpStatus(status.as_u16()));
    }
    let body = response.text().await?;
    debug!(bytes = body.len(), "Fetched response body");
    Ok(body)
}


#[cfg(test)]
mod tests {
    use super::*;
    use testing::FakeAdapter;

    #[test]
    fn registry_resolves_by_platform() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(FakeAdapter::new(Platform::Reddit)));
        registry.register(Arc::new(FakeAdapter::new(Platform::Rss)));

        assert!(registry.get(Platform::Reddit).is_some());
        assert!(registry.get(Platform::TikTok).is_none());
        assert_eq!(registry.platforms(), vec![Platform::Reddit, Platform::Rss]);
    }

    #[test]
    fn build_registry_covers_concrete_platforms() {
        let registry = build_registry(&AppConfig::default()).unwrap();
        assert_eq!(
            registry.platforms(),
            vec![Platform::Facebook, Platform::Reddit, Platform::Rss, Platform::GoogleTrends]
        );
    }

    #[test]
    fn region_hints_signal_only_on_mentions() {
        let hints = RegionHints::new(&RegionConfig::default());
        assert_eq!(
            hints.detect("Floods in Kisumu county"),
            (Some(true), Some("Kenya".to_string()))
        );
        assert_eq!(hints.detect("Floods in Lagos"), (None, None));
    }

    #[tokio::test]
    async fn search_defaults_to_unsupported() {
        #[derive(Debug)]
        struct FetchOnly;

        #[async_trait]
        impl PlatformAdapter for FetchOnly {
            fn platform(&self) -> Platform {
                Platform::X
            }

            async fn fetch(&self, _source: &Source, _limit: usize) -> Result<Vec<NormalizedItem>, AdapterError> {
                Ok(Vec::new())
            }
        }

        let err = FetchOnly.search("nairobi", 5).await.unwrap_err();
        assert!(matches!(err, AdapterError::Unsupported("search")));
    }
}
