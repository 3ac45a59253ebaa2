//! Source registry: what to poll and when.
//!
//! Sources and hashtags are seeded from configuration by upsert, so importing
//! the same file twice changes nothing. They are never deleted; deactivation
//! flips `is_active` and keeps their history.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::config::{HashtagSeed, SourceSeed};
use crate::error::StorageError;
use crate::models::{Hashtag, Source};
use crate::storage::Store;

/// Whether `source` should be polled at `now`.
///
/// A source is due when it is active, not inside a rate-limit backoff window,
/// and either never polled or last polled at least one cadence ago.
pub fn is_due(source: &Source, now: DateTime<Utc>, default_cadence: i64) -> bool {
    if !source.is_active {
        return false;
    }
    if source.backoff_until.is_some_and(|until| now < until) {
        return false;
    }
    match source.last_polled_at {
        None => true,
        Some(last) => now - last >= Duration::minutes(source.cadence(default_cadence)),
    }
}

/// Hashtags share one fixed cadence.
pub fn hashtag_is_due(hashtag: &Hashtag, now: DateTime<Utc>, cadence_minutes: i64) -> bool {
    hashtag.is_active
        && hashtag
            .last_polled_at
            .is_none_or(|last| now - last >= Duration::minutes(cadence_minutes.max(1)))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub sources: usize,
    pub hashtags: usize,
}

#[derive(Debug, Clone)]
pub struct SourceRegistry {
    store: Store,
    default_cadence: i64,
}

impl SourceRegistry {
    pub fn new(store: Store, default_cadence: i64) -> Self {
        Self {
            store,
            default_cadence,
        }
    }

    /// Upsert configured seeds keyed by `(platform, handle)` and `tag`.
    #[instrument(level = "info", skip_all, fields(sources = sources.len(), hashtags = hashtags.len()))]
    pub async fn import(
        &self,
        sources: &[SourceSeed],
        hashtags: &[HashtagSeed],
    ) -> Result<ImportReport, StorageError> {
        for seed in sources {
            self.store.upsert_source(seed).await?;
        }
        for seed in hashtags {
            self.store.upsert_hashtag(seed).await?;
        }
        info!("Imported seeds");
        Ok(ImportReport {
            sources: sources.len(),
            hashtags: hashtags.len(),
        })
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<Source>, StorageError> {
        self.store.list_sources(active_only).await
    }

    /// Sources with the given ids, skipping unknown ids.
    pub async fn get_many(&self, ids: &[i64]) -> Result<Vec<Source>, StorageError> {
        let mut sources = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(source) = self.store.get_source(*id).await? {
                sources.push(source);
            }
        }
        Ok(sources)
    }

    #[instrument(level = "info", skip(self))]
    pub async fn set_active(&self, ids: &[i64], is_active: bool) -> Result<u64, StorageError> {
        let affected = self.store.set_sources_active(ids, is_active).await?;
        info!(affected, "Updated source activation");
        Ok(affected)
    }

    /// Active sources due at `now`, in id order.
    pub async fn due_sources(&self, now: DateTime<Utc>) -> Result<Vec<Source>, StorageError> {
        let sources = self.store.list_sources(true).await?;
        Ok(sources
            .into_iter()
            .filter(|s| is_due(s, now, self.default_cadence))
            .collect())
    }

    pub async fn due_hashtags(
        &self,
        now: DateTime<Utc>,
        cadence_minutes: i64,
    ) -> Result<Vec<Hashtag>, StorageError> {
        let hashtags = self.store.active_hashtags().await?;
        Ok(hashtags
            .into_iter()
            .filter(|h| hashtag_is_due(h, now, cadence_minutes))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    fn source(last_polled: Option<i64>, cadence: Option<i64>) -> Source {
        Source {
            id: 7,
            platform: Platform::Reddit,
            handle: "kenya".to_string(),
            display_name: None,
            account_id: None,
            is_active: true,
            is_trusted: false,
            is_regional: true,
            location: None,
            cadence_minutes: cadence,
            last_polled_at: last_polled.map(|m| now() - Duration::minutes(m)),
            backoff_until: None,
        }
    }

    fn seed(handle: &str) -> SourceSeed {
        SourceSeed {
            platform: Platform::Rss,
            handle: handle.to_string(),
            display_name: None,
            account_id: None,
            is_active: true,
            is_trusted: false,
            is_regional: false,
            location: None,
            cadence_minutes: None,
        }
    }

    #[test]
    fn due_boundary_is_inclusive() {
        assert!(!is_due(&source(Some(29), Some(30)), now(), 30));
        assert!(is_due(&source(Some(30), Some(30)), now(), 30));
        assert!(is_due(&source(None, Some(30)), now(), 30));
    }

    #[test]
    fn unset_cadence_uses_default() {
        assert!(!is_due(&source(Some(29), None), now(), 30));
        assert!(is_due(&source(Some(30), None), now(), 30));
        assert!(is_due(&source(Some(30), Some(-1)), now(), 30));
    }

    #[test]
    fn inactive_or_backed_off_sources_are_never_due() {
        let mut inactive = source(None, None);
        inactive.is_active = false;
        assert!(!is_due(&inactive, now(), 30));

        let mut backed_off = source(None, None);
        backed_off.backoff_until = Some(now() + Duration::minutes(1));
        assert!(!is_due(&backed_off, now(), 30));
        backed_off.backoff_until = Some(now());
        assert!(is_due(&backed_off, now(), 30));
    }

    #[tokio::test]
    async fn import_twice_is_stable_and_deactivation_is_soft() {
        let store = Store::in_memory().await;
        let registry = SourceRegistry::new(store, 30);
        let seeds = vec![seed("https://a.example/rss"), seed("https://b.example/rss")];
        let tags = vec![HashtagSeed {
            tag: "#Nairobi".to_string(),
            platform_scope: "all".to_string(),
            is_regional: true,
            is_active: true,
            posts_per_hashtag: 20,
        }];

        registry.import(&seeds, &tags).await.unwrap();
        registry.import(&seeds, &tags).await.unwrap();
        let all = registry.list(false).await.unwrap();
        assert_eq!(all.len(), 2);

        registry.set_active(&[all[0].id], false).await.unwrap();
        let due = registry.due_sources(now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, all[1].id);
        assert_eq!(registry.list(false).await.unwrap().len(), 2);
        let fetched = registry.get_many(&[all[0].id, 999]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(!fetched[0].is_active);

        let hashtags = registry.due_hashtags(now(), 30).await.unwrap();
        assert_eq!(hashtags.len(), 1);
    }
}
