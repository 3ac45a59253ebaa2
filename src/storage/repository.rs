use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::{HashtagSeed, SourceSeed};
use crate::error::StorageError;
use crate::models::{
    Hashtag, Platform, PollCounts, PollKind, PollRun, PollStatus, RawItem, Source, Story,
};

const SOURCE_COLUMNS: &str = "id, platform, handle, display_name, account_id, is_active, is_trusted, \
     is_regional, location, cadence_minutes, last_polled_at, backoff_until";

const HASHTAG_COLUMNS: &str =
    "id, tag, platform_scope, is_regional, is_active, posts_per_hashtag, last_polled_at";

const RAW_ITEM_COLUMNS: &str = "id, platform, external_id, source_id, hashtag_id, author, content, url, \
     posted_at, likes, comments, shares, views, is_regional, location, raw_payload, ingested_at";

const STORY_COLUMNS: &str = "id, raw_item_id, platform, author, content, url, posted_at, likes, comments, \
     shares, views, engagement_velocity, credibility_score, topic_relevance_score, overall_score, \
     reason, headline, topic, is_regional, location, is_active";

const POLL_RUN_COLUMNS: &str = "id, kind, source_id, hashtag_id, platform, status, items_fetched, \
     items_processed, items_kept, error_message, started_at, completed_at, duration_seconds";

/// `LIKE` pattern matching `needle` anywhere, with its wildcards taken literally.
fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// A raw item ready to insert; region fields are already resolved.
#[derive(Debug, Clone)]
pub struct NewRawItem {
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

/// Fully computed story fields for one raw item.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryDraft {
    pub raw_item_id: i64,
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
}

/// SQL-level filters for ranked retrieval.
#[derive(Debug, Clone, Default)]
pub struct StoryFilter {
    pub platform: Option<Platform>,
    pub min_score: Option<f64>,
    pub posted_since: Option<DateTime<Utc>>,
    pub is_regional: Option<bool>,
    /// Lower-case substrings OR'd against `location`.
    pub location_any: Vec<String>,
    /// Also match regional stories when filtering by `location_any`.
    pub location_or_regional: bool,
    pub topic: Option<String>,
    pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the database and run embedded migrations.
    ///
    /// In-memory databases are pinned to one connection; each SQLite
    /// connection to `:memory:` would otherwise see its own empty database.
    #[instrument(level = "info", skip_all, fields(%database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let in_memory = database_url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { max_connections.max(1) })
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn in_memory() -> Self {
        Self::connect("sqlite::memory:", 1)
            .await
            .expect("in-memory database must open")
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction for one scrape or aggregation batch.
    pub async fn begin(&self) -> Result<Batch<'static>, StorageError> {
        Ok(Batch {
            tx: self.pool.begin().await?,
        })
    }

    /// Insert or refresh a seeded source keyed by `(platform, handle)`.
    ///
    /// The seed's `is_active` applies only to new rows; an existing source keeps
    /// whatever activation an admin last set.
    pub async fn upsert_source(&self, source: &SourceSeed) -> Result<Source, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sources (platform, handle, display_name, account_id, is_active, is_trusted, is_regional, location, cadence_minutes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(platform, handle) DO UPDATE SET
              display_name = excluded.display_name,
              account_id = excluded.account_id,
              is_trusted = excluded.is_trusted,
              is_regional = excluded.is_regional,
              location = excluded.location,
              cadence_minutes = excluded.cadence_minutes,
              updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(source.platform.as_str())
        .bind(&source.handle)
        .bind(&source.display_name)
        .bind(&source.account_id)
        .bind(source.is_active)
        .bind(source.is_trusted)
        .bind(source.is_regional)
        .bind(&source.location)
        .bind(source.cadence_minutes)
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE platform = ?1 AND handle = ?2"
        ))
        .bind(source.platform.as_str())
        .bind(&source.handle)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list_sources(&self, active_only: bool) -> Result<Vec<Source>, StorageError> {
        let rows = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE (?1 = 0 OR is_active = 1) ORDER BY id"
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn active_sources_for(&self, platform: Platform) -> Result<Vec<Source>, StorageError> {
        let rows = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE is_active = 1 AND platform = ?1 ORDER BY id"
        ))
        .bind(platform.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_source(&self, id: i64) -> Result<Option<Source>, StorageError> {
        let row = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Soft (de)activation; sources are never deleted.
    pub async fn set_sources_active(
        &self,
        source_ids: &[i64],
        is_active: bool,
    ) -> Result<u64, StorageError> {
        if source_ids.is_empty() {
            return Ok(0);
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE sources SET is_active = ");
        query.push_bind(is_active);
        query.push(", updated_at = CURRENT_TIMESTAMP WHERE id IN (");
        let mut separated = query.separated(", ");
        for source_id in source_ids {
            separated.push_bind(*source_id);
        }
        separated.push_unseparated(")");

        let affected = query.build().execute(&self.pool).await?.rows_affected();
        Ok(affected)
    }

    pub async fn set_backoff(
        &self,
        source_id: i64,
        until: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE sources SET backoff_until = ?1 WHERE id = ?2")
            .bind(until)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_hashtag(&self, hashtag: &HashtagSeed) -> Result<Hashtag, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO hashtags (tag, platform_scope, is_regional, is_active, posts_per_hashtag)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(tag) DO UPDATE SET
              platform_scope = excluded.platform_scope,
              is_regional = excluded.is_regional,
              is_active = excluded.is_active,
              posts_per_hashtag = excluded.posts_per_hashtag
            "#,
        )
        .bind(&hashtag.tag)
        .bind(&hashtag.platform_scope)
        .bind(hashtag.is_regional)
        .bind(hashtag.is_active)
        .bind(hashtag.posts_per_hashtag)
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_as::<_, Hashtag>(&format!(
            "SELECT {HASHTAG_COLUMNS} FROM hashtags WHERE tag = ?1"
        ))
        .bind(&hashtag.tag)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn active_hashtags(&self) -> Result<Vec<Hashtag>, StorageError> {
        let rows = sqlx::query_as::<_, Hashtag>(&format!(
            "SELECT {HASHTAG_COLUMNS} FROM hashtags WHERE is_active = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Raw items posted (or, lacking a timestamp, ingested) at or after `since`.
    pub async fn raw_items_since(&self, since: DateTime<Utc>) -> Result<Vec<RawItem>, StorageError> {
        let rows = sqlx::query_as::<_, RawItem>(&format!(
            "SELECT {RAW_ITEM_COLUMNS} FROM raw_items WHERE COALESCE(posted_at, ingested_at) >= ?1 ORDER BY id"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Ids of trusted sources among `ids`.
    pub async fn trusted_source_ids(&self, ids: &[i64]) -> Result<Vec<i64>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query =
            QueryBuilder::<Sqlite>::new("SELECT id FROM sources WHERE is_trusted = 1 AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let rows: Vec<(i64,)> = query.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Active stories matching `filter`, in the fixed trending order.
    pub async fn query_stories(&self, filter: &StoryFilter) -> Result<Vec<Story>, StorageError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE is_active = 1"
        ));
        if let Some(since) = filter.posted_since {
            query.push(" AND posted_at >= ").push_bind(since);
        }
        if let Some(platform) = filter.platform {
            query.push(" AND platform = ").push_bind(platform.as_str());
        }
        if let Some(min_score) = filter.min_score {
            query.push(" AND overall_score >= ").push_bind(min_score);
        }
        if let Some(is_regional) = filter.is_regional {
            query.push(" AND is_regional = ").push_bind(is_regional);
        }
        if !filter.location_any.is_empty() {
            query.push(" AND (");
            let mut any = query.separated(" OR ");
            for needle in &filter.location_any {
                any.push("LOWER(COALESCE(location, '')) LIKE ")
                    .push_bind_unseparated(contains_pattern(&needle.to_lowercase()))
                    .push_unseparated(" ESCAPE '\\'");
            }
            if filter.location_or_regional {
                any.push("is_regional = 1");
            }
            query.push(")");
        }
        if let Some(topic) = &filter.topic {
            query.push(" AND topic = ").push_bind(topic.clone());
        }
        query.push(
            " ORDER BY engagement_velocity DESC, is_regional DESC, overall_score DESC, posted_at DESC LIMIT ",
        );
        query.push_bind(filter.limit.max(0));

        let rows = query.build_query_as::<Story>().fetch_all(&self.pool).await?;
        debug!(count = rows.len(), "Queried stories");
        Ok(rows)
    }

    pub async fn get_story(&self, id: i64) -> Result<Option<Story>, StorageError> {
        let row = sqlx::query_as::<_, Story>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Open a poll run in `running` state and return its id.
    pub async fn start_poll_run(
        &self,
        kind: PollKind,
        source_id: Option<i64>,
        hashtag_id: Option<i64>,
        platform: Option<Platform>,
        started_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO poll_runs (kind, source_id, hashtag_id, platform, status, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING id
            "#,
        )
        .bind(kind.as_str())
        .bind(source_id)
        .bind(hashtag_id)
        .bind(platform.map(|p| p.as_str()))
        .bind(PollStatus::Running.as_str())
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Finalize a poll run. Only a `running` row is updated, so a run is finalized once.
    pub async fn finish_poll_run(
        &self,
        run_id: i64,
        status: PollStatus,
        counts: &PollCounts,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let started_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT started_at FROM poll_runs WHERE id = ?1 AND status = 'running'",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(started_at) = started_at else {
            return Ok(false);
        };
        let duration = (completed_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;

        let affected = sqlx::query(
            r#"
            UPDATE poll_runs
            SET status = ?1,
                items_fetched = ?2,
                items_processed = ?3,
                items_kept = ?4,
                error_message = ?5,
                completed_at = ?6,
                duration_seconds = ?7
            WHERE id = ?8 AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(counts.fetched as i64)
        .bind(counts.processed as i64)
        .bind(counts.kept as i64)
        .bind(error_message)
        .bind(completed_at)
        .bind(duration)
        .bind(run_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn recent_poll_runs(&self, limit: i64) -> Result<Vec<PollRun>, StorageError> {
        let rows = sqlx::query_as::<_, PollRun>(&format!(
            "SELECT {POLL_RUN_COLUMNS} FROM poll_runs ORDER BY id DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// One open transaction. Dropping it without [`Batch::commit`] rolls back.
pub struct Batch<'c> {
    tx: Transaction<'c, Sqlite>,
}

impl Batch<'_> {
    pub async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Insert unless `(platform, external_id)` already exists; `None` means duplicate.
    pub async fn insert_raw_item(
        &mut self,
        item: &NewRawItem,
    ) -> Result<Option<RawItem>, StorageError> {
        let row = sqlx::query_as::<_, RawItem>(&format!(
            r#"
            INSERT INTO raw_items (platform, external_id, source_id, hashtag_id, author, content, url, posted_at,
                                   likes, comments, shares, views, is_regional, location, raw_payload, ingested_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(platform, external_id) DO NOTHING
            RETURNING {RAW_ITEM_COLUMNS}
            "#
        ))
        .bind(item.platform.as_str())
        .bind(&item.external_id)
        .bind(item.source_id)
        .bind(item.hashtag_id)
        .bind(&item.author)
        .bind(&item.content)
        .bind(&item.url)
        .bind(item.posted_at)
        .bind(item.likes)
        .bind(item.comments)
        .bind(item.shares)
        .bind(item.views)
        .bind(item.is_regional)
        .bind(&item.location)
        .bind(&item.raw_payload)
        .bind(item.ingested_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    pub async fn mark_source_polled(
        &mut self,
        source_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE sources SET last_polled_at = ?1, backoff_until = NULL, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
        )
        .bind(at)
        .bind(source_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn mark_hashtag_polled(
        &mut self,
        hashtag_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE hashtags SET last_polled_at = ?1 WHERE id = ?2")
            .bind(at)
            .bind(hashtag_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Create the story for a raw item, or overwrite its scores in place.
    pub async fn upsert_story(
        &mut self,
        draft: &StoryDraft,
        now: DateTime<Utc>,
    ) -> Result<Story, StorageError> {
        let row = sqlx::query_as::<_, Story>(&format!(
            r#"
            INSERT INTO stories (raw_item_id, platform, author, content, url, posted_at, likes, comments, shares, views,
                                 engagement_velocity, credibility_score, topic_relevance_score, overall_score,
                                 reason, headline, topic, is_regional, location, is_active, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, 1, ?20)
            ON CONFLICT(raw_item_id) DO UPDATE SET
              likes = excluded.likes,
              comments = excluded.comments,
              shares = excluded.shares,
              views = excluded.views,
              engagement_velocity = excluded.engagement_velocity,
              credibility_score = excluded.credibility_score,
              topic_relevance_score = excluded.topic_relevance_score,
              overall_score = excluded.overall_score,
              reason = excluded.reason,
              headline = excluded.headline,
              topic = excluded.topic,
              is_active = 1,
              updated_at = excluded.updated_at
            RETURNING {STORY_COLUMNS}
            "#
        ))
        .bind(draft.raw_item_id)
        .bind(draft.platform.as_str())
        .bind(&draft.author)
        .bind(&draft.content)
        .bind(&draft.url)
        .bind(draft.posted_at)
        .bind(draft.likes)
        .bind(draft.comments)
        .bind(draft.shares)
        .bind(draft.views)
        .bind(draft.engagement_velocity)
        .bind(draft.credibility_score)
        .bind(draft.topic_relevance_score)
        .bind(draft.overall_score)
        .bind(&draft.reason)
        .bind(&draft.headline)
        .bind(&draft.topic)
        .bind(draft.is_regional)
        .bind(&draft.location)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    /// Drop the story of a raw item that no longer passes the keep gate.
    pub async fn remove_story(&mut self, raw_item_id: i64) -> Result<u64, StorageError> {
        let affected = sqlx::query("DELETE FROM stories WHERE raw_item_id = ?1")
            .bind(raw_item_id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use sqlx::Row;

    fn seed(platform: Platform, handle: &str) -> SourceSeed {
        SourceSeed {
            platform,
            handle: handle.to_string(),
            display_name: None,
            account_id: None,
            is_active: true,
            is_trusted: false,
            is_regional: false,
            location: None,
            cadence_minutes: Some(30),
        }
    }

    fn raw(external_id: &str, now: DateTime<Utc>) -> NewRawItem {
        NewRawItem {
            platform: Platform::Rss,
            external_id: external_id.to_string(),
            source_id: None,
            hashtag_id: None,
            author: "Desk".to_string(),
            content: "Body".to_string(),
            url: format!("https://example.com/{external_id}"),
            posted_at: Some(now - ChronoDuration::minutes(10)),
            likes: 1,
            comments: 2,
            shares: 3,
            views: 4,
            is_regional: false,
            location: None,
            raw_payload: "{}".to_string(),
            ingested_at: now,
        }
    }

    fn draft(raw_item_id: i64, velocity: f64, now: DateTime<Utc>) -> StoryDraft {
        StoryDraft {
            raw_item_id,
            platform: Platform::Rss,
            author: "Desk".to_string(),
            content: "Body".to_string(),
            url: "https://example.com".to_string(),
            posted_at: now,
            likes: 1,
            comments: 2,
            shares: 3,
            views: 4,
            engagement_velocity: velocity,
            credibility_score: 50.0,
            topic_relevance_score: 0.0,
            overall_score: 40.0,
            reason: "Moderate engagement".to_string(),
            headline: "Body".to_string(),
            topic: "General".to_string(),
            is_regional: false,
            location: None,
        }
    }

    #[tokio::test]
    async fn migration_creates_required_tables() {
        let store = Store::in_memory().await;
        let rows = sqlx::query(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name IN ('sources', 'hashtags', 'raw_items', 'stories', 'poll_runs')
            ORDER BY name
            "#,
        )
        .fetch_all(store.pool())
        .await
        .expect("query must succeed");
        let names: Vec<String> = rows.into_iter().map(|r| r.get::<String, _>("name")).collect();
        assert_eq!(names, vec!["hashtags", "poll_runs", "raw_items", "sources", "stories"]);
    }

    #[tokio::test]
    async fn upsert_source_is_idempotent_for_same_platform_and_handle() {
        let store = Store::in_memory().await;
        let first = store.upsert_source(&seed(Platform::Rss, "https://a.example/rss")).await.unwrap();
        let mut changed = seed(Platform::Rss, "https://a.example/rss");
        changed.display_name = Some("A Feed".to_string());
        let second = store.upsert_source(&changed).await.unwrap();
        let other_platform = store.upsert_source(&seed(Platform::Reddit, "https://a.example/rss")).await.unwrap();

        let all = store.list_sources(false).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other_platform.id);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].label(), "A Feed");
    }

    #[tokio::test]
    async fn deactivation_is_soft() {
        let store = Store::in_memory().await;
        let a = store.upsert_source(&seed(Platform::Rss, "a")).await.unwrap();
        let b = store.upsert_source(&seed(Platform::Rss, "b")).await.unwrap();

        let affected = store.set_sources_active(&[a.id, b.id], false).await.unwrap();
        assert_eq!(affected, 2);
        assert!(store.list_sources(true).await.unwrap().is_empty());
        assert_eq!(store.list_sources(false).await.unwrap().len(), 2);
        assert_eq!(store.set_sources_active(&[], true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_raw_item_insert_is_a_no_op() {
        let store = Store::in_memory().await;
        let now = Utc::now();
        let mut batch = store.begin().await.unwrap();
        let first = batch.insert_raw_item(&raw("abc123", now)).await.unwrap();
        let second = batch.insert_raw_item(&raw("abc123", now)).await.unwrap();
        batch.commit().await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_items")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn dropped_batch_rolls_back() {
        let store = Store::in_memory().await;
        let now = Utc::now();
        let source = store.upsert_source(&seed(Platform::Rss, "a")).await.unwrap();
        {
            let mut batch = store.begin().await.unwrap();
            batch.insert_raw_item(&raw("gone", now)).await.unwrap();
            batch.mark_source_polled(source.id, now).await.unwrap();
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_items")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
        let reloaded = store.get_source(source.id).await.unwrap().unwrap();
        assert!(reloaded.last_polled_at.is_none());
    }

    #[tokio::test]
    async fn story_upsert_updates_in_place() {
        let store = Store::in_memory().await;
        let now = Utc::now();
        let mut batch = store.begin().await.unwrap();
        let item = batch.insert_raw_item(&raw("x1", now)).await.unwrap().unwrap();
        let created = batch.upsert_story(&draft(item.id, 10.0, now), now).await.unwrap();
        let updated = batch.upsert_story(&draft(item.id, 99.0, now), now).await.unwrap();
        batch.commit().await.unwrap();

        assert_eq!(created.id, updated.id);
        assert_eq!(updated.engagement_velocity, 99.0);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stories")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn poll_run_is_finalized_once() {
        let store = Store::in_memory().await;
        let started = Utc::now();
        let id = store
            .start_poll_run(PollKind::Source, None, None, Some(Platform::Rss), started)
            .await
            .unwrap();
        let counts = PollCounts { fetched: 3, processed: 2, kept: 1 };
        let later = started + ChronoDuration::seconds(2);

        assert!(store.finish_poll_run(id, PollStatus::Success, &counts, None, later).await.unwrap());
        assert!(!store
            .finish_poll_run(id, PollStatus::Error, &PollCounts::default(), Some("late"), later)
            .await
            .unwrap());

        let runs = store.recent_poll_runs(10).await.unwrap();
        assert_eq!(runs[0].status, PollStatus::Success);
        assert_eq!(runs[0].items_kept, 1);
        assert!(runs[0].error_message.is_none());
        let duration = runs[0].duration_seconds.unwrap();
        assert!((duration - 2.0).abs() < 0.01, "duration was {duration}");
    }

    #[tokio::test]
    async fn reimport_keeps_admin_deactivation() {
        let store = Store::in_memory().await;
        let source = store.upsert_source(&seed(Platform::Rss, "a")).await.unwrap();
        store.set_sources_active(&[source.id], false).await.unwrap();

        let mut renamed = seed(Platform::Rss, "a");
        renamed.display_name = Some("Renamed".to_string());
        let reimported = store.upsert_source(&renamed).await.unwrap();
        assert!(!reimported.is_active);
        assert_eq!(reimported.label(), "Renamed");
    }

    #[test]
    fn contains_pattern_escapes_wildcards() {
        assert_eq!(contains_pattern("kenya"), "%kenya%");
        assert_eq!(contains_pattern("100%_a\\b"), "%100\\%\\_a\\\\b%");
    }

    #[tokio::test]
    async fn location_filter_treats_wildcards_literally() {
        let store = Store::in_memory().await;
        let now = Utc::now();
        let mut batch = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for location in ["Nairobi_West", "NairobiXWest"] {
            let item = batch.insert_raw_item(&raw(location, now)).await.unwrap().unwrap();
            let mut d = draft(item.id, 1.0, now);
            d.location = Some(location.to_string());
            ids.push(batch.upsert_story(&d, now).await.unwrap().id);
        }
        batch.commit().await.unwrap();

        let filter = StoryFilter {
            location_any: vec!["nairobi_west".to_string()],
            limit: 10,
            ..Default::default()
        };
        let found = store.query_stories(&filter).await.unwrap();
        let found_ids: Vec<i64> = found.iter().map(|s| s.id).collect();
        assert_eq!(found_ids, vec![ids[0]]);
    }

    #[tokio::test]
    async fn continent_filter_ors_locations_with_region_flag() {
        let store = Store::in_memory().await;
        let now = Utc::now();
        let mut batch = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for external_id in ["lagos", "regional", "paris"] {
            let item = batch.insert_raw_item(&raw(external_id, now)).await.unwrap().unwrap();
            let mut d = draft(item.id, 1.0, now);
            match external_id {
                "lagos" => d.location = Some("Lagos, Nigeria".to_string()),
                "regional" => d.is_regional = true,
                _ => d.location = Some("Paris".to_string()),
            }
            ids.push(batch.upsert_story(&d, now).await.unwrap().id);
        }
        batch.commit().await.unwrap();

        let filter = StoryFilter {
            location_any: vec!["nigeria".to_string(), "kenya".to_string()],
            location_or_regional: true,
            limit: 10,
            ..Default::default()
        };
        let found = store.query_stories(&filter).await.unwrap();
        let mut found_ids: Vec<i64> = found.iter().map(|s| s.id).collect();
        found_ids.sort();
        assert_eq!(found_ids, vec![ids[0], ids[1]]);
    }
}
