//! Idempotent ingestion of adapter output and the score-and-gate step.
//!
//! Items are keyed by `(platform, external_id)`. A key that already exists is
//! skipped without touching the stored row, so re-fetching the same content in
//! one tick (or from two sources) cannot drift its counters. All writes go
//! through the caller's [`Batch`], which commits the inserts and the origin's
//! poll timestamp together.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::models::{Hashtag, NormalizedItem, RawItem, Source};
use crate::scoring::{ScoreCard, ScoreInput, ScoringEngine, derive_headline, derive_topic};
use crate::storage::{Batch, NewRawItem, StoryDraft, Store};

/// Where a batch of items came from.
#[derive(Debug, Clone, Copy)]
pub enum Origin<'a> {
    Source(&'a Source),
    /// A query term; items found through it have no owning source.
    Hashtag(&'a Hashtag),
}

impl Origin<'_> {
    fn source_id(&self) -> Option<i64> {
        match self {
            Origin::Source(s) => Some(s.id),
            Origin::Hashtag(_) => None,
        }
    }

    fn hashtag_id(&self) -> Option<i64> {
        match self {
            Origin::Source(_) => None,
            Origin::Hashtag(h) => Some(h.id),
        }
    }

    fn is_regional(&self) -> bool {
        match self {
            Origin::Source(s) => s.is_regional,
            Origin::Hashtag(h) => h.is_regional,
        }
    }

    fn location(&self) -> Option<&str> {
        match self {
            Origin::Source(s) => s.location.as_deref(),
            Origin::Hashtag(_) => None,
        }
    }

    pub fn is_trusted(&self) -> bool {
        matches!(self, Origin::Source(s) if s.is_trusted)
    }

    pub fn label(&self) -> String {
        match self {
            Origin::Source(s) => s.label().to_string(),
            Origin::Hashtag(h) => h.tag.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub received: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Newly inserted rows, in adapter-return order.
    pub stored: Vec<RawItem>,
}

/// Persist `items` for `origin`, skipping keys that already exist.
///
/// Region flag and location come from the item when the adapter supplied them,
/// otherwise from the origin. A failed insert is logged and counted; it does
/// not abort the batch. The origin's poll timestamp is advanced to `now` once
/// every item has been handled, whether or not anything was new.
///
/// # Errors
///
/// Only a failure to advance the poll timestamp is returned; the caller should
/// drop the batch so nothing from this origin is committed.
#[instrument(level = "info", skip_all, fields(origin = %origin.label(), items = items.len()))]
pub async fn ingest(
    batch: &mut Batch<'_>,
    origin: Origin<'_>,
    items: &[NormalizedItem],
    now: DateTime<Utc>,
) -> Result<IngestReport, StorageError> {
    let mut report = IngestReport {
        received: items.len(),
        ..Default::default()
    };

    for item in items {
        let row = NewRawItem {
            platform: item.platform,
            external_id: item.external_id.clone(),
            source_id: origin.source_id(),
            hashtag_id: origin.hashtag_id(),
            author: item.author.clone(),
            content: item.content.clone(),
            url: item.url.clone(),
            posted_at: item.posted_at,
            likes: item.likes,
            comments: item.comments,
            shares: item.shares,
            views: item.views,
            is_regional: item.is_regional.unwrap_or(origin.is_regional()),
            location: item
                .location
                .clone()
                .or_else(|| origin.location().map(str::to_string)),
            raw_payload: item.raw_payload.to_string(),
            ingested_at: now,
        };

        match batch.insert_raw_item(&row).await {
            Ok(Some(stored)) => report.stored.push(stored),
            Ok(None) => {
                debug!(platform = %item.platform, external_id = %item.external_id, "Duplicate item skipped");
                report.duplicates += 1;
            }
            Err(e) => {
                warn!(platform = %item.platform, external_id = %item.external_id, error = %e, "Failed to store item");
                report.failed += 1;
            }
        }
    }

    match origin {
        Origin::Source(s) => batch.mark_source_polled(s.id, now).await?,
        Origin::Hashtag(h) => batch.mark_hashtag_polled(h.id, now).await?,
    }

    info!(
        received = report.received,
        stored = report.stored.len(),
        duplicates = report.duplicates,
        failed = report.failed,
        "Ingested batch"
    );
    Ok(report)
}

/// Story fields for `item` given its score card.
pub fn story_draft(item: &RawItem, card: &ScoreCard) -> StoryDraft {
    StoryDraft {
        raw_item_id: item.id,
        platform: item.platform,
        author: item.author.clone(),
        content: item.content.clone(),
        url: item.url.clone(),
        posted_at: item.posted_at.unwrap_or(item.ingested_at),
        likes: item.likes,
        comments: item.comments,
        shares: item.shares,
        views: item.views,
        engagement_velocity: card.engagement_velocity,
        credibility_score: card.credibility,
        topic_relevance_score: card.topic_relevance,
        overall_score: card.overall,
        reason: card.reason.clone(),
        headline: derive_headline(item.platform, &item.author, &item.content),
        topic: derive_topic(&item.content).to_string(),
        is_regional: item.is_regional,
        location: item.location.clone(),
    }
}

/// Score one stored item and apply the keep gate.
///
/// A kept item creates its story or updates the existing one in place; an item
/// that no longer passes loses its story. Returns whether it was kept.
pub async fn score_and_gate(
    batch: &mut Batch<'_>,
    engine: &ScoringEngine,
    item: &RawItem,
    is_trusted_source: bool,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let card = engine.score(&ScoreInput::from_raw(item, is_trusted_source), now);
    if card.keep {
        batch.upsert_story(&story_draft(item, &card), now).await?;
    } else {
        let removed = batch.remove_story(item.id).await?;
        if removed > 0 {
            debug!(raw_item_id = item.id, "Story dropped below thresholds");
        }
    }
    Ok(card.keep)
}

/// Score every item of one batch; returns how many were kept.
pub async fn score_stored(
    batch: &mut Batch<'_>,
    engine: &ScoringEngine,
    items: &[RawItem],
    is_trusted_source: bool,
    now: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let mut kept = 0;
    for item in items {
        if score_and_gate(batch, engine, item, is_trusted_source, now).await? {
            kept += 1;
        }
    }
    Ok(kept)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RescoreReport {
    pub scanned: usize,
    pub kept: usize,
}

/// Recompute scores for every raw item of the last `hours_back` hours.
///
/// Scores are rebuilt from scratch, so running this twice at the same `now`
/// leaves the same stories behind.
#[instrument(level = "info", skip(store, engine))]
pub async fn rescore(
    store: &Store,
    engine: &ScoringEngine,
    hours_back: i64,
    now: DateTime<Utc>,
) -> Result<RescoreReport, StorageError> {
    let items = store.raw_items_since(now - Duration::hours(hours_back)).await?;
    let source_ids: Vec<i64> = items.iter().filter_map(|i| i.source_id).collect();
    let trusted = store.trusted_source_ids(&source_ids).await?;

    let mut batch = store.begin().await?;
    let mut kept = 0;
    for item in &items {
        let is_trusted = item.source_id.is_some_and(|id| trusted.contains(&id));
        if score_and_gate(&mut batch, engine, item, is_trusted, now).await? {
            kept += 1;
        }
    }
    batch.commit().await?;

    info!(scanned = items.len(), kept, "Rescored stored items");
    Ok(RescoreReport {
        scanned: items.len(),
        kept,
    })
}
