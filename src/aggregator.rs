//! Computed trending for platforms with no native trending endpoint.
//!
//! Every aggregation cycle:
//!
//! 1. Fetches up to `posts_per_source` recent posts from every source of the
//!    platform that is due under its own cadence, concurrently.
//! 2. Scores each post's instantaneous trend score:
//!    `(likes + comments + shares) / minutes_since_posted`, minutes floored at 0.1.
//! 3. Drops posts below `min_trend_score`, sorts the rest by trend score
//!    (most recent first on ties) and keeps the global top `top_n`.
//! 4. Persists the survivors through the normal dedup path, tagged with their
//!    originating source, then scores them.
//!
//! The ranking is recomputed from scratch each cycle; engagement counters
//! move between runs, so no top-K state is carried over. A source that is not
//! due sits the cycle out even when another source of the platform triggered it.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{AdapterRegistry, PlatformLimits};
use crate::config::{AggregatorConfig, SchedulerConfig};
use crate::error::{AdapterError, PollError, StorageError};
use crate::ingest::{Origin, ingest, score_stored};
use crate::models::{NormalizedItem, Platform, PollCounts, PollKind, PollStatus, Source};
use crate::registry::is_due;
use crate::scheduler::Clock;
use crate::scoring::ScoringEngine;
use crate::storage::Store;

const MIN_ELAPSED_MINUTES: f64 = 0.1;

/// Unweighted engagement per minute since posting. Missing timestamps score zero.
pub fn trend_score(
    likes: i64,
    comments: i64,
    shares: i64,
    posted_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let Some(posted_at) = posted_at else {
        return 0.0;
    };
    let minutes = ((now - posted_at).num_milliseconds() as f64 / 60_000.0).max(MIN_ELAPSED_MINUTES);
    (likes + comments + shares).max(0) as f64 / minutes
}

/// A fetched post with the source it came from.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Index into the sources fetched this cycle.
    pub source_index: usize,
    pub item: NormalizedItem,
    pub trend_score: f64,
}

/// Filter below `min_trend_score`, order by score then recency, keep `top_n`.
pub fn rank_and_cut(mut candidates: Vec<Candidate>, min_trend_score: f64, top_n: usize) -> Vec<Candidate> {
    candidates.retain(|c| c.trend_score >= min_trend_score);
    candidates.sort_by(|a, b| {
        b.trend_score
            .total_cmp(&a.trend_score)
            .then_with(|| match (a.item.posted_at, b.item.posted_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    });
    candidates.truncate(top_n);
    candidates
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationReport {
    pub platform: Option<Platform>,
    pub sources_polled: usize,
    pub sources_failed: usize,
    pub items_fetched: usize,
    pub above_threshold: usize,
    pub stored: usize,
    pub kept: usize,
}

#[derive(Debug, Clone)]
pub struct TrendAggregator {
    store: Store,
    adapters: Arc<AdapterRegistry>,
    limits: Arc<PlatformLimits>,
    engine: Arc<ScoringEngine>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
    scheduler: SchedulerConfig,
}

impl TrendAggregator {
    pub fn new(
        store: Store,
        adapters: Arc<AdapterRegistry>,
        limits: Arc<PlatformLimits>,
        engine: Arc<ScoringEngine>,
        clock: Arc<dyn Clock>,
        config: AggregatorConfig,
        scheduler: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            limits,
            engine,
            clock,
            config,
            scheduler,
        }
    }

    pub fn platforms(&self) -> &[Platform] {
        &self.config.platforms
    }

    pub fn aggregates(&self, platform: Platform) -> bool {
        self.config.platforms.contains(&platform)
    }

    /// Run one rank-and-cut cycle for `platform`, recorded as one aggregation poll run.
    ///
    /// # Errors
    ///
    /// `NoAdapter` when the platform has no adapter, `Storage` when the batch
    /// could not be written. Individual source failures are logged and counted.
    #[instrument(level = "info", skip(self, now), fields(%platform))]
    pub async fn run(&self, platform: Platform, now: DateTime<Utc>) -> Result<AggregationReport, PollError> {
        let run_id = self
            .store
            .start_poll_run(PollKind::Aggregation, None, None, Some(platform), now)
            .await?;

        let outcome = self.cycle(platform, now).await;
        let completed_at = self.clock.now().max(now);
        match &outcome {
            Ok(report) => {
                let counts = PollCounts {
                    fetched: report.items_fetched,
                    processed: report.stored,
                    kept: report.kept,
                };
                self.store
                    .finish_poll_run(run_id, PollStatus::Success, &counts, None, completed_at)
                    .await?;
                info!(
                    sources = report.sources_polled,
                    failed = report.sources_failed,
                    fetched = report.items_fetched,
                    above_threshold = report.above_threshold,
                    stored = report.stored,
                    kept = report.kept,
                    "Aggregation finished"
                );
            }
            Err(e) => {
                error!(error = %e, "Aggregation failed");
                self.store
                    .finish_poll_run(
                        run_id,
                        PollStatus::Error,
                        &PollCounts::default(),
                        Some(&e.to_string()),
                        completed_at,
                    )
                    .await?;
            }
        }
        outcome
    }

    async fn cycle(&self, platform: Platform, now: DateTime<Utc>) -> Result<AggregationReport, PollError> {
        let adapter = self.adapters.get(platform).ok_or(PollError::NoAdapter(platform))?;
        let sources: Vec<Source> = self
            .store
            .active_sources_for(platform)
            .await?
            .into_iter()
            .filter(|s| is_due(s, now, self.scheduler.default_cadence_minutes))
            .collect();
        debug!(due = sources.len(), "Selected due sources");

        let limit = self.config.posts_per_source.max(1);
        let fetched: Vec<(usize, Result<Vec<NormalizedItem>, AdapterError>)> =
            stream::iter(sources.iter().cloned().enumerate())
                .map(|(index, source)| {
                    let adapter = adapter.clone();
                    let limits = self.limits.clone();
                    async move {
                        let result = limits.call(platform, adapter.fetch(&source, limit)).await;
                        (index, result)
                    }
                })
                .buffer_unordered(self.scheduler.platform_concurrency(platform))
                .collect()
                .await;

        let mut report = AggregationReport {
            platform: Some(platform),
            sources_polled: sources.len(),
            ..Default::default()
        };
        let mut succeeded = vec![false; sources.len()];
        let mut candidates = Vec::new();
        for (index, result) in fetched {
            let source = &sources[index];
            match result {
                Ok(items) => {
                    succeeded[index] = true;
                    report.items_fetched += items.len();
                    candidates.extend(items.into_iter().map(|item| Candidate {
                        source_index: index,
                        trend_score: trend_score(item.likes, item.comments, item.shares, item.posted_at, now),
                        item,
                    }));
                }
                Err(AdapterError::RateLimited { retry_after }) => {
                    report.sources_failed += 1;
                    let until = backoff_until(&self.scheduler, platform, retry_after, now);
                    warn!(source_id = source.id, %until, "Source rate limited during aggregation");
                    self.store.set_backoff(source.id, until).await?;
                }
                Err(e) => {
                    report.sources_failed += 1;
                    warn!(source_id = source.id, error = %e, "Source failed during aggregation");
                }
            }
        }

        let survivors = rank_and_cut(candidates, self.config.min_trend_score, self.config.top_n);
        report.above_threshold = survivors.len();

        let (stored, kept) = self.persist(&sources, &succeeded, survivors, now).await?;
        report.stored = stored;
        report.kept = kept;
        Ok(report)
    }

    /// Write survivors per originating source in one transaction.
    ///
    /// Every source that answered is marked polled, including those whose posts
    /// were all cut.
    async fn persist(
        &self,
        sources: &[Source],
        succeeded: &[bool],
        survivors: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), StorageError> {
        let mut per_source: Vec<Vec<NormalizedItem>> = vec![Vec::new(); sources.len()];
        for candidate in survivors {
            per_source[candidate.source_index].push(candidate.item);
        }

        let mut batch = self.store.begin().await?;
        let (mut stored, mut kept) = (0, 0);
        for (index, source) in sources.iter().enumerate() {
            if !succeeded[index] {
                continue;
            }
            let report = ingest(&mut batch, Origin::Source(source), &per_source[index], now).await?;
            stored += report.stored.len();
            kept += score_stored(&mut batch, &self.engine, &report.stored, source.is_trusted, now).await?;
        }
        batch.commit().await?;
        Ok((stored, kept))
    }
}

/// End of the backoff window after a rate-limit response.
pub fn backoff_until(
    scheduler: &SchedulerConfig,
    platform: Platform,
    retry_after: Option<Duration>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let floor = chrono::Duration::minutes(scheduler.backoff_minutes(platform));
    let hinted = retry_after
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .unwrap_or(chrono::Duration::zero());
    now + floor.max(hinted)
}
