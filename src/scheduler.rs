//! Poll coordinator.
//!
//! A [`Scheduler`] is an explicit instance owned by `main`, built with its
//! store, adapters, scoring engine, aggregator and clock. Each tick walks
//! through a fixed set of phases:
//!
//! | Phase | Work |
//! |-------|------|
//! | `Selecting` | List due sources and hashtags, claim them, open their poll runs |
//! | `Dispatching` | Fetch concurrently (bounded overall and per platform); run due aggregations |
//! | `Committing` | Persist each fetch in its own transaction and finalize its poll run |
//! | `Idle` | Between ticks |
//!
//! A failure in one source never aborts the others: it is logged and written
//! to that source's poll run. A storage error while selecting ends the tick
//! after the runs it already opened are closed as errors. A storage error while
//! committing one job is reported once every remaining job has been committed.
//! Either way no run is left `running`, and the loop carries on with the next
//! tick.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{AdapterRegistry, PlatformLimits};
use crate::aggregator::{AggregationReport, TrendAggregator, backoff_until};
use crate::config::SchedulerConfig;
use crate::error::{AdapterError, PollError, StorageError};
use crate::ingest::{Origin, ingest, score_stored};
use crate::models::{Hashtag, NormalizedItem, Platform, PollCounts, PollKind, PollStatus, Source};
use crate::registry::SourceRegistry;
use crate::scoring::ScoringEngine;
use crate::storage::Store;
use crate::utils::truncate_for_log;

const MAX_ERROR_MESSAGE_BYTES: usize = 500;

/// Source of the current time for the run loop and poll-run timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TickPhase {
    Idle = 0,
    Selecting = 1,
    Dispatching = 2,
    Committing = 3,
}

impl TickPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TickPhase::Selecting,
            2 => TickPhase::Dispatching,
            3 => TickPhase::Committing,
            _ => TickPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum InFlightKey {
    Source(i64),
    Hashtag(i64),
    Aggregation(Platform),
}

type Claims = Arc<Mutex<HashSet<InFlightKey>>>;

/// Releases its claim on drop.
struct InFlightGuard {
    claims: Claims,
    key: InFlightKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

enum Target {
    Source(Source),
    Hashtag(Hashtag),
}

impl Target {
    fn origin(&self) -> Origin<'_> {
        match self {
            Target::Source(s) => Origin::Source(s),
            Target::Hashtag(h) => Origin::Hashtag(h),
        }
    }
}

/// One claimed source or hashtag with its open poll run.
struct Job {
    target: Target,
    run_id: i64,
    _claim: InFlightGuard,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub due_sources: usize,
    pub due_hashtags: usize,
    pub skipped_in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub items_fetched: usize,
    pub items_stored: usize,
    pub items_kept: usize,
    pub aggregations: Vec<AggregationReport>,
}

#[derive(Debug)]
pub struct Scheduler {
    store: Store,
    registry: SourceRegistry,
    adapters: Arc<AdapterRegistry>,
    engine: Arc<ScoringEngine>,
    aggregator: TrendAggregator,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    limits: Arc<PlatformLimits>,
    in_flight: Claims,
    phase: AtomicU8,
}

impl Scheduler {
    pub fn new(
        store: Store,
        adapters: Arc<AdapterRegistry>,
        limits: Arc<PlatformLimits>,
        engine: Arc<ScoringEngine>,
        aggregator: TrendAggregator,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry: SourceRegistry::new(store.clone(), config.default_cadence_minutes),
            store,
            adapters,
            engine,
            aggregator,
            clock,
            config,
            limits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            phase: AtomicU8::new(TickPhase::Idle as u8),
        }
    }

    pub fn phase(&self) -> TickPhase {
        TickPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: TickPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Claim `key` unless another tick is already working on it.
    fn claim(&self, key: InFlightKey) -> Option<InFlightGuard> {
        let mut claims = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        claims.insert(key).then(|| InFlightGuard {
            claims: self.in_flight.clone(),
            key,
        })
    }

    /// Run one tick at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the store cannot be reached to select work
    /// or record poll runs. Every run opened by this tick is finalized first.
    /// Per-source failures end up in the report.
    #[instrument(level = "info", skip_all, fields(%now))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, StorageError> {
        let result = self.run_tick(now).await;
        self.set_phase(TickPhase::Idle);
        match &result {
            Ok(report) => info!(
                due_sources = report.due_sources,
                due_hashtags = report.due_hashtags,
                succeeded = report.succeeded,
                failed = report.failed,
                rate_limited = report.rate_limited,
                skipped = report.skipped_in_flight,
                stored = report.items_stored,
                kept = report.items_kept,
                aggregations = report.aggregations.len(),
                "Tick finished"
            ),
            Err(e) => error!(error = %e, "Tick aborted"),
        }
        result
    }

    async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport, StorageError> {
        self.set_phase(TickPhase::Selecting);
        let mut report = TickReport::default();
        let sources = self.registry.due_sources(now).await?;
        let hashtags = self
            .registry
            .due_hashtags(now, self.config.hashtag_cadence_minutes)
            .await?;

        let mut jobs = Vec::new();
        let mut aggregated = BTreeSet::new();
        for source in sources {
            if self.aggregator.aggregates(source.platform) {
                aggregated.insert(source.platform);
                continue;
            }
            report.due_sources += 1;
            let Some(claim) = self.claim(InFlightKey::Source(source.id)) else {
                debug!(source_id = source.id, "Source already in flight; skipping");
                report.skipped_in_flight += 1;
                continue;
            };
            let run_id = match self
                .store
                .start_poll_run(PollKind::Source, Some(source.id), None, Some(source.platform), now)
                .await
            {
                Ok(run_id) => run_id,
                Err(e) => return Err(self.abandon(jobs, e, now).await),
            };
            jobs.push(Job {
                target: Target::Source(source),
                run_id,
                _claim: claim,
            });
        }

        for hashtag in hashtags {
            report.due_hashtags += 1;
            let Some(claim) = self.claim(InFlightKey::Hashtag(hashtag.id)) else {
                debug!(hashtag_id = hashtag.id, "Hashtag already in flight; skipping");
                report.skipped_in_flight += 1;
                continue;
            };
            let scope = match hashtag.platforms().as_slice() {
                [single] => Some(*single),
                _ => None,
            };
            let run_id = match self
                .store
                .start_poll_run(PollKind::Hashtag, None, Some(hashtag.id), scope, now)
                .await
            {
                Ok(run_id) => run_id,
                Err(e) => return Err(self.abandon(jobs, e, now).await),
            };
            jobs.push(Job {
                target: Target::Hashtag(hashtag),
                run_id,
                _claim: claim,
            });
        }

        let aggregations: Vec<(Platform, InFlightGuard)> = aggregated
            .into_iter()
            .filter_map(|p| match self.claim(InFlightKey::Aggregation(p)) {
                Some(claim) => Some((p, claim)),
                None => {
                    report.skipped_in_flight += 1;
                    None
                }
            })
            .collect();

        self.set_phase(TickPhase::Dispatching);
        let fetches = stream::iter(jobs)
            .map(|job| async move {
                let result = match &job.target {
                    Target::Source(source) => self.fetch_source(source).await,
                    Target::Hashtag(hashtag) => self.search_hashtag(hashtag).await,
                };
                (job, result)
            })
            .buffer_unordered(self.config.max_concurrent_polls.max(1))
            .collect::<Vec<_>>();
        let aggregate = async {
            let mut reports = Vec::new();
            for (platform, _claim) in aggregations {
                match self.aggregator.run(platform, now).await {
                    Ok(r) => reports.push(r),
                    Err(e) => warn!(%platform, error = %e, "Aggregation failed"),
                }
            }
            reports
        };
        let (fetched, aggregation_reports) = futures::join!(fetches, aggregate);
        report.aggregations = aggregation_reports;

        self.set_phase(TickPhase::Committing);
        let mut first_error = None;
        for (job, result) in fetched {
            if let Err(e) = self.commit(job, result, now, &mut report).await {
                error!(error = %e, "Commit hit a storage error; continuing with the remaining jobs");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Close the runs of jobs that will never be dispatched, then hand back `cause`.
    async fn abandon(&self, jobs: Vec<Job>, cause: StorageError, now: DateTime<Utc>) -> StorageError {
        let message = truncate_for_log(&format!("tick aborted: {cause}"), MAX_ERROR_MESSAGE_BYTES);
        let completed_at = self.clock.now().max(now);
        for job in jobs {
            if let Err(e) = self
                .store
                .finish_poll_run(job.run_id, PollStatus::Error, &PollCounts::default(), Some(&message), completed_at)
                .await
            {
                error!(run_id = job.run_id, error = %e, "Could not close abandoned poll run");
            }
        }
        cause
    }

    async fn fetch_source(&self, source: &Source) -> Result<Vec<NormalizedItem>, PollError> {
        let adapter = self
            .adapters
            .get(source.platform)
            .ok_or(PollError::NoAdapter(source.platform))?;
        let items = self
            .limits
            .call(source.platform, adapter.fetch(source, self.config.fetch_limit.max(1)))
            .await?;
        Ok(items)
    }

    /// Search every platform in the hashtag's scope that has an adapter.
    ///
    /// Platforms whose adapter cannot search are skipped. The hashtag fails only
    /// when every attempted search failed.
    async fn search_hashtag(&self, hashtag: &Hashtag) -> Result<Vec<NormalizedItem>, PollError> {
        let limit = hashtag.posts_per_hashtag.max(1) as usize;
        let mut items = Vec::new();
        let mut answered = false;
        let mut last_error = None;
        for platform in hashtag.platforms() {
            let Some(adapter) = self.adapters.get(platform) else {
                continue;
            };
            match self.limits.call(platform, adapter.search(hashtag.term(), limit)).await {
                Ok(found) => {
                    answered = true;
                    items.extend(found);
                }
                Err(AdapterError::Unsupported(_)) => {}
                Err(e) => {
                    warn!(tag = %hashtag.tag, %platform, error = %e, "Hashtag search failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if !answered => Err(e.into()),
            _ => Ok(items),
        }
    }

    /// Persist one fetch result and finalize its poll run.
    ///
    /// The run is finalized even when recording the backoff fails; that error
    /// is returned afterwards.
    async fn commit(
        &self,
        job: Job,
        result: Result<Vec<NormalizedItem>, PollError>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StorageError> {
        let label = job.target.origin().label();
        let mut backoff_result = Ok(());
        let (status, counts, message) = match result {
            Ok(items) => {
                report.items_fetched += items.len();
                match self.persist(&job.target, &items, now).await {
                    Ok((stored, kept)) => {
                        report.succeeded += 1;
                        report.items_stored += stored;
                        report.items_kept += kept;
                        info!(origin = %label, fetched = items.len(), stored, kept, "Poll succeeded");
                        let counts = PollCounts {
                            fetched: items.len(),
                            processed: stored,
                            kept,
                        };
                        (PollStatus::Success, counts, None)
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(origin = %label, error = %e, "Batch rolled back");
                        let counts = PollCounts {
                            fetched: items.len(),
                            ..Default::default()
                        };
                        (PollStatus::Error, counts, Some(e.to_string()))
                    }
                }
            }
            Err(PollError::Adapter(e @ AdapterError::RateLimited { .. })) => {
                report.rate_limited += 1;
                if let (Target::Source(source), AdapterError::RateLimited { retry_after }) = (&job.target, &e) {
                    let until = backoff_until(&self.config, source.platform, *retry_after, now);
                    backoff_result = self.store.set_backoff(source.id, until).await;
                    warn!(source_id = source.id, %until, "Rate limited; backing off");
                } else {
                    warn!(origin = %label, "Rate limited");
                }
                (PollStatus::RateLimited, PollCounts::default(), Some(e.to_string()))
            }
            Err(e) => {
                report.failed += 1;
                warn!(origin = %label, error = %e, "Poll failed");
                (PollStatus::Error, PollCounts::default(), Some(e.to_string()))
            }
        };

        let message = message.map(|m| truncate_for_log(&m, MAX_ERROR_MESSAGE_BYTES));
        let completed_at = self.clock.now().max(now);
        self.store
            .finish_poll_run(job.run_id, status, &counts, message.as_deref(), completed_at)
            .await?;
        backoff_result
    }

    /// Ingest, score and advance the origin's poll timestamp in one transaction.
    async fn persist(
        &self,
        target: &Target,
        items: &[NormalizedItem],
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), StorageError> {
        let origin = target.origin();
        let mut batch = self.store.begin().await?;
        let ingested = ingest(&mut batch, origin, items, now).await?;
        let kept = score_stored(&mut batch, &self.engine, &ingested.stored, origin.is_trusted(), now).await?;
        batch.commit().await?;
        Ok((ingested.stored.len(), kept))
    }

    /// Spawn the tick loop. The first tick runs immediately.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let every = Duration::from_secs(self.config.tick_interval_secs.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = every.as_secs(), "Scheduler started");
            loop {
                // A stop that arrived during the last tick wins over an overdue tick.
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let now = self.clock.now();
                        if let Err(e) = self.tick(now).await {
                            error!(error = %e, "Tick failed; retrying on next interval");
                        }
                    }
                }
            }
            info!("Scheduler stopped");
        });
        SchedulerHandle { stop: stop_tx, task }
    }
}

/// Running scheduler loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop and wait for it; a tick in progress finishes first.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{FakeAdapter, Script};
    use crate::config::{AggregatorConfig, HashtagSeed, SourceSeed};
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;

    fn item(platform: Platform, external_id: &str, now: DateTime<Utc>) -> NormalizedItem {
        NormalizedItem {
            platform,
            external_id: external_id.to_string(),
            author: "desk".to_string(),
            content: format!("Breaking: Nairobi traffic update {external_id}"),
            url: format!("https://example.com/{external_id}"),
            posted_at: Some(now - ChronoDuration::minutes(10)),
            likes: 400,
            comments: 40,
            shares: 10,
            views: 0,
            is_regional: None,
            location: None,
            raw_payload: serde_json::Value::Null,
        }
    }

    fn seed(platform: Platform, handle: &str) -> SourceSeed {
        SourceSeed {
            platform,
            handle: handle.to_string(),
            display_name: None,
            account_id: None,
            is_active: true,
            is_trusted: false,
            is_regional: true,
            location: Some("Nairobi".to_string()),
            cadence_minutes: Some(30),
        }
    }

    async fn scheduler(adapters: Vec<Arc<FakeAdapter>>, config: SchedulerConfig) -> (Store, Arc<Scheduler>) {
        let store = Store::in_memory().await;
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        let registry = Arc::new(registry);
        let limits = Arc::new(PlatformLimits::new(&config));
        let engine = Arc::new(ScoringEngine::new(Default::default()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let aggregator = TrendAggregator::new(
            store.clone(),
            registry.clone(),
            limits.clone(),
            engine.clone(),
            clock.clone(),
            AggregatorConfig::default(),
            config.clone(),
        );
        let scheduler = Scheduler::new(store.clone(), registry, limits, engine, aggregator, clock, config);
        (store, Arc::new(scheduler))
    }

    #[tokio::test]
    async fn polls_only_due_sources() {
        let now = Utc::now();
        let rss = Arc::new(FakeAdapter::new(Platform::Rss));
        rss.script("feed", Script::Items(vec![item(Platform::Rss, "a1", now)]));
        let (store, scheduler) = scheduler(vec![rss.clone()], SchedulerConfig::default()).await;
        store.upsert_source(&seed(Platform::Rss, "feed")).await.unwrap();

        let first = scheduler.tick(now).await.unwrap();
        assert_eq!((first.due_sources, first.succeeded, first.items_stored), (1, 1, 1));
        assert_eq!(first.items_kept, 1);

        let early = scheduler.tick(now + ChronoDuration::minutes(29)).await.unwrap();
        assert_eq!(early.due_sources, 0);
        assert_eq!(rss.calls.load(Ordering::SeqCst), 1);

        let later = scheduler.tick(now + ChronoDuration::minutes(30)).await.unwrap();
        assert_eq!(later.due_sources, 1);
        assert_eq!(later.items_stored, 0);
        assert_eq!(rss.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.phase(), TickPhase::Idle);
    }

    #[tokio::test]
    async fn one_failing_source_does_not_stop_the_others() {
        let now = Utc::now();
        let rss = Arc::new(FakeAdapter::new(Platform::Rss));
        rss.script("broken", Script::Fail);
        rss.script("healthy", Script::Items(vec![item(Platform::Rss, "h1", now)]));
        let (store, scheduler) = scheduler(vec![rss], SchedulerConfig::default()).await;
        store.upsert_source(&seed(Platform::Rss, "broken")).await.unwrap();
        store.upsert_source(&seed(Platform::Rss, "healthy")).await.unwrap();
        store.upsert_source(&seed(Platform::TikTok, "nobody")).await.unwrap();

        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.due_sources, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.items_stored, 1);

        let runs = store.recent_poll_runs(10).await.unwrap();
        let errors: Vec<_> = runs.iter().filter(|r| r.status == PollStatus::Error).collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|r| r.error_message.is_some() && r.completed_at.is_some()));

        let sources = store.list_sources(true).await.unwrap();
        for source in sources {
            assert_eq!(source.last_polled_at.is_some(), source.handle == "healthy");
        }
    }

    #[tokio::test]
    async fn rate_limited_source_backs_off() {
        let now = Utc::now();
        let reddit = Arc::new(FakeAdapter::new(Platform::Reddit));
        reddit.script("kenya", Script::RateLimited(None));
        reddit.script("kenya", Script::Items(Vec::new()));
        let (store, scheduler) = scheduler(vec![reddit.clone()], SchedulerConfig::default()).await;
        store.upsert_source(&seed(Platform::Reddit, "kenya")).await.unwrap();

        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.rate_limited, 1);
        let runs = store.recent_poll_runs(1).await.unwrap();
        assert_eq!(runs[0].status, PollStatus::RateLimited);

        let waiting = scheduler.tick(now + ChronoDuration::minutes(5)).await.unwrap();
        assert_eq!(waiting.due_sources, 0);
        assert_eq!(reddit.calls.load(Ordering::SeqCst), 1);

        let resumed = scheduler.tick(now + ChronoDuration::minutes(16)).await.unwrap();
        assert_eq!(resumed.succeeded, 1);
        let source = &store.list_sources(true).await.unwrap()[0];
        assert!(source.backoff_until.is_none());
    }

    #[tokio::test]
    async fn overlapping_ticks_do_not_poll_the_same_source_twice() {
        let now = Utc::now();
        let rss = Arc::new(FakeAdapter::new(Platform::Rss));
        rss.script(
            "slow",
            Script::Slow(Duration::from_millis(150), vec![item(Platform::Rss, "s1", now)]),
        );
        let (store, scheduler) = scheduler(vec![rss.clone()], SchedulerConfig::default()).await;
        store.upsert_source(&seed(Platform::Rss, "slow")).await.unwrap();

        let (first, (second, phase)) = tokio::join!(scheduler.tick(now), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let phase = scheduler.phase();
            (scheduler.tick(now).await, phase)
        });
        assert_eq!(phase, TickPhase::Dispatching);
        assert_eq!(first.unwrap().succeeded, 1);
        let second = second.unwrap();
        assert_eq!(second.skipped_in_flight, 1);
        assert_eq!(second.succeeded, 0);
        assert_eq!(rss.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetches_respect_platform_concurrency() {
        let now = Utc::now();
        let rss = Arc::new(FakeAdapter::new(Platform::Rss));
        let config = SchedulerConfig {
            per_platform_concurrency: HashMap::from([(Platform::Rss, 2)]),
            ..Default::default()
        };
        let (store, scheduler) = scheduler(vec![rss.clone()], config).await;
        for n in 0..5 {
            let handle = format!("feed-{n}");
            rss.script(&handle, Script::Slow(Duration::from_millis(40), Vec::new()));
            store.upsert_source(&seed(Platform::Rss, &handle)).await.unwrap();
        }

        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.succeeded, 5);
        assert_eq!(rss.calls.load(Ordering::SeqCst), 5);
        assert_eq!(rss.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hashtags_are_searched_without_an_owning_source() {
        let now = Utc::now();
        let reddit = Arc::new(FakeAdapter::new(Platform::Reddit));
        reddit.search_returns(vec![item(Platform::Reddit, "t1", now)]);
        let (store, scheduler) = scheduler(vec![reddit], SchedulerConfig::default()).await;
        store
            .upsert_hashtag(&HashtagSeed {
                tag: "#NairobiTraffic".to_string(),
                platform_scope: "all".to_string(),
                is_regional: true,
                is_active: true,
                posts_per_hashtag: 10,
            })
            .await
            .unwrap();

        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.due_hashtags, 1);
        assert_eq!(report.items_stored, 1);

        let stored = store.raw_items_since(now - ChronoDuration::days(1)).await.unwrap();
        assert_eq!(stored[0].source_id, None);
        assert!(stored[0].hashtag_id.is_some());
        assert!(stored[0].is_regional);

        let again = scheduler.tick(now + ChronoDuration::minutes(10)).await.unwrap();
        assert_eq!(again.due_hashtags, 0);
    }

    #[tokio::test]
    async fn aggregated_platforms_go_through_the_aggregator() {
        let now = Utc::now();
        let facebook = Arc::new(FakeAdapter::new(Platform::Facebook));
        facebook.script("page", Script::Items(vec![item(Platform::Facebook, "f1", now)]));
        let (store, scheduler) = scheduler(vec![facebook], SchedulerConfig::default()).await;
        store.upsert_source(&seed(Platform::Facebook, "page")).await.unwrap();

        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.due_sources, 0);
        assert_eq!(report.aggregations.len(), 1);
        assert_eq!(report.aggregations[0].stored, 1);

        let runs = store.recent_poll_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].kind, PollKind::Aggregation);
    }

    #[tokio::test]
    async fn stop_lets_the_current_tick_finish() {
        let now = Utc::now();
        let rss = Arc::new(FakeAdapter::new(Platform::Rss));
        rss.script(
            "slow",
            Script::Slow(Duration::from_millis(150), vec![item(Platform::Rss, "s1", now)]),
        );
        let config = SchedulerConfig {
            tick_interval_secs: 3600,
            ..Default::default()
        };
        let (store, scheduler) = scheduler(vec![rss.clone()], config).await;
        store.upsert_source(&seed(Platform::Rss, "slow")).await.unwrap();

        let handle = scheduler.clone().start();
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.stop().await;

        assert_eq!(rss.calls.load(Ordering::SeqCst), 1);
        let runs = store.recent_poll_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, PollStatus::Success);
        assert_eq!(scheduler.phase(), TickPhase::Idle);
    }

    #[tokio::test]
    async fn failing_page_does_not_drag_healthy_pages_off_cadence() {
        let now = Utc::now();
        let facebook = Arc::new(FakeAdapter::new(Platform::Facebook));
        facebook.script("broken", Script::Fail);
        facebook.script("healthy", Script::Items(vec![item(Platform::Facebook, "f1", now)]));
        let (store, scheduler) = scheduler(vec![facebook.clone()], SchedulerConfig::default()).await;
        store.upsert_source(&seed(Platform::Facebook, "broken")).await.unwrap();
        store.upsert_source(&seed(Platform::Facebook, "healthy")).await.unwrap();

        scheduler.tick(now).await.unwrap();
        assert_eq!(facebook.calls.load(Ordering::SeqCst), 2);
        for minute in 1..=5 {
            scheduler.tick(now + ChronoDuration::minutes(minute)).await.unwrap();
        }

        // Only the broken page is retried each minute.
        assert_eq!(facebook.calls.load(Ordering::SeqCst), 7);
        let healthy = store
            .list_sources(true)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.handle == "healthy")
            .unwrap();
        let polled = healthy.last_polled_at.unwrap();
        assert!((polled - now).num_milliseconds().abs() < 1);
    }

    #[tokio::test]
    async fn aggregation_and_hashtag_search_share_the_platform_limit() {
        let now = Utc::now();
        let facebook = Arc::new(FakeAdapter::new(Platform::Facebook));
        facebook.script(
            "page",
            Script::Slow(Duration::from_millis(80), vec![item(Platform::Facebook, "p1", now)]),
        );
        facebook.search_returns_after(Duration::from_millis(80), vec![item(Platform::Facebook, "t1", now)]);
        let config = SchedulerConfig {
            per_platform_concurrency: HashMap::from([(Platform::Facebook, 1)]),
            ..Default::default()
        };
        let (store, scheduler) = scheduler(vec![facebook.clone()], config).await;
        store.upsert_source(&seed(Platform::Facebook, "page")).await.unwrap();
        store
            .upsert_hashtag(&HashtagSeed {
                tag: "#NairobiTraffic".to_string(),
                platform_scope: "facebook".to_string(),
                is_regional: true,
                is_active: true,
                posts_per_hashtag: 10,
            })
            .await
            .unwrap();

        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.due_hashtags, 1);
        assert_eq!(report.aggregations.len(), 1);
        assert_eq!(report.items_stored + report.aggregations[0].stored, 2);
        assert_eq!(facebook.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn storage_error_while_selecting_closes_opened_runs() {
        let now = Utc::now();
        let rss = Arc::new(FakeAdapter::new(Platform::Rss));
        let (store, scheduler) = scheduler(vec![rss.clone()], SchedulerConfig::default()).await;
        store.upsert_source(&seed(Platform::Rss, "first")).await.unwrap();
        let second = store.upsert_source(&seed(Platform::Rss, "second")).await.unwrap();
        sqlx::query(&format!(
            "CREATE TRIGGER refuse_run BEFORE INSERT ON poll_runs WHEN NEW.source_id = {} \
             BEGIN SELECT RAISE(ABORT, 'poll_runs is read-only'); END",
            second.id
        ))
        .execute(store.pool())
        .await
        .unwrap();

        assert!(scheduler.tick(now).await.is_err());
        assert_eq!(rss.calls.load(Ordering::SeqCst), 0);

        let runs = store.recent_poll_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, PollStatus::Error);
        assert!(runs[0].completed_at.is_some());
        assert!(runs[0].error_message.as_deref().unwrap().starts_with("tick aborted"));

        // Claims were released with the aborted tick.
        sqlx::query("DROP TRIGGER refuse_run").execute(store.pool()).await.unwrap();
        let retry = scheduler.tick(now).await.unwrap();
        assert_eq!(retry.succeeded, 2);
    }

    #[tokio::test]
    async fn storage_error_while_committing_finishes_every_run() {
        let now = Utc::now();
        let reddit = Arc::new(FakeAdapter::new(Platform::Reddit));
        reddit.script("busy", Script::RateLimited(None));
        reddit.script("healthy", Script::Items(vec![item(Platform::Reddit, "r1", now)]));
        let (store, scheduler) = scheduler(vec![reddit], SchedulerConfig::default()).await;
        store.upsert_source(&seed(Platform::Reddit, "busy")).await.unwrap();
        store.upsert_source(&seed(Platform::Reddit, "healthy")).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER refuse_backoff BEFORE UPDATE OF backoff_until ON sources \
             WHEN NEW.handle = 'busy' BEGIN SELECT RAISE(ABORT, 'sources is read-only'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        assert!(scheduler.tick(now).await.is_err());

        let runs = store.recent_poll_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status != PollStatus::Running && r.completed_at.is_some()));
        assert!(runs.iter().any(|r| r.status == PollStatus::RateLimited));
        assert!(runs.iter().any(|r| r.status == PollStatus::Success && r.items_processed == 1));

        let stored = store.raw_items_since(now - ChronoDuration::days(1)).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn stop_during_an_overlong_tick_runs_no_extra_tick() {
        let now = Utc::now();
        let rss = Arc::new(FakeAdapter::new(Platform::Rss));
        rss.script(
            "slow",
            Script::Slow(Duration::from_millis(1200), vec![item(Platform::Rss, "s1", now)]),
        );
        rss.script("broken", Script::Fail);
        let config = SchedulerConfig {
            tick_interval_secs: 1,
            ..Default::default()
        };
        let (store, scheduler) = scheduler(vec![rss.clone()], config).await;
        store.upsert_source(&seed(Platform::Rss, "slow")).await.unwrap();
        store.upsert_source(&seed(Platform::Rss, "broken")).await.unwrap();

        let handle = scheduler.clone().start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        // The broken source stays due, so an extra tick would have called it again.
        assert_eq!(rss.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.recent_poll_runs(10).await.unwrap().len(), 2);
    }
}
