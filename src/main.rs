//! # Trend Radar
//!
//! A polling service that watches social platforms, RSS feeds and search-trend
//! feeds, scores every item for trending-ness and keeps a ranked, deduplicated
//! set of stories for downstream consumers.
//!
//! ## Features
//!
//! - Per-source polling cadence with rate-limit backoff and an in-flight guard
//! - Idempotent ingestion keyed by `(platform, external_id)`
//! - Pure, configurable scoring (velocity, credibility, relevance, regional boosts)
//! - Computed trending for platforms without a trending endpoint (rank-and-cut)
//! - Ranked retrieval with a fixed four-key order, insights and JSON snapshots
//!
//! ## Usage
//!
//! ```sh
//! trend_radar sources import
//! trend_radar run
//! trend_radar query --location africa
//! ```
//!
//! ## Architecture
//!
//! 1. **Scheduling**: each tick selects due sources and hashtags
//! 2. **Fetching**: platform adapters run concurrently under per-platform limits
//! 3. **Ingestion**: new items are stored once, scored and gated in one transaction
//! 4. **Aggregation**: aggregated platforms are ranked across all their sources
//! 5. **Retrieval**: stories are served in trending order

use std::error::Error;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod adapters;
mod aggregator;
mod cli;
mod config;
mod error;
mod ingest;
mod models;
mod outputs;
mod registry;
mod retrieval;
mod scheduler;
mod scoring;
mod storage;
mod utils;

use adapters::PlatformLimits;
use aggregator::TrendAggregator;
use cli::{Cli, Command, QueryArgs, SourcesCommand};
use config::AppConfig;
use outputs::json;
use registry::SourceRegistry;
use retrieval::{QueryParams, Retrieval};
use scheduler::{Clock, Scheduler, SystemClock};
use scoring::ScoringEngine;
use storage::Store;

/// The long-lived pieces every polling command needs.
struct Pipeline {
    aggregator: TrendAggregator,
    scheduler: Arc<Scheduler>,
}

fn pipeline(store: &Store, config: &AppConfig) -> Result<Pipeline, Box<dyn Error>> {
    let adapters = Arc::new(adapters::build_registry(config)?);
    let limits = Arc::new(PlatformLimits::new(&config.scheduler));
    let engine = Arc::new(ScoringEngine::new(config.scoring.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let aggregator = TrendAggregator::new(
        store.clone(),
        adapters.clone(),
        limits.clone(),
        engine.clone(),
        clock.clone(),
        config.aggregator.clone(),
        config.scheduler.clone(),
    );
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        adapters,
        limits,
        engine,
        aggregator.clone(),
        clock,
        config.scheduler.clone(),
    ));
    Ok(Pipeline {
        aggregator,
        scheduler,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn query_params(args: &QueryArgs) -> QueryParams {
    QueryParams {
        platform: args.platform,
        min_score: args.min_score,
        hours_back: args.hours_back,
        is_regional: args.regional,
        location: args.location.clone(),
        topic: args.topic.clone(),
        limit: args.limit,
    }
}

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("trend_radar starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(config = %args.config, command = ?args.command, "Parsed CLI arguments");

    // ---- Load config & open the store ----
    let mut config = AppConfig::load(&args.config)?;
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    if args.facebook_access_token.is_some() {
        config.credentials.facebook_access_token = args.facebook_access_token;
    }
    let store = Store::connect(&config.database_url, config.max_connections).await?;

    match args.command {
        Command::Run => {
            let pipeline = pipeline(&store, &config)?;
            let handle = pipeline.scheduler.clone().start();
            tokio::signal::ctrl_c().await?;
            info!(phase = ?pipeline.scheduler.phase(), "Interrupt received; stopping after the current tick");
            handle.stop().await;
        }
        Command::Tick => {
            let pipeline = pipeline(&store, &config)?;
            let report = pipeline.scheduler.tick(Utc::now()).await?;
            print_json(&report)?;
        }
        Command::Aggregate { platform } => {
            let pipeline = pipeline(&store, &config)?;
            let platforms = match platform {
                Some(p) => vec![p],
                None => pipeline.aggregator.platforms().to_vec(),
            };
            let mut reports = Vec::new();
            for platform in platforms {
                match pipeline.aggregator.run(platform, Utc::now()).await {
                    Ok(report) => reports.push(report),
                    Err(e) => error!(%platform, error = %e, "Aggregation failed"),
                }
            }
            print_json(&reports)?;
        }
        Command::Query(query) => {
            let retrieval = Retrieval::new(store.clone(), config.region.clone());
            let now = Utc::now();
            let views = retrieval.query_views(&query_params(&query), now).await?;
            if let Some(dir) = &query.json_output_dir {
                json::write_snapshot(dir, "stories", views.len(), &views, now).await?;
            }
            print_json(&views)?;
        }
        Command::Story { id } => {
            let retrieval = Retrieval::new(store.clone(), config.region.clone());
            match retrieval.story(id).await? {
                Some(view) => print_json(&view)?,
                None => return Err(format!("story {id} not found").into()),
            }
        }
        Command::Insights {
            hours_back,
            json_output_dir,
        } => {
            let retrieval = Retrieval::new(store.clone(), config.region.clone());
            let now = Utc::now();
            let insights = retrieval.insights(hours_back, now).await?;
            if let Some(dir) = &json_output_dir {
                json::write_snapshot(dir, "insights", insights.total_stories, &insights, now).await?;
            }
            print_json(&insights)?;
        }
        Command::Rescore { hours_back } => {
            let engine = ScoringEngine::new(config.scoring.clone());
            let report = ingest::rescore(&store, &engine, hours_back, Utc::now()).await?;
            print_json(&report)?;
        }
        Command::Runs { limit } => {
            print_json(&store.recent_poll_runs(limit).await?)?;
        }
        Command::Sources(command) => {
            let registry = SourceRegistry::new(store.clone(), config.scheduler.default_cadence_minutes);
            match command {
                SourcesCommand::Import => {
                    let report = registry.import(&config.sources, &config.hashtags).await?;
                    print_json(&report)?;
                }
                SourcesCommand::List { all, due } => {
                    let sources = if due {
                        registry.due_sources(Utc::now()).await?
                    } else {
                        registry.list(!all).await?
                    };
                    print_json(&sources)?;
                }
                SourcesCommand::Activate { ids } => {
                    registry.set_active(&ids, true).await?;
                    print_json(&registry.get_many(&ids).await?)?;
                }
                SourcesCommand::Deactivate { ids } => {
                    registry.set_active(&ids, false).await?;
                    print_json(&registry.get_many(&ids).await?)?;
                }
            }
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    Ok(())
}
