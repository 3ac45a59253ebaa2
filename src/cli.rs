//! Command-line interface definitions for Trend Radar.
//!
//! Every global option can also come from the environment, so the same binary
//! runs unchanged under a process supervisor or a cron job.

use clap::{Args, Parser, Subcommand};

use crate::models::Platform;

/// Command-line arguments for the Trend Radar service.
///
/// # Examples
///
/// ```sh
/// # Seed sources from the config file, then poll forever
/// trend_radar sources import
/// trend_radar run
///
/// # One-off tick against another database
/// DATABASE_URL=sqlite://staging.db trend_radar tick
///
/// # Ranked regional stories from the last six hours, as JSON
/// trend_radar query --hours-back 6 --location africa --json-output-dir ./snapshots
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "TREND_RADAR_CONFIG", default_value = "trend_radar.yaml")]
    pub config: String,

    /// Database URL; overrides `database_url` from the config file
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Facebook Graph API access token; overrides the config file
    #[arg(long, env = "FACEBOOK_ACCESS_TOKEN", hide_env_values = true)]
    pub facebook_access_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler loop until interrupted
    Run,
    /// Run a single scheduler tick and exit
    Tick,
    /// Run the trend aggregator for a platform (all aggregated platforms when omitted)
    Aggregate {
        #[arg(long)]
        platform: Option<Platform>,
    },
    /// Print ranked stories
    Query(QueryArgs),
    /// Print a single story
    Story { id: i64 },
    /// Print story statistics for a time window
    Insights {
        #[arg(long, default_value_t = 24)]
        hours_back: i64,

        /// Also write the result as a JSON snapshot under this directory
        #[arg(long)]
        json_output_dir: Option<String>,
    },
    /// Recompute scores for recently ingested items
    Rescore {
        #[arg(long, default_value_t = 24)]
        hours_back: i64,
    },
    /// Print the most recent poll runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Manage polling sources
    #[command(subcommand)]
    Sources(SourcesCommand),
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[arg(long)]
    pub platform: Option<Platform>,

    #[arg(long)]
    pub min_score: Option<f64>,

    #[arg(long, default_value_t = 24)]
    pub hours_back: i64,

    /// Only regional (`true`) or only non-regional (`false`) stories
    #[arg(long)]
    pub regional: Option<bool>,

    /// Location substring, or the configured continent name
    #[arg(long)]
    pub location: Option<String>,

    #[arg(long)]
    pub topic: Option<String>,

    #[arg(long, default_value_t = 50)]
    pub limit: i64,

    /// Also write the result as a JSON snapshot under this directory
    #[arg(long)]
    pub json_output_dir: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum SourcesCommand {
    /// Upsert sources and hashtags declared in the config file
    Import,
    /// List sources
    List {
        /// Include deactivated sources
        #[arg(long)]
        all: bool,

        /// Only sources due for polling now
        #[arg(long, conflicts_with = "all")]
        due: bool,
    },
    /// Re-enable sources by id
    Activate {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Soft-disable sources by id; their history is kept
    Deactivate {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}
