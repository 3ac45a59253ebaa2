//! JSON snapshot files for downstream consumers.
//!
//! Ranked stories and insights can be written to disk as JSON so a static
//! dashboard or another job can pick them up without touching the database.
//!
//! # Output Structure
//!
//! Files are organized by UTC date, one file per snapshot:
//! ```text
//! json_output_dir/
//! └── 2025-05-06/
//!     ├── stories_0930.json
//!     ├── stories_1000.json
//!     └── insights_1000.json
//! ```
//!
//! A snapshot taken twice in the same minute overwrites the earlier file.

use std::error::Error;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, instrument};

/// Envelope written around every snapshot payload.
#[derive(Debug, Serialize)]
pub struct Snapshot<'a, T: Serialize> {
    pub kind: &'a str,
    pub generated_at: DateTime<Utc>,
    pub count: usize,
    pub data: &'a T,
}

/// Path of the snapshot file for `kind` taken at `at`.
pub fn snapshot_path(json_output_dir: &str, kind: &str, at: DateTime<Utc>) -> PathBuf {
    Path::new(json_output_dir)
        .join(at.format("%Y-%m-%d").to_string())
        .join(format!("{kind}_{}.json", at.format("%H%M")))
}

/// Write `data` as a [`Snapshot`] under `json_output_dir`.
///
/// # Arguments
///
/// * `json_output_dir` - Base directory for JSON output
/// * `kind` - File prefix, e.g. `stories` or `insights`
/// * `count` - Number of records in `data`, repeated in the envelope
/// * `data` - The payload to serialize
/// * `at` - Snapshot time; decides the date directory and file name
///
/// # Returns
///
/// The written path, or an error if directory creation or file writing fails.
#[instrument(level = "info", skip_all, fields(%json_output_dir, %kind))]
pub async fn write_snapshot<T: Serialize>(
    json_output_dir: &str,
    kind: &str,
    count: usize,
    data: &T,
    at: DateTime<Utc>,
) -> Result<PathBuf, Box<dyn Error>> {
    let snapshot = Snapshot {
        kind,
        generated_at: at,
        count,
        data,
    };
    let json = serde_json::to_string_pretty(&snapshot)?;

    let path = snapshot_path(json_output_dir, kind, at);
    if let Some(dir) = path.parent() {
        info!(dir = %dir.display(), "Ensuring JSON directory exists");
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create JSON dir");
            return Err(e.into());
        }
    }

    fs::write(&path, json).await?;
    info!(path = %path.display(), "Wrote JSON snapshot");
    Ok(path)
}
