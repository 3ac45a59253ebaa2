//! Output generation for consumers that read files instead of the database.
//!
//! # Submodules
//!
//! - [`json`]: Writes ranked stories and insights as dated JSON snapshots

pub mod json;
