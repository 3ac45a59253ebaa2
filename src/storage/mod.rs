//! SQLite persistence for sources, raw items, stories and poll runs.
//!
//! [`Store`] wraps the connection pool for standalone reads and writes.
//! [`Batch`] wraps one transaction: every source scrape and every
//! aggregation batch writes through a single `Batch`, so its inserts and the
//! timestamp update commit together or not at all.

pub mod repository;

pub use repository::{Batch, NewRawItem, StoryDraft, StoryFilter, Store};
