//! Core ingestion logic for recapsync.
//!
//! This crate ties the recap pool, the source adapters, and the document
//! store together: the upsert engine merges parsed events into the store,
//! and `run_source` drives one source's batch end to end.

pub mod alias;
pub mod ingest;
pub mod location;
pub mod uploader;

#[cfg(test)]
mod testing;

pub use alias::{AliasMerge, add_alias};
pub use ingest::{IngestSummary, ProgressReporter, SilentProgress, run_source};
pub use location::{
    CachedGeocoder, ConfiguredGeocoder, DisabledGeocoder, Geocoder, GoogleGeocoder,
    normalize_address,
};
pub use uploader::{UpsertEngine, UpsertReport, group_filter};
