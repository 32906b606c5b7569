//! Shared types, error model, and configuration for recapsync.
//!
//! This crate is the foundation depended on by all other recapsync crates.
//! It provides:
//! - [`RecapSyncError`], the unified error type
//! - Parsed and persistent domain types ([`ParsedRecap`], [`Event`], [`Group`], [`ScoreEntry`])
//! - [`Score`] and date sanitizing helpers
//! - Configuration ([`AppConfig`], [`PoolConfig`], [`UpsertPolicy`], config loading)

pub mod config;
pub mod dates;
pub mod error;
pub mod score;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, DivisionRefresh, GeocoderConfig, GeocoderSettings,
    GroupMatchScope, PolicyConfig, PoolConfig, SourceConfig, SourceKind, UpsertPolicy,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
};
pub use dates::sanitize_date;
pub use error::{RecapSyncError, Result};
pub use score::{Score, coerce_score};
pub use types::{
    CandidateEvent, Coordinates, EnrichedRecap, EnrichedRow, Event, GeoPoint, Group,
    ParsedRecap, ParsedRow, SUBTOTAL_KEY, ScoreEntry, TOTAL_KEY,
};
