//! Result sources.
//!
//! A source adapter lists the events of one circuit as `(name, recap URL)`
//! pairs. Fetching and parsing the recap pages is the worker pool's job.

mod competition_suite;
mod manifest;

use std::future::Future;
use std::time::Duration;

use recapsync_shared::{RecapSyncError, Result, SourceConfig, SourceKind, expand_home};

pub use competition_suite::{
    CompetitionSuiteAdapter, DEFAULT_BRIDGE_URL, DEFAULT_RECAP_BASE_URL,
};
pub use manifest::ManifestAdapter;

/// One listed event awaiting recap parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent {
    /// Event name; becomes the event's identity key in the store.
    pub name: String,
    /// Source tag (e.g. "WGI").
    pub source: String,
    /// Results page to parse.
    pub recap_url: String,
}

/// Lists the events published by one source.
pub trait SourceAdapter: Send + Sync {
    /// Source tag stamped on every listed event.
    fn name(&self) -> &str;

    /// Every event currently listed by the source, in source order.
    fn list_events(&self) -> impl Future<Output = Result<Vec<SourceEvent>>> + Send;
}

// ---------------------------------------------------------------------------
// Config-driven construction
// ---------------------------------------------------------------------------

/// Any built-in adapter, selected from configuration.
#[derive(Debug, Clone)]
pub enum Adapter {
    CompetitionSuite(CompetitionSuiteAdapter),
    Manifest(ManifestAdapter),
}

impl SourceAdapter for Adapter {
    fn name(&self) -> &str {
        match self {
            Self::CompetitionSuite(a) => a.name(),
            Self::Manifest(a) => a.name(),
        }
    }

    async fn list_events(&self) -> Result<Vec<SourceEvent>> {
        match self {
            Self::CompetitionSuite(a) => a.list_events().await,
            Self::Manifest(a) => a.list_events().await,
        }
    }
}

/// Build the adapter a `[[sources]]` entry describes.
pub fn build_adapter(config: &SourceConfig, timeout: Duration) -> Result<Adapter> {
    match config.kind {
        SourceKind::CompetitionSuite => {
            let season = config.season.as_deref().ok_or_else(|| {
                RecapSyncError::config(format!("source {:?}: `season` is required", config.name))
            })?;
            let adapter = CompetitionSuiteAdapter::new(
                &config.name,
                season,
                config.bridge_url.as_deref().unwrap_or(DEFAULT_BRIDGE_URL),
                config
                    .recap_base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_RECAP_BASE_URL),
                timeout,
            )?;
            Ok(Adapter::CompetitionSuite(adapter))
        }
        SourceKind::Manifest => {
            let path = config.path.as_deref().ok_or_else(|| {
                RecapSyncError::config(format!("source {:?}: `path` is required", config.name))
            })?;
            Ok(Adapter::Manifest(ManifestAdapter::new(
                &config.name,
                expand_home(path)?,
            )))
        }
    }
}
