//! Local JSON event manifests.
//!
//! A manifest is a JSON array of `{ "name": ..., "recapUrl": ... }` entries,
//! for circuits that publish recaps without a season listing API.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{info, instrument};
use url::Url;

use recapsync_shared::{RecapSyncError, Result};

use crate::{SourceAdapter, SourceEvent};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    name: String,
    recap_url: String,
}

/// Lists events from a manifest file on disk.
#[derive(Debug, Clone)]
pub struct ManifestAdapter {
    source: String,
    path: PathBuf,
}

impl ManifestAdapter {
    pub fn new(source: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.to_string(),
            path: path.into(),
        }
    }
}

impl SourceAdapter for ManifestAdapter {
    fn name(&self) -> &str {
        &self.source
    }

    #[instrument(skip_all, fields(source = %self.source, path = %self.path.display()))]
    async fn list_events(&self) -> Result<Vec<SourceEvent>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RecapSyncError::io(&self.path, e))?;

        let entries: Vec<ManifestEntry> = serde_json::from_str(&content).map_err(|e| {
            RecapSyncError::validation(format!("{}: invalid manifest: {e}", self.path.display()))
        })?;

        let mut events = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let name = entry.name.trim();
            if name.is_empty() {
                return Err(RecapSyncError::validation(format!(
                    "{}: entry {index} has an empty name",
                    self.path.display()
                )));
            }
            Url::parse(&entry.recap_url).map_err(|e| {
                RecapSyncError::validation(format!(
                    "{}: entry {index} ({name}): invalid recapUrl: {e}",
                    self.path.display()
                ))
            })?;
            events.push(SourceEvent {
                name: name.to_string(),
                source: self.source.clone(),
                recap_url: entry.recap_url,
            });
        }

        info!(count = events.len(), "manifest listed");
        Ok(events)
    }
}
