//! CompetitionSuite season bridge.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument};
use url::Url;

use recapsync_shared::{RecapSyncError, Result};

use crate::{SourceAdapter, SourceEvent};

/// Season listing endpoint.
pub const DEFAULT_BRIDGE_URL: &str =
    "https://bridge.competitionsuite.com/api/orgscores/GetCompetitionsBySeason/jsonp";

/// Recap pages live at `<base>/<competitionGuid>.htm`.
pub const DEFAULT_RECAP_BASE_URL: &str = "https://recaps.competitionsuite.com";

/// User-Agent string for bridge requests.
const USER_AGENT: &str = concat!("recapsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct SeasonResponse {
    #[serde(default)]
    competitions: Vec<Competition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Competition {
    competition_guid: String,
    #[serde(default)]
    name: Option<String>,
}

/// Lists a season's competitions through the CompetitionSuite bridge.
#[derive(Debug, Clone)]
pub struct CompetitionSuiteAdapter {
    source: String,
    season: String,
    bridge_url: Url,
    recap_base_url: String,
    client: Client,
}

impl CompetitionSuiteAdapter {
    pub fn new(
        source: &str,
        season: &str,
        bridge_url: &str,
        recap_base_url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let bridge_url = Url::parse(bridge_url)
            .map_err(|e| RecapSyncError::config(format!("invalid bridge_url {bridge_url:?}: {e}")))?;
        Url::parse(recap_base_url).map_err(|e| {
            RecapSyncError::config(format!("invalid recap_base_url {recap_base_url:?}: {e}"))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| RecapSyncError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            source: source.to_string(),
            season: season.to_string(),
            bridge_url,
            recap_base_url: recap_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn recap_url(&self, guid: &str) -> String {
        format!("{}/{guid}.htm", self.recap_base_url)
    }
}

impl SourceAdapter for CompetitionSuiteAdapter {
    fn name(&self) -> &str {
        &self.source
    }

    #[instrument(skip_all, fields(source = %self.source, season = %self.season))]
    async fn list_events(&self) -> Result<Vec<SourceEvent>> {
        let response = self
            .client
            .get(self.bridge_url.clone())
            .query(&[("season", self.season.as_str())])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| RecapSyncError::Network(format!("{}: {e}", self.bridge_url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecapSyncError::Network(format!(
                "{}: HTTP {status}",
                self.bridge_url
            )));
        }

        let season: SeasonResponse = response
            .json()
            .await
            .map_err(|e| RecapSyncError::validation(format!("malformed bridge response: {e}")))?;

        let mut seen = HashSet::new();
        let events: Vec<SourceEvent> = season
            .competitions
            .into_iter()
            .filter(|c| !c.competition_guid.trim().is_empty())
            .filter(|c| seen.insert(c.competition_guid.clone()))
            .map(|c| {
                let recap_url = self.recap_url(c.competition_guid.trim());
                let name = c
                    .name
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| c.competition_guid.clone());
                debug!(%name, %recap_url, "listed competition");
                SourceEvent {
                    name,
                    source: self.source.clone(),
                    recap_url,
                }
            })
            .collect();

        info!(count = events.len(), "season listed");
        Ok(events)
    }
}
