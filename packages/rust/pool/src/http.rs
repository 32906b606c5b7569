//! Plain-HTTP recap session.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use recapsync_shared::{PoolConfig, RecapSyncError, Result};

use crate::session::{RecapSession, RecapSource};

/// User-Agent string for recap fetches.
const USER_AGENT: &str = concat!("recapsync/", env!("CARGO_PKG_VERSION"));

/// Opens one [`HttpSession`] (one connection-pooling client) per worker.
#[derive(Debug, Clone)]
pub struct HttpRecapSource {
    timeout: Duration,
}

impl HttpRecapSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl From<&PoolConfig> for HttpRecapSource {
    fn from(config: &PoolConfig) -> Self {
        Self::new(config.fetch_timeout)
    }
}

impl RecapSource for HttpRecapSource {
    type Session = HttpSession;

    async fn open(&self) -> Result<HttpSession> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(self.timeout)
            .build()
            .map_err(|e| RecapSyncError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpSession { client })
    }
}

/// A worker's HTTP client.
#[derive(Debug)]
pub struct HttpSession {
    client: Client,
}

impl RecapSession for HttpSession {
    async fn fetch_sections(&mut self, url: &str) -> Result<Vec<String>> {
        debug!(url, "fetching recap page");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RecapSyncError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecapSyncError::Network(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RecapSyncError::Network(format!("{url}: body read failed: {e}")))?;

        Ok(recapsync_recap::split_sections(&body))
    }

    async fn close(self) {}
}
