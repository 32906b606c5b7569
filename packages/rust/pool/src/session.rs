//! The page-fetching seam between workers and the outside world.
//!
//! A [`RecapSource`] opens [`RecapSession`]s. Each worker opens one session
//! lazily on its first job and keeps it for its whole life, so the cost of
//! opening (browser start, connection pool warm-up) is paid once per slot.

use std::future::Future;

use tracing::{debug, instrument};

use recapsync_shared::{ParsedRecap, Result};

/// Factory for long-lived fetch sessions. Shared by every worker of a pool.
pub trait RecapSource: Send + Sync + 'static {
    type Session: RecapSession;

    /// Open a new session.
    fn open(&self) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// A long-lived session able to fetch recap pages.
pub trait RecapSession: Send + 'static {
    /// Fetch `url` and return the raw markup of every recap section on it.
    ///
    /// A [`RecapSyncError::Worker`](recapsync_shared::RecapSyncError::Worker)
    /// means the session itself is broken; the worker gives up and the pool
    /// replaces it. Any other error only fails the current job.
    fn fetch_sections(&mut self, url: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Release the session's resources.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Fetch and parse one page through an already-open session.
pub(crate) async fn fetch_recaps<S: RecapSession>(
    session: &mut S,
    url: &str,
) -> Result<Vec<ParsedRecap>> {
    let sections = session.fetch_sections(url).await?;
    debug!(url, sections = sections.len(), "page fetched");
    recapsync_recap::parse_sections(&sections)
}

/// Parse a page without a pool: open a fresh session, fetch once, close.
///
/// This is the fallback path for jobs the pool could not complete.
#[instrument(skip_all, fields(url = %url))]
pub async fn parse_direct<S: RecapSource>(source: &S, url: &str) -> Result<Vec<ParsedRecap>> {
    let mut session = source.open().await?;
    let result = fetch_recaps(&mut session, url).await;
    session.close().await;
    result
}
