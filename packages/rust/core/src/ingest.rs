//! Batch ingestion: list a source, parse its recaps on the pool, upsert.
//!
//! Every recap URL is queued up front so the pool stays saturated; parsed
//! events are merged one at a time, in completion order.

use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use recapsync_pool::{RecapPool, RecapSource, parse_direct};
use recapsync_shared::{CandidateEvent, ParsedRecap, Result};
use recapsync_sources::{SourceAdapter, SourceEvent};
use recapsync_storage::{DocumentStore, Storage};

use crate::location::Geocoder;
use crate::uploader::{UpsertEngine, UpsertReport};

/// Counters for one source's batch run, stored as the run's stats JSON.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub source: String,
    /// Events the source listed.
    pub listed: usize,
    /// Events whose recap page parsed (on the pool or via fallback).
    pub parsed: usize,
    /// Events created or updated in the store.
    pub upserted: usize,
    /// Events parsed fine but with nothing tracked to persist.
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl IngestSummary {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }

    /// Events were listed and not one of them went through.
    pub fn is_total_failure(&self) -> bool {
        self.listed > 0 && self.upserted + self.skipped == 0
    }

    fn fail(&mut self, event: &str, error: impl std::fmt::Display) {
        self.failed += 1;
        self.errors.push(format!("{event}: {error}"));
    }
}

/// Progress callback for reporting ingestion status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as each event's recap page finishes parsing (or fails).
    fn event_parsed(&self, name: &str, current: usize, total: usize);
    /// Called after each upsert.
    fn event_upserted(&self, name: &str, report: &UpsertReport);
    /// Called when the source is done.
    fn done(&self, summary: &IngestSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn event_parsed(&self, _name: &str, _current: usize, _total: usize) {}
    fn event_upserted(&self, _name: &str, _report: &UpsertReport) {}
    fn done(&self, _summary: &IngestSummary) {}
}

/// Ingest everything one source currently lists.
///
/// Per-event failures are collected in the summary; only listing failures
/// and run-log failures surface as `Err`.
#[instrument(skip_all, fields(source = %adapter.name()))]
pub async fn run_source<A, R, S, G>(
    adapter: &A,
    pool: &RecapPool,
    fallback: &R,
    engine: &UpsertEngine<'_, S, G>,
    runs: &Storage,
    progress: &dyn ProgressReporter,
) -> Result<IngestSummary>
where
    A: SourceAdapter,
    R: RecapSource,
    S: DocumentStore,
    G: Geocoder,
{
    let start = Instant::now();
    let run_id = runs.insert_ingest_run(adapter.name()).await?;
    let mut summary = IngestSummary::new(adapter.name());

    progress.phase("Listing events");
    let events = match adapter.list_events().await {
        Ok(events) => events,
        Err(e) => {
            summary.errors.push(format!("listing failed: {e}"));
            finish(runs, &run_id, &mut summary, start).await;
            return Err(e);
        }
    };
    summary.listed = events.len();
    info!(count = events.len(), "events listed");

    progress.phase("Parsing recaps");
    let mut jobs = JoinSet::new();
    for (index, event) in events.iter().enumerate() {
        let handle = pool.enqueue(event.recap_url.clone());
        jobs.spawn(async move { (index, handle.await) });
    }

    let total = events.len();
    let mut completed = 0;
    while let Some(joined) = jobs.join_next().await {
        completed += 1;
        let (index, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "job waiter failed");
                summary.fail("<unknown>", e);
                continue;
            }
        };
        let event = &events[index];
        progress.event_parsed(&event.name, completed, total);

        let Some(recaps) = recaps_or_fallback(event, result, fallback, &mut summary).await else {
            continue;
        };
        summary.parsed += 1;

        let candidate = CandidateEvent {
            name: event.name.clone(),
            source: event.source.clone(),
            recap_url: event.recap_url.clone(),
            recaps,
        };
        match engine.upsert(&candidate).await {
            Ok(report) => {
                if report.persisted() {
                    summary.upserted += 1;
                } else {
                    summary.skipped += 1;
                }
                progress.event_upserted(&event.name, &report);
            }
            Err(e) => {
                warn!(event = %event.name, error = %e, "upsert failed");
                summary.fail(&event.name, e);
            }
        }
    }

    finish(runs, &run_id, &mut summary, start).await;
    info!(
        listed = summary.listed,
        upserted = summary.upserted,
        skipped = summary.skipped,
        failed = summary.failed,
        "source ingested"
    );
    progress.done(&summary);
    Ok(summary)
}

/// The pool's result, or one direct parse attempt when the pool job failed.
async fn recaps_or_fallback<R: RecapSource>(
    event: &SourceEvent,
    result: Result<Vec<ParsedRecap>>,
    fallback: &R,
    summary: &mut IngestSummary,
) -> Option<Vec<ParsedRecap>> {
    let error = match result {
        Ok(recaps) => return Some(recaps),
        Err(e) => e,
    };
    if !error.allows_fallback() {
        summary.fail(&event.name, error);
        return None;
    }

    warn!(event = %event.name, error = %error, "pool job failed, parsing directly");
    match parse_direct(fallback, &event.recap_url).await {
        Ok(recaps) => Some(recaps),
        Err(e) => {
            warn!(event = %event.name, error = %e, "direct parse failed");
            summary.fail(&event.name, e);
            None
        }
    }
}

async fn finish(runs: &Storage, run_id: &str, summary: &mut IngestSummary, start: Instant) {
    summary.elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    let stats = match serde_json::to_string(summary) {
        Ok(stats) => stats,
        Err(e) => {
            warn!(error = %e, "failed to encode run stats");
            return;
        }
    };
    if let Err(e) = runs.finish_ingest_run(run_id, &stats).await {
        warn!(%run_id, error = %e, "failed to record ingest run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use uuid::Uuid;

    use recapsync_pool::RecapSession;
    use recapsync_recap::split_sections;
    use recapsync_shared::{Event, Group, PoolConfig, RecapSyncError, UpsertPolicy};
    use recapsync_storage::{Collection, Document, Filter};

    use crate::location::DisabledGeocoder;
    use crate::testing::{FlakyStore, Rejections};

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("rs_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn fixture(name: &str) -> String {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../../fixtures/html")
            .join(name);
        std::fs::read_to_string(path).expect("read fixture")
    }

    /// Serves fixture pages by URL; listed URLs fail their first attempt.
    #[derive(Clone, Default)]
    struct FixtureSource {
        pages: Arc<HashMap<String, String>>,
        flaky: Arc<Mutex<Vec<String>>>,
    }

    struct FixtureSession(FixtureSource);

    impl RecapSource for FixtureSource {
        type Session = FixtureSession;

        async fn open(&self) -> Result<FixtureSession> {
            Ok(FixtureSession(self.clone()))
        }
    }

    impl RecapSession for FixtureSession {
        async fn fetch_sections(&mut self, url: &str) -> Result<Vec<String>> {
            let first_try = {
                let mut flaky = self.0.flaky.lock().unwrap();
                let pos = flaky.iter().position(|u| u == url);
                pos.map(|p| flaky.remove(p)).is_some()
            };
            if first_try {
                return Err(RecapSyncError::Network(format!("{url}: HTTP 503")));
            }
            match self.0.pages.get(url) {
                Some(page) => Ok(split_sections(page)),
                None => Err(RecapSyncError::Network(format!("{url}: HTTP 404"))),
            }
        }

        async fn close(self) {}
    }

    struct ListAdapter(Vec<SourceEvent>);

    impl SourceAdapter for ListAdapter {
        fn name(&self) -> &str {
            "WGI"
        }

        async fn list_events(&self) -> Result<Vec<SourceEvent>> {
            Ok(self.0.clone())
        }
    }

    fn listed(name: &str, url: &str) -> SourceEvent {
        SourceEvent {
            name: name.into(),
            source: "WGI".into(),
            recap_url: url.into(),
        }
    }

    fn pool_config() -> PoolConfig {
        PoolConfig {
            size: 2,
            shutdown_grace: Duration::from_millis(200),
            fetch_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn ingests_listed_events_end_to_end() {
        let page = fixture("recap.html");
        let source = FixtureSource {
            pages: Arc::new(HashMap::from([
                ("https://recaps.example.com/a.htm".to_string(), page.clone()),
                ("https://recaps.example.com/b.htm".to_string(), page),
            ])),
            flaky: Arc::new(Mutex::new(vec!["https://recaps.example.com/b.htm".into()])),
        };
        let adapter = ListAdapter(vec![
            listed("Dayton Regional", "https://recaps.example.com/a.htm"),
            listed("Indy Regional", "https://recaps.example.com/b.htm"),
            listed("Missing Show", "https://recaps.example.com/missing.htm"),
        ]);

        let storage = test_storage().await;
        let pool = RecapPool::new(source.clone(), pool_config());
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());

        let summary = run_source(&adapter, &pool, &source, &engine, &storage, &SilentProgress)
            .await
            .unwrap();
        pool.close().await;

        assert_eq!(summary.listed, 3);
        assert_eq!(summary.parsed, 2);
        assert_eq!(summary.upserted, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].starts_with("Missing Show"));
        assert!(!summary.is_total_failure());

        // Only the two percussion divisions of each page are tracked.
        let events: Vec<Document<Event>> = storage
            .query(Collection::Events, &Filter::And(vec![]))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.data.recaps.len() == 2));

        // Groups are shared across both events, one entry per event.
        let saratoga: Vec<Document<Group>> = storage
            .query(Collection::Groups, &Filter::eq("name", "Saratoga HS"))
            .await
            .unwrap();
        assert_eq!(saratoga.len(), 1);
        assert_eq!(saratoga[0].data.scores.len(), 2);

        let runs = storage.list_ingest_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].stats_json.as_deref().unwrap().contains("\"upserted\":2"));
    }

    #[tokio::test]
    async fn shutdown_rejections_are_not_retried() {
        let source = FixtureSource::default();
        let adapter = ListAdapter(vec![listed("Late Show", "https://recaps.example.com/late.htm")]);

        let storage = test_storage().await;
        let pool = RecapPool::new(source.clone(), pool_config());
        pool.close().await;
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());

        let summary = run_source(&adapter, &pool, &source, &engine, &storage, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].contains("pool shutting down"));
        assert!(summary.is_total_failure());
    }

    #[tokio::test]
    async fn rejected_event_writes_fail_the_run() {
        let source = FixtureSource {
            pages: Arc::new(HashMap::from([(
                "https://recaps.example.com/a.htm".to_string(),
                fixture("recap.html"),
            )])),
            ..FixtureSource::default()
        };
        let adapter = ListAdapter(vec![listed("Dayton Regional", "https://recaps.example.com/a.htm")]);

        let storage = test_storage().await;
        let store = FlakyStore::new(
            &storage,
            Rejections {
                event_adds: true,
                ..Rejections::default()
            },
        );
        let pool = RecapPool::new(source.clone(), pool_config());
        let engine = UpsertEngine::new(&store, &DisabledGeocoder, UpsertPolicy::default());

        let summary = run_source(&adapter, &pool, &source, &engine, &storage, &SilentProgress)
            .await
            .unwrap();
        pool.close().await;

        assert_eq!(summary.parsed, 1);
        assert_eq!(summary.upserted, 0);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].starts_with("Dayton Regional"));
        assert!(summary.is_total_failure());
    }

    #[test]
    fn empty_listing_is_not_a_failure() {
        let summary = IngestSummary::new("WGI");
        assert!(!summary.is_total_failure());
    }
}
