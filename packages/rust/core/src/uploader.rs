//! Entity resolution and idempotent upsert of parsed events.
//!
//! The store has no transactions, so every write here is read, check, then
//! write. Re-running a candidate is a no-op on score history because a group
//! never receives a second [`ScoreEntry`] for the same event id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use recapsync_recap::{coerce_row, zip_scores};
use recapsync_shared::{
    CandidateEvent, Coordinates, DivisionRefresh, EnrichedRecap, EnrichedRow, Event, GeoPoint,
    Group, GroupMatchScope, ParsedRecap, Result, ScoreEntry, UpsertPolicy, sanitize_date,
};
use recapsync_storage::{Collection, Document, DocumentStore, Filter};

use crate::location::Geocoder;

/// What one upsert did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    /// Id of the created or updated event; `None` when nothing was tracked.
    pub event_id: Option<String>,
    /// Whether the event document was created by this call.
    pub created: bool,
    pub groups_created: usize,
    pub scores_appended: usize,
    /// Rows whose group already held an entry for this event.
    pub scores_skipped: usize,
    /// Individual writes (or rows) that failed and were skipped.
    pub failures: usize,
}

impl UpsertReport {
    pub fn persisted(&self) -> bool {
        self.event_id.is_some()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupPatch<'a> {
    scores: &'a [ScoreEntry],
    #[serde(skip_serializing_if = "Option::is_none")]
    division: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventPatch<'a> {
    recaps: &'a [EnrichedRecap],
    #[serde(skip_serializing_if = "Option::is_none")]
    coordinates: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    formatted_address: Option<&'a str>,
}

/// Merges candidate events into the `events` and `groups` collections.
pub struct UpsertEngine<'a, S, G> {
    store: &'a S,
    geocoder: &'a G,
    policy: UpsertPolicy,
}

impl<'a, S: DocumentStore, G: Geocoder> UpsertEngine<'a, S, G> {
    pub fn new(store: &'a S, geocoder: &'a G, policy: UpsertPolicy) -> Self {
        Self {
            store,
            geocoder,
            policy,
        }
    }

    pub fn policy(&self) -> &UpsertPolicy {
        &self.policy
    }

    /// Merge one candidate event.
    ///
    /// A failed event lookup or a failed event insert aborts this candidate.
    /// Group reads and writes that fail are logged, counted in
    /// [`UpsertReport::failures`], and the remaining rows still run.
    #[instrument(skip_all, fields(event = %candidate.name, source = %candidate.source))]
    pub async fn upsert(&self, candidate: &CandidateEvent) -> Result<UpsertReport> {
        let recaps: Vec<EnrichedRecap> = candidate
            .recaps
            .iter()
            .filter(|r| r.division.starts_with(&self.policy.division_prefix))
            .map(enrich_recap)
            .collect();

        let existing = self
            .store
            .query::<Event>(Collection::Events, &Filter::eq("name", &candidate.name))
            .await?;

        match existing.into_iter().next() {
            None => self.create(candidate, recaps).await,
            Some(doc) => self.update(doc, recaps).await,
        }
    }

    // -----------------------------------------------------------------------
    // Creation path
    // -----------------------------------------------------------------------

    async fn create(
        &self,
        candidate: &CandidateEvent,
        mut recaps: Vec<EnrichedRecap>,
    ) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        if recaps.is_empty() {
            info!("no tracked recaps, event not persisted");
            return Ok(report);
        }

        let location = self.locate(&recaps).await;

        // Resolve every row before the event write so it carries final group ids.
        for recap in &mut recaps {
            for row in &mut recap.rows {
                let found = self
                    .find_group(&row.name, &recap.division, self.policy.creation_match)
                    .await;
                row.group_id = match found {
                    Err(e) => {
                        warn!(group = %row.name, error = %e, "group lookup failed");
                        report.failures += 1;
                        None
                    }
                    Ok(Some(doc)) => Some(doc.id),
                    Ok(None) => {
                        let group = Group::new(
                            &row.name,
                            &recap.division,
                            &candidate.source,
                            recap.date,
                            Vec::new(),
                        );
                        self.add_group(&group, &mut report).await
                    }
                };
            }
        }

        let event = Event {
            name: candidate.name.clone(),
            source: candidate.source.clone(),
            recap_url: candidate.recap_url.clone(),
            recaps,
            coordinates: location.as_ref().map(GeoPoint::coordinates),
            formatted_address: location.map(|p| p.formatted_address),
        };

        // Groups created above stay behind when this fails.
        let event_id = self.store.add(Collection::Events, &event).await.map_err(|e| {
            warn!(groups_created = report.groups_created, error = %e, "event write failed");
            e
        })?;
        info!(%event_id, "event created");
        report.event_id = Some(event_id.clone());
        report.created = true;

        for recap in &event.recaps {
            for row in &recap.rows {
                let Some(group_id) = &row.group_id else {
                    continue;
                };
                let Some(entry) =
                    score_entry(&event_id, &recap.caption_labels, recap.date, row, &mut report)
                else {
                    continue;
                };
                match self.store.get::<Group>(Collection::Groups, group_id).await {
                    Ok(Some(group)) => self.append_score(group, entry, None, &mut report).await,
                    Ok(None) => warn!(group = %row.name, %group_id, "resolved group vanished"),
                    Err(e) => {
                        warn!(group = %row.name, %group_id, error = %e, "group read failed");
                        report.failures += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Update path
    // -----------------------------------------------------------------------

    async fn update(
        &self,
        existing: Document<Event>,
        mut recaps: Vec<EnrichedRecap>,
    ) -> Result<UpsertReport> {
        let event_id = existing.id;
        if recaps.is_empty() {
            debug!(%event_id, "no tracked recaps to merge");
            return Ok(UpsertReport::default());
        }
        let mut report = UpsertReport {
            event_id: Some(event_id.clone()),
            ..UpsertReport::default()
        };

        let location = if existing.data.coordinates.is_none() {
            self.locate(&recaps).await
        } else {
            None
        };

        for recap in &mut recaps {
            for row in &mut recap.rows {
                let entry =
                    score_entry(&event_id, &recap.caption_labels, recap.date, row, &mut report);
                let found = match self
                    .find_group(&row.name, &recap.division, self.policy.update_match)
                    .await
                {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(group = %row.name, error = %e, "group lookup failed");
                        report.failures += 1;
                        continue;
                    }
                };
                match found {
                    None => {
                        let appended = entry.is_some();
                        let group = Group::new(
                            &row.name,
                            &recap.division,
                            &existing.data.source,
                            recap.date,
                            entry.into_iter().collect(),
                        );
                        row.group_id = self.add_group(&group, &mut report).await;
                        if appended && row.group_id.is_some() {
                            report.scores_appended += 1;
                        }
                    }
                    Some(group) => {
                        row.group_id = Some(group.id.clone());
                        let Some(entry) = entry else {
                            continue;
                        };
                        let refresh = division_refresh(
                            self.policy.division_refresh,
                            &group.data,
                            recap.date,
                            &recap.division,
                        );
                        self.append_score(group, entry, refresh, &mut report).await;
                    }
                }
            }
        }

        let merged = merge_recaps(existing.data.recaps, recaps);
        let patch = EventPatch {
            recaps: &merged,
            coordinates: location.as_ref().map(GeoPoint::coordinates),
            formatted_address: location.as_ref().map(|p| p.formatted_address.as_str()),
        };
        if let Err(e) = self
            .store
            .update(Collection::Events, &event_id, &patch)
            .await
        {
            warn!(%event_id, error = %e, "event recap write failed");
            report.failures += 1;
        }

        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn find_group(
        &self,
        name: &str,
        division: &str,
        scope: GroupMatchScope,
    ) -> Result<Option<Document<Group>>> {
        let groups = self
            .store
            .query::<Group>(Collection::Groups, &group_filter(name, division, scope))
            .await?;
        Ok(groups.into_iter().next())
    }

    async fn add_group(&self, group: &Group, report: &mut UpsertReport) -> Option<String> {
        match self.store.add(Collection::Groups, group).await {
            Ok(id) => {
                info!(group = %group.name, division = %group.division, group_id = %id, "group created");
                report.groups_created += 1;
                Some(id)
            }
            Err(e) => {
                warn!(group = %group.name, error = %e, "group write failed");
                report.failures += 1;
                None
            }
        }
    }

    async fn append_score(
        &self,
        group: Document<Group>,
        entry: ScoreEntry,
        division: Option<&str>,
        report: &mut UpsertReport,
    ) {
        if group.data.has_score_for(&entry.event_id) {
            debug!(group = %group.data.name, event_id = %entry.event_id, "score already recorded");
            report.scores_skipped += 1;
            return;
        }

        let mut scores = group.data.scores;
        scores.push(entry);
        let patch = GroupPatch {
            scores: &scores,
            division,
        };
        match self.store.update(Collection::Groups, &group.id, &patch).await {
            Ok(()) => {
                if let Some(division) = division {
                    info!(group = %group.data.name, %division, "group division refreshed");
                }
                report.scores_appended += 1;
            }
            Err(e) => {
                warn!(group = %group.data.name, error = %e, "score write failed");
                report.failures += 1;
            }
        }
    }

    /// Geocode the first recap's location. Failures are not fatal.
    async fn locate(&self, recaps: &[EnrichedRecap]) -> Option<GeoPoint> {
        let location = recaps.first()?.location.as_deref()?;
        match self.geocoder.geocode(location).await {
            Ok(Some(point)) => {
                debug!(%location, lat = point.lat, lng = point.lng, "event geocoded");
                Some(point)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(%location, error = %e, "geocoding failed");
                None
            }
        }
    }
}

/// Case-insensitive name or alias match, optionally pinned to a division.
pub fn group_filter(name: &str, division: &str, scope: GroupMatchScope) -> Filter {
    let lower = name.to_lowercase();
    let by_name = Filter::Or(vec![
        Filter::eq("name", name),
        Filter::array_contains("aliases", name),
        Filter::eq("nameLower", lower.clone()),
        Filter::array_contains("aliasesLower", lower),
    ]);
    match scope {
        GroupMatchScope::Unscoped => by_name,
        GroupMatchScope::DivisionScoped => {
            Filter::And(vec![by_name, Filter::eq("division", division)])
        }
    }
}

fn enrich_recap(recap: &ParsedRecap) -> EnrichedRecap {
    let date = recap.date.as_deref().and_then(sanitize_date);
    if let (None, Some(raw)) = (&date, &recap.date) {
        debug!(division = %recap.division, date = %raw, "dropping unparsable date");
    }
    EnrichedRecap {
        division: recap.division.clone(),
        caption_labels: recap.caption_labels.clone(),
        rows: recap.rows.iter().map(coerce_row).collect(),
        date,
        location: recap.location.clone(),
    }
}

fn score_entry(
    event_id: &str,
    labels: &[String],
    date: Option<DateTime<Utc>>,
    row: &EnrichedRow,
    report: &mut UpsertReport,
) -> Option<ScoreEntry> {
    match zip_scores(labels, row) {
        Ok(scores) => Some(ScoreEntry {
            event_id: event_id.to_string(),
            date,
            scores,
        }),
        Err(e) => {
            warn!(group = %row.name, error = %e, "skipping misaligned row");
            report.failures += 1;
            None
        }
    }
}

/// The division to record on `group`, if this recap should refresh it.
fn division_refresh<'d>(
    policy: DivisionRefresh,
    group: &Group,
    recap_date: Option<DateTime<Utc>>,
    division: &'d str,
) -> Option<&'d str> {
    match policy {
        DivisionRefresh::Never => None,
        DivisionRefresh::NewestForGroup => {
            let date = recap_date?;
            let newest = group.latest_score_date().is_none_or(|latest| date > latest);
            (newest && group.division != division).then_some(division)
        }
    }
}

/// Replace stored recaps by division; stored divisions absent from `fresh` are kept.
fn merge_recaps(stored: Vec<EnrichedRecap>, fresh: Vec<EnrichedRecap>) -> Vec<EnrichedRecap> {
    let mut merged = stored;
    for recap in fresh {
        match merged.iter_mut().find(|r| r.division == recap.division) {
            Some(slot) => *slot = recap,
            None => merged.push(recap),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;

    use serde::de::DeserializeOwned;
    use uuid::Uuid;

    use recapsync_shared::{ParsedRow, RecapSyncError, TOTAL_KEY};
    use recapsync_storage::Storage;

    use crate::location::DisabledGeocoder;
    use crate::testing::{FlakyStore, Rejections};

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("rs_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn row(name: &str, captions: &[&str], total: &str) -> ParsedRow {
        ParsedRow {
            name: name.into(),
            captions: captions.iter().map(|c| c.to_string()).collect(),
            subtotal: total.into(),
            total: total.into(),
        }
    }

    fn recap(division: &str, date: Option<&str>, rows: Vec<ParsedRow>) -> ParsedRecap {
        ParsedRecap {
            division: division.into(),
            caption_labels: vec!["Music".into(), "Visual".into()],
            rows,
            date: date.map(str::to_string),
            location: Some("Dayton, OH".into()),
        }
    }

    fn candidate(name: &str, recaps: Vec<ParsedRecap>) -> CandidateEvent {
        CandidateEvent {
            name: name.into(),
            source: "WGI".into(),
            recap_url: format!("https://recaps.example.com/{}.htm", name.replace(' ', "-")),
            recaps,
        }
    }

    fn dayton() -> CandidateEvent {
        candidate(
            "Dayton Regional",
            vec![recap(
                "Percussion Scholastic World",
                Some("Saturday, March 15, 2025"),
                vec![
                    row("Saratoga HS", &["40.1", "39.5"], "79.6"),
                    row("Centerville HS", &["38.0", "--"], "38.0"),
                ],
            )],
        )
    }

    async fn all<T: DeserializeOwned>(storage: &Storage, collection: Collection) -> Vec<Document<T>> {
        storage.query(collection, &Filter::And(vec![])).await.unwrap()
    }

    #[tokio::test]
    async fn creates_event_groups_and_scores() {
        let storage = test_storage().await;
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());

        let report = engine.upsert(&dayton()).await.unwrap();
        assert!(report.created);
        assert_eq!(report.groups_created, 2);
        assert_eq!(report.scores_appended, 2);
        assert_eq!(report.failures, 0);

        let events: Vec<Document<Event>> = all(&storage, Collection::Events).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(Some(&event.id), report.event_id.as_ref());
        assert!(event.data.recaps[0].rows.iter().all(|r| r.group_id.is_some()));

        let groups: Vec<Document<Group>> = all(&storage, Collection::Groups).await;
        let centerville = groups.iter().find(|g| g.data.name == "Centerville HS").unwrap();
        assert_eq!(centerville.data.scores.len(), 1);
        let entry = &centerville.data.scores[0];
        assert_eq!(entry.event_id, event.id);
        assert!(entry.scores["Visual"].is_nan());
        assert_eq!(entry.scores[TOTAL_KEY].0, 38.0);
    }

    #[tokio::test]
    async fn rerunning_a_candidate_is_a_no_op() {
        let storage = test_storage().await;
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());

        let first = engine.upsert(&dayton()).await.unwrap();
        let second = engine.upsert(&dayton()).await.unwrap();

        assert!(!second.created);
        assert_eq!(second.event_id, first.event_id);
        assert_eq!(second.groups_created, 0);
        assert_eq!(second.scores_appended, 0);
        assert_eq!(second.scores_skipped, 2);

        let events: Vec<Document<Event>> = all(&storage, Collection::Events).await;
        assert_eq!(events.len(), 1);
        let groups: Vec<Document<Group>> = all(&storage, Collection::Groups).await;
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.data.scores.len() == 1));
    }

    #[tokio::test]
    async fn aliases_resolve_to_the_canonical_group() {
        let storage = test_storage().await;
        let mut canonical =
            Group::new("Saratoga HS", "Percussion Scholastic World", "WGI", None, vec![]);
        canonical.aliases = vec!["Saratoga HS World".into()];
        canonical.aliases_lower = vec!["saratoga hs world".into()];
        let canonical_id = storage.add(Collection::Groups, &canonical).await.unwrap();

        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());
        for (event, name) in [("Show A", "Saratoga HS World"), ("Show B", "SARATOGA HS")] {
            let report = engine
                .upsert(&candidate(
                    event,
                    vec![recap(
                        "Percussion Scholastic World",
                        None,
                        vec![row(name, &["40", "40"], "80")],
                    )],
                ))
                .await
                .unwrap();
            assert_eq!(report.groups_created, 0);

            let stored: Document<Event> = storage
                .get(Collection::Events, report.event_id.as_deref().unwrap())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.data.recaps[0].rows[0].group_id.as_deref(), Some(canonical_id.as_str()));
        }

        let group: Document<Group> = storage
            .get(Collection::Groups, &canonical_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.data.scores.len(), 2);
    }

    #[tokio::test]
    async fn untracked_divisions_are_not_persisted() {
        let storage = test_storage().await;
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());

        let report = engine
            .upsert(&candidate(
                "Guard Only",
                vec![recap("Color Guard", None, vec![row("Fairmont HS", &["80", "80"], "80")])],
            ))
            .await
            .unwrap();

        assert!(!report.persisted());
        assert!(all::<Event>(&storage, Collection::Events).await.is_empty());
        assert!(all::<Group>(&storage, Collection::Groups).await.is_empty());
    }

    #[tokio::test]
    async fn unparsable_dates_are_omitted() {
        let storage = test_storage().await;
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());

        let report = engine
            .upsert(&candidate(
                "Undated",
                vec![recap(
                    "Percussion Independent A",
                    Some("TBD"),
                    vec![row("Pulse", &["40", "40"], "80")],
                )],
            ))
            .await
            .unwrap();

        let event: Document<serde_json::Value> = storage
            .get(Collection::Events, report.event_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(event.data["recaps"][0].get("date").is_none());

        let groups: Vec<Document<serde_json::Value>> = all(&storage, Collection::Groups).await;
        assert!(groups[0].data.get("date").is_none());
        assert!(groups[0].data["scores"][0].get("date").is_none());
    }

    #[tokio::test]
    async fn update_path_appends_new_events_and_merges_recaps() {
        let storage = test_storage().await;
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());
        let first = engine.upsert(&dayton()).await.unwrap();

        // Same event, a second tracked division published later.
        let mut later = dayton();
        later.recaps = vec![recap(
            "Percussion Scholastic A",
            Some("March 15, 2025"),
            vec![row("Fairborn HS", &["30", "30"], "60")],
        )];
        let report = engine.upsert(&later).await.unwrap();
        assert_eq!(report.event_id, first.event_id);
        assert_eq!(report.groups_created, 1);
        assert_eq!(report.scores_appended, 1);

        let event: Document<Event> = storage
            .get(Collection::Events, first.event_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        let divisions: Vec<_> = event.data.recaps.iter().map(|r| r.division.as_str()).collect();
        assert_eq!(divisions, ["Percussion Scholastic World", "Percussion Scholastic A"]);
        assert!(event.data.recaps[1].rows[0].group_id.is_some());
    }

    #[tokio::test]
    async fn update_matching_scope_follows_policy() {
        let storage = test_storage().await;
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());
        engine
            .upsert(&candidate(
                "Early Show",
                vec![recap(
                    "Percussion Independent A",
                    Some("2025-02-01"),
                    vec![row("Pulse", &["30", "30"], "60")],
                )],
            ))
            .await
            .unwrap();
        let existing = dayton();
        engine.upsert(&existing).await.unwrap();

        // Division-scoped update matching misses Pulse in the new division.
        let mut promoted = existing.clone();
        promoted.recaps = vec![recap(
            "Percussion Independent World",
            Some("2025-03-15"),
            vec![row("Pulse", &["40", "40"], "80")],
        )];
        let report = engine.upsert(&promoted).await.unwrap();
        assert_eq!(report.groups_created, 1);

        // Unscoped matching finds it and refreshes its division from the newer recap.
        let storage = test_storage().await;
        let policy = UpsertPolicy {
            update_match: GroupMatchScope::Unscoped,
            ..UpsertPolicy::default()
        };
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, policy);
        engine
            .upsert(&candidate(
                "Early Show",
                vec![recap(
                    "Percussion Independent A",
                    Some("2025-02-01"),
                    vec![row("Pulse", &["30", "30"], "60")],
                )],
            ))
            .await
            .unwrap();
        engine.upsert(&existing).await.unwrap();
        let report = engine.upsert(&promoted).await.unwrap();
        assert_eq!(report.groups_created, 0);
        assert_eq!(report.scores_appended, 1);

        let pulse: Vec<Document<Group>> = storage
            .query(Collection::Groups, &Filter::eq("name", "Pulse"))
            .await
            .unwrap();
        assert_eq!(pulse.len(), 1);
        assert_eq!(pulse[0].data.division, "Percussion Independent World");
        assert_eq!(pulse[0].data.scores.len(), 2);
    }

    #[test]
    fn division_refresh_policies() {
        let dated = |day: u32| {
            chrono::NaiveDate::from_ymd_opt(2025, 3, day)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|n| n.and_utc())
        };
        let world = "Percussion Independent World";
        let mut group = Group::new("Pulse", "Percussion Independent A", "WGI", None, vec![]);
        group.scores.push(ScoreEntry {
            event_id: "ev1".into(),
            date: dated(10),
            scores: Default::default(),
        });

        let newest = DivisionRefresh::NewestForGroup;
        assert_eq!(division_refresh(newest, &group, dated(15), world), Some(world));
        assert_eq!(division_refresh(newest, &group, dated(5), world), None);
        assert_eq!(division_refresh(newest, &group, None, world), None);
        assert_eq!(
            division_refresh(newest, &group, dated(15), "Percussion Independent A"),
            None
        );
        assert_eq!(division_refresh(DivisionRefresh::Never, &group, dated(15), world), None);
    }

    // -----------------------------------------------------------------------
    // Failure tolerance
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn group_write_failures_do_not_abort_the_event() {
        let storage = test_storage().await;
        let store = FlakyStore::new(
            &storage,
            Rejections {
                group_updates: true,
                ..Rejections::default()
            },
        );
        let engine = UpsertEngine::new(&store, &DisabledGeocoder, UpsertPolicy::default());

        let report = engine.upsert(&dayton()).await.unwrap();
        assert!(report.created);
        assert_eq!(report.groups_created, 2);
        assert_eq!(report.scores_appended, 0);
        assert_eq!(report.failures, 2);

        // Groups exist without score entries; the event is intact.
        let groups: Vec<Document<Group>> = all(&storage, Collection::Groups).await;
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.data.scores.is_empty()));
        assert_eq!(all::<Event>(&storage, Collection::Events).await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_event_insert_fails_the_candidate() {
        let storage = test_storage().await;
        let store = FlakyStore::new(
            &storage,
            Rejections {
                event_adds: true,
                ..Rejections::default()
            },
        );
        let engine = UpsertEngine::new(&store, &DisabledGeocoder, UpsertPolicy::default());

        let err = engine.upsert(&dayton()).await.unwrap_err();
        assert!(matches!(err, RecapSyncError::StoreWrite(_)));

        // Groups resolved before the insert remain, unlinked and without scores.
        assert!(all::<Event>(&storage, Collection::Events).await.is_empty());
        let groups: Vec<Document<Group>> = all(&storage, Collection::Groups).await;
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.data.scores.is_empty()));

        // A later run over a healthy store links the leftover groups.
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());
        let report = engine.upsert(&dayton()).await.unwrap();
        assert!(report.created);
        assert_eq!(report.groups_created, 0);
        assert_eq!(report.scores_appended, 2);
    }

    #[tokio::test]
    async fn group_read_failures_skip_only_their_rows() {
        let storage = test_storage().await;
        let store = FlakyStore::new(
            &storage,
            Rejections {
                group_gets: true,
                ..Rejections::default()
            },
        );
        let engine = UpsertEngine::new(&store, &DisabledGeocoder, UpsertPolicy::default());

        let report = engine.upsert(&dayton()).await.unwrap();
        assert!(report.persisted());
        assert!(report.created);
        assert_eq!(report.groups_created, 2);
        assert_eq!(report.scores_appended, 0);
        assert_eq!(report.failures, 2);
        assert_eq!(all::<Event>(&storage, Collection::Events).await.len(), 1);
    }

    #[tokio::test]
    async fn group_lookup_failures_still_merge_event_recaps() {
        let storage = test_storage().await;
        let healthy = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());
        let first = healthy.upsert(&dayton()).await.unwrap();

        let store = FlakyStore::new(
            &storage,
            Rejections {
                group_queries: true,
                ..Rejections::default()
            },
        );
        let engine = UpsertEngine::new(&store, &DisabledGeocoder, UpsertPolicy::default());
        let mut later = dayton();
        later.recaps = vec![recap(
            "Percussion Scholastic A",
            Some("March 15, 2025"),
            vec![
                row("Fairborn HS", &["30", "30"], "60"),
                row("Kettering HS", &["31", "31"], "62"),
            ],
        )];
        let report = engine.upsert(&later).await.unwrap();
        assert_eq!(report.event_id, first.event_id);
        assert_eq!(report.failures, 2);
        assert_eq!(report.groups_created, 0);

        let event: Document<Event> = storage
            .get(Collection::Events, first.event_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.data.recaps.len(), 2);
        assert_eq!(event.data.recaps[1].rows.len(), 2);
        assert!(event.data.recaps[1].rows.iter().all(|r| r.group_id.is_none()));
    }

    #[tokio::test]
    async fn untracked_recaps_for_a_known_event_are_skipped() {
        let storage = test_storage().await;
        let engine = UpsertEngine::new(&storage, &DisabledGeocoder, UpsertPolicy::default());
        engine.upsert(&dayton()).await.unwrap();

        let mut guard_only = dayton();
        guard_only.recaps = vec![recap(
            "Color Guard",
            None,
            vec![row("Fairmont HS", &["80", "80"], "80")],
        )];
        let report = engine.upsert(&guard_only).await.unwrap();
        assert!(!report.persisted());
        assert_eq!(report, UpsertReport::default());
    }

    // -----------------------------------------------------------------------
    // Location enrichment
    // -----------------------------------------------------------------------

    struct CountingGeocoder {
        calls: Cell<usize>,
    }

    impl Geocoder for CountingGeocoder {
        async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
            self.calls.set(self.calls.get() + 1);
            Ok(Some(GeoPoint {
                lat: 39.75,
                lng: -84.19,
                formatted_address: format!("{address}, USA"),
            }))
        }
    }

    #[tokio::test]
    async fn geocodes_once_per_event() {
        let storage = test_storage().await;
        let geocoder = CountingGeocoder { calls: Cell::new(0) };
        let engine = UpsertEngine::new(&storage, &geocoder, UpsertPolicy::default());

        let report = engine.upsert(&dayton()).await.unwrap();
        engine.upsert(&dayton()).await.unwrap();
        assert_eq!(geocoder.calls.get(), 1);

        let event: Document<Event> = storage
            .get(Collection::Events, report.event_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.data.coordinates, Some(Coordinates { lat: 39.75, lng: -84.19 }));
        assert_eq!(event.data.formatted_address.as_deref(), Some("Dayton, OH, USA"));
    }

    #[test]
    fn merge_replaces_matching_divisions_in_place() {
        let stored = vec![
            enrich_recap(&recap("Percussion A", None, vec![])),
            enrich_recap(&recap("Percussion B", None, vec![])),
        ];
        let fresh = vec![enrich_recap(&recap(
            "Percussion A",
            None,
            vec![row("Pulse", &["1", "1"], "2")],
        ))];
        let merged = merge_recaps(stored, fresh);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].division, "Percussion A");
        assert_eq!(merged[0].rows.len(), 1);
        assert_eq!(merged[1].division, "Percussion B");
    }
}
