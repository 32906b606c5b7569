//! Administrative alias merge for duplicate groups.
//!
//! Run by hand when the same competitor was stored under two names. All
//! matching group documents collapse into the oldest one.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, instrument, warn};

use recapsync_shared::{EnrichedRecap, Event, Group, RecapSyncError, Result, ScoreEntry};
use recapsync_storage::{Collection, Document, DocumentStore, Filter};

/// Outcome of [`add_alias`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasMerge {
    /// The surviving group document.
    pub group_id: String,
    /// Duplicate group documents deleted.
    pub merged: usize,
    pub aliases: Vec<String>,
    /// Events whose rows were repointed at the surviving group.
    pub relinked_events: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AliasPatch<'a> {
    name: &'a str,
    name_lower: String,
    aliases: &'a [String],
    aliases_lower: Vec<String>,
    scores: &'a [ScoreEntry],
}

#[derive(Serialize)]
struct RecapsPatch<'a> {
    recaps: &'a [EnrichedRecap],
}

fn either_name(group_name: &str, alias: &str) -> Filter {
    let mut alternatives = Vec::new();
    for name in [group_name, alias] {
        let lower = name.to_lowercase();
        alternatives.push(Filter::eq("name", name));
        alternatives.push(Filter::array_contains("aliases", name));
        alternatives.push(Filter::eq("nameLower", lower.clone()));
        alternatives.push(Filter::array_contains("aliasesLower", lower));
    }
    Filter::Or(alternatives)
}

/// Record `alias` for `group_name`, merging every group known by either name.
///
/// Score histories are unioned keeping the first entry per event id, so the
/// merged group still holds at most one entry per event.
#[instrument(skip(store))]
pub async fn add_alias<S: DocumentStore>(
    store: &S,
    group_name: &str,
    alias: &str,
) -> Result<AliasMerge> {
    let group_name = group_name.trim();
    let alias = alias.trim();
    if group_name.is_empty() || alias.is_empty() {
        return Err(RecapSyncError::validation("group name and alias must be non-empty"));
    }

    let mut groups: Vec<Document<Group>> = store
        .query(Collection::Groups, &either_name(group_name, alias))
        .await?;
    if groups.is_empty() {
        return Err(RecapSyncError::NotFound(format!(
            "no group named {group_name:?} or {alias:?}"
        )));
    }

    let duplicates = groups.split_off(1);
    let Some(keeper) = groups.pop() else {
        return Err(RecapSyncError::NotFound(group_name.to_string()));
    };

    let mut aliases: Vec<String> = Vec::new();
    let mut scores: Vec<ScoreEntry> = Vec::new();
    let mut seen_events = HashSet::new();
    for doc in std::iter::once(&keeper).chain(duplicates.iter()) {
        let names = std::iter::once(&doc.data.name).chain(doc.data.aliases.iter());
        for name in names {
            if name != group_name && !aliases.contains(name) {
                aliases.push(name.clone());
            }
        }
        for entry in &doc.data.scores {
            if seen_events.insert(entry.event_id.clone()) {
                scores.push(entry.clone());
            }
        }
    }
    if alias != group_name && !aliases.iter().any(|a| a == alias) {
        aliases.push(alias.to_string());
    }

    let mut aliases_lower: Vec<String> = Vec::new();
    for lower in aliases.iter().map(|a| a.to_lowercase()) {
        if !aliases_lower.contains(&lower) {
            aliases_lower.push(lower);
        }
    }

    let patch = AliasPatch {
        name: group_name,
        name_lower: group_name.to_lowercase(),
        aliases: &aliases,
        aliases_lower,
        scores: &scores,
    };
    store.update(Collection::Groups, &keeper.id, &patch).await?;

    let duplicate_ids: Vec<&str> = duplicates.iter().map(|d| d.id.as_str()).collect();
    let relinked_events = relink_events(store, &duplicate_ids, &keeper.id).await?;

    for id in &duplicate_ids {
        store.delete(Collection::Groups, id).await?;
    }

    info!(
        group_id = %keeper.id,
        merged = duplicates.len(),
        relinked_events,
        "alias recorded"
    );
    Ok(AliasMerge {
        group_id: keeper.id,
        merged: duplicates.len(),
        aliases,
        relinked_events,
    })
}

/// Point event rows that reference a deleted group at the surviving one.
async fn relink_events<S: DocumentStore>(store: &S, from: &[&str], to: &str) -> Result<usize> {
    if from.is_empty() {
        return Ok(0);
    }

    let events: Vec<Document<Event>> = store.query(Collection::Events, &Filter::And(vec![])).await?;
    let mut relinked = 0;
    for mut event in events {
        let mut touched = false;
        for row in event.data.recaps.iter_mut().flat_map(|r| r.rows.iter_mut()) {
            if row.group_id.as_deref().is_some_and(|id| from.contains(&id)) {
                row.group_id = Some(to.to_string());
                touched = true;
            }
        }
        if !touched {
            continue;
        }
        let patch = RecapsPatch {
            recaps: &event.data.recaps,
        };
        match store.update(Collection::Events, &event.id, &patch).await {
            Ok(()) => relinked += 1,
            Err(e) => warn!(event_id = %event.id, error = %e, "event relink failed"),
        }
    }
    Ok(relinked)
}
