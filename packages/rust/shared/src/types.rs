//! Core domain types for recap ingestion.
//!
//! Parsed types (`Parsed*`, [`CandidateEvent`]) keep every value as scraped
//! text. Persistent types ([`Event`], [`Group`], [`ScoreEntry`]) are the JSON
//! document shapes stored in the `events` and `groups` collections.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::score::Score;

/// Synthetic score key holding a row's subtotal.
pub const SUBTOTAL_KEY: &str = "Subtotal";

/// Synthetic score key holding a row's total.
pub const TOTAL_KEY: &str = "Total";

// ---------------------------------------------------------------------------
// Parsed (transient) types
// ---------------------------------------------------------------------------

/// One participant row of a recap, values unparsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRow {
    /// Participant (group) name as printed.
    pub name: String,
    /// Per-caption score text, positionally aligned with the recap's caption labels.
    pub captions: Vec<String>,
    /// Subtotal cell text.
    pub subtotal: String,
    /// Total cell text.
    pub total: String,
}

/// One division's result sheet, as parsed from a single fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRecap {
    /// Division name (e.g. "Percussion Scholastic World").
    pub division: String,
    /// Judged caption labels, summary columns already stripped.
    pub caption_labels: Vec<String>,
    /// Participant rows in display order.
    pub rows: Vec<ParsedRow>,
    /// Date text from the recap header; sanitized into a timestamp before storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Location text from the recap header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A parsed source event awaiting merge into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateEvent {
    /// Event name; the store's identity key for events.
    pub name: String,
    /// Source tag (e.g. "WGI").
    pub source: String,
    /// URL of the recap page the recaps came from.
    pub recap_url: String,
    /// Every recap found on the page.
    pub recaps: Vec<ParsedRecap>,
}

// ---------------------------------------------------------------------------
// Persistent types
// ---------------------------------------------------------------------------

/// Latitude/longitude pair stored on an event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// A geocoding result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    pub formatted_address: String,
}

impl GeoPoint {
    /// Just the coordinate pair.
    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

/// A recap row after numeric coercion and group resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedRow {
    pub name: String,
    pub captions: Vec<Score>,
    pub subtotal: Score,
    pub total: Score,
    /// Resolved group document id; absent when the group write failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// A recap as stored on an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedRecap {
    pub division: String,
    pub caption_labels: Vec<String>,
    pub rows: Vec<EnrichedRow>,
    /// Omitted entirely when the scraped date was unusable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// An event document in the `events` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub name: String,
    pub source: String,
    pub recap_url: String,
    #[serde(default)]
    pub recaps: Vec<EnrichedRecap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_address: Option<String>,
}

/// One event's result for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    /// Caption label (plus `Subtotal`/`Total`) → score.
    pub scores: BTreeMap<String, Score>,
}

/// A group document in the `groups` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub name: String,
    pub name_lower: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub aliases_lower: Vec<String>,
    pub division: String,
    pub source: String,
    /// At most one entry per `event_id`.
    #[serde(default)]
    pub scores: Vec<ScoreEntry>,
    /// Date of the recap the group was first seen on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl Group {
    /// A freshly sighted group with no aliases.
    pub fn new(
        name: &str,
        division: &str,
        source: &str,
        date: Option<DateTime<Utc>>,
        scores: Vec<ScoreEntry>,
    ) -> Self {
        Self {
            name: name.to_string(),
            name_lower: name.to_lowercase(),
            aliases: Vec::new(),
            aliases_lower: Vec::new(),
            division: division.to_string(),
            source: source.to_string(),
            scores,
            date,
        }
    }

    /// Whether the score history already holds an entry for `event_id`.
    pub fn has_score_for(&self, event_id: &str) -> bool {
        self.scores.iter().any(|s| s.event_id == event_id)
    }

    /// Latest dated entry in the score history.
    pub fn latest_score_date(&self) -> Option<DateTime<Utc>> {
        self.scores.iter().filter_map(|s| s.date).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(event_id: &str) -> ScoreEntry {
        let mut scores = BTreeMap::new();
        scores.insert("Music".to_string(), Score(18.5));
        scores.insert(TOTAL_KEY.to_string(), Score::NAN);
        ScoreEntry {
            event_id: event_id.into(),
            date: None,
            scores,
        }
    }

    #[test]
    fn parsed_recap_uses_camel_case() {
        let recap = ParsedRecap {
            division: "Percussion Independent World".into(),
            caption_labels: vec!["Music".into()],
            rows: vec![ParsedRow {
                name: "Pulse".into(),
                captions: vec!["18.5".into()],
                subtotal: "18.5".into(),
                total: "18.5".into(),
            }],
            date: None,
            location: None,
        };
        let json = serde_json::to_string(&recap).expect("serialize");
        assert!(json.contains(r#""captionLabels":["Music"]"#));
        assert!(!json.contains("date"));
    }

    #[test]
    fn score_entry_omits_missing_date() {
        let json = serde_json::to_value(sample_entry("ev1")).expect("serialize");
        assert!(json.get("date").is_none());
        assert_eq!(json["eventId"], "ev1");
        assert!(json["scores"]["Total"].is_null());
    }

    #[test]
    fn group_document_shape() {
        let group = Group::new("Saratoga HS", "Percussion Scholastic A", "WGI", None, vec![]);
        let json = serde_json::to_value(&group).expect("serialize");
        assert_eq!(json["nameLower"], "saratoga hs");
        assert_eq!(json["aliasesLower"], serde_json::json!([]));
        assert!(json.get("date").is_none());
    }

    #[test]
    fn group_score_lookup() {
        let mut group = Group::new("Pulse", "Percussion Independent World", "WGI", None, vec![]);
        assert!(!group.has_score_for("ev1"));
        group.scores.push(sample_entry("ev1"));
        assert!(group.has_score_for("ev1"));
        assert!(group.latest_score_date().is_none());
    }
}
