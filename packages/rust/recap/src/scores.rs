//! Numeric coercion and caption/score alignment.

use std::collections::BTreeMap;

use recapsync_shared::{
    EnrichedRow, ParsedRow, RecapSyncError, Result, SUBTOTAL_KEY, Score, TOTAL_KEY, coerce_score,
};

/// Coerce a parsed row's text cells into scores. The group id is left unresolved.
pub fn coerce_row(row: &ParsedRow) -> EnrichedRow {
    EnrichedRow {
        name: row.name.clone(),
        captions: row.captions.iter().map(|c| coerce_score(c)).collect(),
        subtotal: coerce_score(&row.subtotal),
        total: coerce_score(&row.total),
        group_id: None,
    }
}

/// Pair caption labels with a row's caption scores by position, adding the
/// synthetic `Subtotal` and `Total` keys.
///
/// A length mismatch is a structure error; captions are never silently
/// misaligned.
pub fn zip_scores(labels: &[String], row: &EnrichedRow) -> Result<BTreeMap<String, Score>> {
    if labels.len() != row.captions.len() {
        return Err(RecapSyncError::structure(format!(
            "{}: {} caption labels but {} caption scores",
            row.name,
            labels.len(),
            row.captions.len()
        )));
    }

    let mut scores: BTreeMap<String, Score> = labels
        .iter()
        .cloned()
        .zip(row.captions.iter().copied())
        .collect();
    scores.insert(SUBTOTAL_KEY.to_string(), row.subtotal);
    scores.insert(TOTAL_KEY.to_string(), row.total);
    Ok(scores)
}
