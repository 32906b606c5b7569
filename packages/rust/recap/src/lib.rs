//! Recap page parsing.
//!
//! A results page holds one section per division. Each section carries a
//! division-name row, a caption-label header row, judge and subcaption rows,
//! and one row per participant. Parsing keeps every value as text; numeric
//! coercion happens afterwards in [`scores`].

pub mod scores;

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument, warn};

use recapsync_shared::{ParsedRecap, ParsedRow, RecapSyncError, Result};

pub use scores::{coerce_row, zip_scores};

/// Summary columns at the end of the header row (subtotal, penalties, total).
const SUMMARY_COLUMNS: usize = 3;

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static recap selector")
}

static SECTION_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"div[style="margin-top: 30px;"]"#));
static DIVISION_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector("tr.header-division-name > td"));
static SCORE_TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector("tr:not(.header-division-name) > td > table > tbody"));
static HEADER_INFO_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector("div:nth-child(3) > table > tbody > tr > td:nth-child(2)"));
static SCORE_CELL_SEL: LazyLock<Selector> = LazyLock::new(|| selector("td.score"));

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Extract every recap section of a results page as an owned HTML fragment.
pub fn split_sections(page_html: &str) -> Vec<String> {
    let doc = Html::parse_document(page_html);
    doc.select(&SECTION_SEL).map(|el| el.html()).collect()
}

/// Parse every recap section on a results page.
///
/// A page without any recap section yields an empty list.
#[instrument(skip_all, fields(page_len = page_html.len()))]
pub fn parse_page(page_html: &str) -> Result<Vec<ParsedRecap>> {
    parse_sections(&split_sections(page_html))
}

/// Parse a batch of recap fragments.
///
/// Fragments that fail are skipped with a warning as long as one succeeds.
/// When every fragment fails, the first error is returned.
pub fn parse_sections(sections: &[String]) -> Result<Vec<ParsedRecap>> {
    let mut recaps = Vec::with_capacity(sections.len());
    let mut first_error = None;

    for (index, section) in sections.iter().enumerate() {
        match parse_fragment(section) {
            Ok(recap) => recaps.push(recap),
            Err(e) => {
                warn!(section = index, error = %e, "skipping unparsable recap section");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if recaps.is_empty() => Err(e),
        _ => {
            debug!(sections = sections.len(), parsed = recaps.len(), "sections parsed");
            Ok(recaps)
        }
    }
}

/// Parse one recap section into a [`ParsedRecap`].
///
/// Fails with a structure error when the division cell, the score table, or
/// the caption header is missing, or when a participant row's caption count
/// disagrees with the header.
pub fn parse_fragment(fragment: &str) -> Result<ParsedRecap> {
    let doc = Html::parse_fragment(fragment);

    let division = doc
        .select(&DIVISION_SEL)
        .next()
        .map(cell_text)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| RecapSyncError::structure("missing division cell"))?;

    let table = doc
        .select(&SCORE_TABLE_SEL)
        .next()
        .ok_or_else(|| RecapSyncError::structure(format!("{division}: missing score table")))?;

    let mut table_rows = child_elements(table, "tr");
    let header = table_rows
        .next()
        .ok_or_else(|| RecapSyncError::structure(format!("{division}: empty score table")))?;
    let caption_labels = caption_labels(header)
        .map_err(|e| RecapSyncError::structure(format!("{division}: {e}")))?;

    let mut rows = Vec::new();
    for tr in table_rows.filter(|tr| is_participant_row(*tr)) {
        let row = parse_row(tr).map_err(|e| RecapSyncError::structure(format!("{division}: {e}")))?;
        if row.captions.len() != caption_labels.len() {
            return Err(RecapSyncError::structure(format!(
                "{division}: row {:?} has {} caption scores, header has {}",
                row.name,
                row.captions.len(),
                caption_labels.len()
            )));
        }
        rows.push(row);
    }

    let (location, date) = header_info(&doc);

    Ok(ParsedRecap {
        division,
        caption_labels,
        rows,
        date,
        location,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Visible text of an element with whitespace collapsed.
fn cell_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Direct child elements with the given tag name.
fn child_elements<'a>(
    parent: ElementRef<'a>,
    tag: &'static str,
) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    parent
        .children()
        .filter_map(ElementRef::wrap)
        .filter(move |el| el.value().name() == tag)
}

fn has_class(el: ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

/// Caption labels from the header row, summary columns stripped.
fn caption_labels(header: ElementRef<'_>) -> std::result::Result<Vec<String>, String> {
    let mut labels: Vec<String> = child_elements(header, "td")
        .map(cell_text)
        .skip_while(|text| text.is_empty())
        .collect();

    if labels.len() < SUMMARY_COLUMNS {
        return Err(format!(
            "caption header has {} labels, expected at least {SUMMARY_COLUMNS}",
            labels.len()
        ));
    }
    labels.truncate(labels.len() - SUMMARY_COLUMNS);
    Ok(labels)
}

fn is_participant_row(tr: ElementRef<'_>) -> bool {
    child_elements(tr, "td").any(|td| has_class(td, "topBorder"))
}

/// Score text of a cell: its nested `td.score` when present, else its own text.
fn score_text(td: ElementRef<'_>) -> String {
    td.select(&SCORE_CELL_SEL)
        .next()
        .map(cell_text)
        .unwrap_or_else(|| cell_text(td))
}

fn parse_row(tr: ElementRef<'_>) -> std::result::Result<ParsedRow, String> {
    let cells: Vec<ElementRef<'_>> = child_elements(tr, "td").collect();
    if cells.len() < SUMMARY_COLUMNS {
        return Err(format!("participant row has only {} cells", cells.len()));
    }

    let name = cell_text(cells[0]);
    let captions = cells
        .iter()
        .filter(|td| has_class(**td, "subcaptionTotal"))
        .map(|td| score_text(*td))
        .collect();

    Ok(ParsedRow {
        name,
        captions,
        subtotal: score_text(cells[cells.len() - SUMMARY_COLUMNS]),
        total: score_text(cells[cells.len() - 1]),
    })
}

/// Location and date text from the recap header block, when present.
fn header_info(doc: &Html) -> (Option<String>, Option<String>) {
    let Some(info) = doc.select(&HEADER_INFO_SEL).next() else {
        return (None, None);
    };
    let lines: Vec<String> = child_elements(info, "div").map(cell_text).collect();
    let pick = |i: usize| lines.get(i).cloned().filter(|s| !s.is_empty());
    (pick(1), pick(2))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
