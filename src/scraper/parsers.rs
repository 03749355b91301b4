use crate::models::{PageMeta, Reading};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

// ── Markers ───────────────────────────────────────────────────────────────────

static NO_DATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<div class="report_page_null">\s*暂无数据"#).expect("no-data pattern")
});

static TOTALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)总记录数.*?(\d+).*?条.*?总页数.*?(\d+).*?</div>").expect("totals pattern")
});

static TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.report-table").expect("table selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("row selector"));

// Columns are addressed by the table's `colid` attribute, not by position.
const COL_CITY: &str = "3";
const COL_AQI: &str = "4";
const COL_CONTAMINANT: &str = "5";
const COL_DATE: &str = "6";
const COL_LEVEL: &str = "8";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Neither the no-data marker nor the totals marker is present.
    #[error("unrecognized page shape: no data/totals marker found")]
    UnrecognizedPageShape,
    #[error("report table not found")]
    MissingTable,
    #[error("totals marker holds an out-of-range number: {0}")]
    BadNumber(String),
}

/// A single row that could not be turned into a [`Reading`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("row {row}: missing column colid={colid}")]
pub struct RowError {
    pub row: usize,
    pub colid: &'static str,
}

// ── Page metadata ─────────────────────────────────────────────────────────────

/// Read `(total records, total pages)` off a first page.
///
/// The no-data marker yields an empty [`PageMeta`]; a page with neither marker
/// is an error, never an empty result.
pub fn parse_meta(body: &str) -> Result<PageMeta, ParseError> {
    if NO_DATA.is_match(body) {
        return Ok(PageMeta::default());
    }

    let caps = TOTALS
        .captures(body)
        .ok_or(ParseError::UnrecognizedPageShape)?;

    let total_records = caps[1]
        .parse()
        .map_err(|_| ParseError::BadNumber(caps[1].to_string()))?;
    let total_pages = caps[2]
        .parse()
        .map_err(|_| ParseError::BadNumber(caps[2].to_string()))?;

    Ok(PageMeta {
        total_records,
        total_pages,
    })
}

// ── Rows ──────────────────────────────────────────────────────────────────────

/// Extract every reading on one page.
///
/// The header row is skipped. A row missing any of the five columns is logged
/// and dropped; the rest of the page is still returned. A table with only a
/// header yields an empty vec.
pub fn parse_rows(body: &str) -> Result<Vec<Reading>, ParseError> {
    let doc = Html::parse_document(body);
    let table = doc.select(&TABLE).next().ok_or(ParseError::MissingTable)?;

    let mut readings = Vec::new();
    for (i, tr) in table.select(&ROW).enumerate().skip(1) {
        match extract_row(i, tr) {
            Ok(r) => readings.push(r),
            Err(e) => warn!("skipping malformed row: {}", e),
        }
    }
    Ok(readings)
}

fn extract_row(row: usize, tr: ElementRef<'_>) -> Result<Reading, RowError> {
    let cell = |colid: &'static str| cell_text(tr, colid).ok_or(RowError { row, colid });

    Ok(Reading {
        city: cell(COL_CITY)?,
        aqi: cell(COL_AQI)?,
        contaminant: cell(COL_CONTAMINANT)?,
        date: cell(COL_DATE)?,
        level: cell(COL_LEVEL)?,
    })
}

/// Verbatim text of the `td` carrying `colid`, if the row has one.
fn cell_text(tr: ElementRef<'_>, colid: &str) -> Option<String> {
    tr.children()
        .filter_map(ElementRef::wrap)
        .find(|td| td.value().name() == "td" && td.value().attr("colid") == Some(colid))
        .map(|td| td.text().collect())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
