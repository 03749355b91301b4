use serde::{Deserialize, Serialize};
use std::fmt;

// ── Reading ───────────────────────────────────────────────────────────────────

/// One city's daily air-quality record as published by the source.
///
/// All five fields together form the identity; there is no surrogate key.
/// Values are kept exactly as the source printed them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Reading {
    pub city: String,
    pub aqi: String,            // may be a placeholder such as "—"
    pub contaminant: String,    // empty on clean-air days
    pub date: String,           // YYYY-MM-DD
    pub level: String,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} aqi={} contaminant={:?} level={}",
            self.date, self.city, self.aqi, self.contaminant, self.level
        )
    }
}

// ── Day summary ───────────────────────────────────────────────────────────────

/// Totals the source reports on the first page of a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PageMeta {
    pub total_records: u64,
    pub total_pages: u32,
}

impl PageMeta {
    pub fn is_empty(&self) -> bool {
        self.total_records == 0
    }
}

// ── Audit findings ────────────────────────────────────────────────────────────

/// A day whose stored row count disagrees with the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProblemDate {
    pub date: String,
    pub expected: u64,
    pub found: u64,
}
