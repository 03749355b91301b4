//! Completeness audit: compare stored counts against the source's totals.
//!
//! Read-only. Days are checked one after another; a day whose first page
//! cannot be fetched or parsed is reported as unverified and the pass moves on.

use super::DayError;
use crate::models::ProblemDate;
use crate::scraper::parsers::parse_meta;
use crate::scraper::ReportSource;
use crate::storage::ReadingStore;
use crate::utils::DateRange;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize)]
pub struct AuditReport {
    pub checked: usize,
    pub problems: Vec<ProblemDate>,
    /// Days the audit could not decide, with the reason.
    pub unverified: Vec<(String, String)>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty() && self.unverified.is_empty()
    }
}

pub struct Reconciler {
    source: Arc<dyn ReportSource>,
    store: Arc<dyn ReadingStore>,
}

impl Reconciler {
    pub fn new(source: Arc<dyn ReportSource>, store: Arc<dyn ReadingStore>) -> Self {
        Self { source, store }
    }

    pub async fn run(&self, range: DateRange) -> AuditReport {
        info!("=== Auditing {} days ===", range.len());
        let mut report = AuditReport::default();

        for date in range.keys() {
            report.checked += 1;
            match self.check_day(&date).await {
                Ok(None) => {}
                Ok(Some(problem)) => report.problems.push(problem),
                Err(e) => {
                    warn!("Date [{}] could not be verified: {}", date, e);
                    report.unverified.push((date, e.to_string()));
                }
            }
        }

        info!(
            "=== Audit done: {} days | {} problems | {} unverified ===",
            report.checked,
            report.problems.len(),
            report.unverified.len()
        );
        report
    }

    /// `Some` when the stored count differs from the upstream total.
    pub async fn check_day(&self, date: &str) -> Result<Option<ProblemDate>, DayError> {
        let page = self
            .source
            .fetch(date, 1)
            .await
            .map_err(|source| DayError::Fetch { page: 1, source })?;
        let meta = parse_meta(&page.body).map_err(|source| DayError::Parse { page: 1, source })?;
        let found = self.store.count_by_date(date)?;

        if found == meta.total_records {
            debug!("Date [{}] ok: {} readings", date, found);
            return Ok(None);
        }

        warn!(
            "Date [{}] has problem: expected {}, found {}",
            date, meta.total_records, found
        );
        Ok(Some(ProblemDate {
            date: date.to_string(),
            expected: meta.total_records,
            found,
        }))
    }
}
