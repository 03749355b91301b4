//! Ingestion: source → parser → store, one calendar day per unit of work.
//!
//! ## Per day (`DayIngestor::ingest_day`)
//!   1. Fetch page 1 and read the totals. No data upstream → `SkippedEmpty`.
//!   2. Stored count already equals the upstream total → `SkippedComplete`.
//!   3. Otherwise walk pages `1..=total_pages` in order and insert-if-absent
//!      every row. The first failing page ends the day as `Failed`; rows from
//!      earlier pages stay stored.
//!   A retry re-walks the whole day. Row-level dedup makes the already stored
//!   rows no-ops, so there is no per-page progress record.
//!
//! ## Across days (`Pipeline::run`)
//!   Days are spawned onto Tokio, at most `concurrency` in flight. A failed or
//!   panicked day is counted and never touches its siblings.

pub mod reconcile;

use crate::models::PageMeta;
use crate::scraper::parsers::{parse_meta, parse_rows, ParseError};
use crate::scraper::{FetchError, RawPage, ReportSource};
use crate::storage::ReadingStore;
use crate::utils::DateRange;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DayError {
    #[error("page {page}: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("page {page}: {source}")]
    Parse {
        page: u32,
        #[source]
        source: ParseError,
    },
    #[error("store: {0}")]
    Store(String),
}

impl From<anyhow::Error> for DayError {
    fn from(e: anyhow::Error) -> Self {
        DayError::Store(format!("{:#}", e))
    }
}

#[derive(Debug)]
pub enum DayOutcome {
    /// The source has no readings for the day.
    SkippedEmpty,
    /// Store already holds as many rows as the source reports.
    SkippedComplete,
    Ingested { inserted: u64, duplicates: u64 },
    Failed(DayError),
}

// ── Day ingestor ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DayIngestor {
    source: Arc<dyn ReportSource>,
    store: Arc<dyn ReadingStore>,
}

impl DayIngestor {
    pub fn new(source: Arc<dyn ReportSource>, store: Arc<dyn ReadingStore>) -> Self {
        Self { source, store }
    }

    pub async fn ingest_day(&self, date: &str) -> DayOutcome {
        match self.try_ingest_day(date).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Date [{}] failed: {}", date, e);
                DayOutcome::Failed(e)
            }
        }
    }

    async fn try_ingest_day(&self, date: &str) -> Result<DayOutcome, DayError> {
        let first = self.fetch(date, 1).await?;
        let meta = parse_meta(&first.body).map_err(|source| DayError::Parse { page: 1, source })?;

        if meta.is_empty() {
            info!("Date [{}] has no data", date);
            return Ok(DayOutcome::SkippedEmpty);
        }

        let stored = self.store.count_by_date(date)?;
        if stored == meta.total_records {
            info!("Date [{}] already complete ({} readings), skipping", date, stored);
            return Ok(DayOutcome::SkippedComplete);
        }

        debug!(
            "Date [{}]: {} stored, {} upstream over {} pages",
            date, stored, meta.total_records, meta.total_pages
        );
        self.ingest_pages(date, meta, first).await
    }

    async fn ingest_pages(
        &self,
        date: &str,
        meta: PageMeta,
        first: RawPage,
    ) -> Result<DayOutcome, DayError> {
        let mut first = Some(first);
        let mut inserted = 0u64;
        let mut duplicates = 0u64;

        for page in 1..=meta.total_pages {
            info!("Fetching date [{}] page {}/{}", date, page, meta.total_pages);
            // Page 1 was already fetched for the totals.
            let raw = match first.take() {
                Some(raw) => raw,
                None => self.fetch(date, page).await?,
            };
            let readings =
                parse_rows(&raw.body).map_err(|source| DayError::Parse { page, source })?;

            for reading in &readings {
                if self.store.insert_if_absent(reading)? {
                    debug!("Stored reading [{}]", reading);
                    inserted += 1;
                } else {
                    debug!("Duplicate reading [{}] ignored", reading);
                    duplicates += 1;
                }
            }
        }

        Ok(DayOutcome::Ingested { inserted, duplicates })
    }

    async fn fetch(&self, date: &str, page: u32) -> Result<RawPage, DayError> {
        let raw = self
            .source
            .fetch(date, page)
            .await
            .map_err(|source| DayError::Fetch { page, source })?;
        debug!("Date [{}] page {}: HTTP {}, {} bytes", date, page, raw.status, raw.body.len());
        Ok(raw)
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

pub struct Pipeline {
    ingestor: DayIngestor,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn ReportSource>,
        store: Arc<dyn ReadingStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            ingestor: DayIngestor::new(source, store),
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(&self, range: DateRange) -> IngestStats {
        info!(
            "=== Ingesting {} days with {} workers ===",
            range.len(),
            self.concurrency
        );

        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(range.len());

        for date in range.keys() {
            let ingestor = self.ingestor.clone();
            let sem = Arc::clone(&sem);
            let task_date = date.clone();

            let handle = tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = sem.acquire_owned().await.ok();
                ingestor.ingest_day(&task_date).await
            });
            handles.push((date, handle));
        }

        let mut stats = IngestStats::default();
        for (date, handle) in handles {
            stats.days += 1;
            match handle.await {
                Ok(outcome) => stats.record(&date, outcome),
                Err(e) => {
                    error!("Task panic for {}: {}", date, e);
                    stats.failed_dates.push((date, format!("task panicked: {}", e)));
                }
            }
        }

        info!(
            "=== Done: {} days | {} ingested | {} empty | {} complete | {} failed | {} new readings | {} duplicates ===",
            stats.days,
            stats.ingested,
            stats.skipped_empty,
            stats.skipped_complete,
            stats.failed(),
            stats.readings_inserted,
            stats.duplicates_ignored,
        );
        stats
    }
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub days: usize,
    pub ingested: usize,
    pub skipped_empty: usize,
    pub skipped_complete: usize,
    pub readings_inserted: u64,
    pub duplicates_ignored: u64,
    pub failed_dates: Vec<(String, String)>,
}

impl IngestStats {
    pub fn failed(&self) -> usize {
        self.failed_dates.len()
    }

    fn record(&mut self, date: &str, outcome: DayOutcome) {
        match outcome {
            DayOutcome::SkippedEmpty => self.skipped_empty += 1,
            DayOutcome::SkippedComplete => self.skipped_complete += 1,
            DayOutcome::Ingested { inserted, duplicates } => {
                self.ingested += 1;
                self.readings_inserted += inserted;
                self.duplicates_ignored += duplicates;
            }
            DayOutcome::Failed(e) => self.failed_dates.push((date.to_string(), e.to_string())),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
