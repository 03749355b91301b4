use crate::models::Reading;
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS readings (
    city        VARCHAR NOT NULL,
    aqi         VARCHAR NOT NULL,
    contaminant VARCHAR NOT NULL,
    -- YYYY-MM-DD, as printed by the source
    date        VARCHAR NOT NULL,
    level       VARCHAR NOT NULL,
    PRIMARY KEY (city, aqi, contaminant, date, level)
);

CREATE SEQUENCE IF NOT EXISTS ingest_run_id START 1;

CREATE TABLE IF NOT EXISTS ingest_runs (
    id                  BIGINT PRIMARY KEY,
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    days_total          BIGINT DEFAULT 0,
    days_failed         BIGINT DEFAULT 0,
    readings_inserted   BIGINT DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_readings_date ON readings (date);
"#;

// ── Store capability ──────────────────────────────────────────────────────────

/// What the ingestion and audit passes need from persistence.
///
/// Both calls may be made concurrently from many workers.
pub trait ReadingStore: Send + Sync {
    /// Number of stored readings whose `date` equals `date`.
    fn count_by_date(&self, date: &str) -> Result<u64>;

    /// Store `reading` unless an identical one exists. Returns `true` if it
    /// was inserted. The check and the write are one atomic step.
    fn insert_if_absent(&self, reading: &Reading) -> Result<bool>;
}

// ── Repository ────────────────────────────────────────────────────────────────

/// Store-wide numbers for the `stats` command.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub readings: i64,
    pub days: i64,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
}

pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("DuckDB connection mutex poisoned"))
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.conn()?;
        conn.execute_batch(DDL).context("DDL failed")?;
        conn.execute_batch(INDEXES).context("Index creation failed")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Readings ──────────────────────────────────────────────────────────────

    /// Every stored reading for one day, ordered by city.
    pub fn readings_for_date(&self, date: &str) -> Result<Vec<Reading>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT city, aqi, contaminant, date, level FROM readings WHERE date = ? ORDER BY city, aqi, level",
        )?;
        let rows = stmt
            .query_map(params![date], |r| {
                Ok(Reading {
                    city: r.get(0)?,
                    aqi: r.get(1)?,
                    contaminant: r.get(2)?,
                    date: r.get(3)?,
                    level: r.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("read readings for {}", date))?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let mut s = conn.prepare(
            "SELECT COUNT(*), COUNT(DISTINCT date), MIN(date), MAX(date) FROM readings",
        )?;
        Ok(s.query_row([], |r| {
            Ok(StoreStats {
                readings: r.get(0)?,
                days: r.get(1)?,
                first_date: r.get(2)?,
                last_date: r.get(3)?,
            })
        })?)
    }

    // ── Ingest run log ────────────────────────────────────────────────────────

    pub fn begin_ingest_run(&self) -> Result<i64> {
        let conn = self.conn()?;
        let id: i64 = conn.query_row("SELECT nextval('ingest_run_id')", [], |r| r.get(0))?;
        conn.execute(
            "INSERT INTO ingest_runs (id, started_at, status) VALUES (?, ?, 'running')",
            params![id, Utc::now().naive_utc()],
        )?;
        Ok(id)
    }

    pub fn finish_ingest_run(
        &self,
        run_id: i64,
        days: usize,
        failed: usize,
        inserted: u64,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn()?.execute(
            r#"UPDATE ingest_runs SET
               finished_at = ?, status = ?,
               days_total = ?, days_failed = ?, readings_inserted = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                days as i64, failed as i64, inserted as i64, error, run_id,
            ],
        )?;
        Ok(())
    }

    /// Start time and status of the most recent ingest run.
    pub fn last_ingest_run(&self) -> Result<Option<(NaiveDateTime, String)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT started_at, status FROM ingest_runs ORDER BY id DESC LIMIT 1")?;
        let mut rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.next().transpose()?)
    }
}

impl ReadingStore for Repository {
    fn count_by_date(&self, date: &str) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM readings WHERE date = ?",
                params![date],
                |r| r.get(0),
            )
            .with_context(|| format!("count readings for {}", date))?;
        Ok(n as u64)
    }

    fn insert_if_absent(&self, reading: &Reading) -> Result<bool> {
        // The connection lock spans the check and the write.
        let conn = self.conn()?;
        let exists: i64 = conn.query_row(
            r#"SELECT COUNT(*) FROM readings
               WHERE city = ? AND aqi = ? AND contaminant = ? AND date = ? AND level = ?"#,
            params![reading.city, reading.aqi, reading.contaminant, reading.date, reading.level],
            |r| r.get(0),
        )?;
        if exists > 0 {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO readings (city, aqi, contaminant, date, level) VALUES (?, ?, ?, ?, ?)",
            params![reading.city, reading.aqi, reading.contaminant, reading.date, reading.level],
        )
        .with_context(|| format!("insert reading {}", reading))?;
        Ok(true)
    }
}
