use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The source bans origins that poll faster than this.
pub const MIN_REQUEST_DELAY_MS: u64 = 1000;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Report source configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_origin")]
    pub origin: String,

    #[serde(default = "default_referer")]
    pub referer: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    /// Report identifier the source expects in every form post.
    #[serde(default = "default_xmlname")]
    pub xmlname: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// First day the `ingest` command downloads.
    #[serde(default = "default_ingest_start")]
    pub ingest_start: NaiveDate,

    /// First day the `audit` command checks.
    #[serde(default = "default_audit_start")]
    pub audit_start: NaiveDate,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_endpoint() -> String {
    "http://datacenter.mep.gov.cn/websjzx/report/list.vm".to_string()
}
fn default_origin() -> String {
    "http://datacenter.mep.gov.cn".to_string()
}
fn default_referer() -> String {
    "http://datacenter.mep.gov.cn/websjzx/report/list.vm".to_string()
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/57.0.2987.98 Safari/537.36".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    MIN_REQUEST_DELAY_MS
}
fn default_xmlname() -> String {
    "1512478367400".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/aqi.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    10
}
fn default_ingest_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 8, 1).unwrap_or_default()
}
fn default_audit_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2014, 1, 1).unwrap_or_default()
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            origin: default_origin(),
            referer: default_referer(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            xmlname: default_xmlname(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            ingest_start: default_ingest_start(),
            audit_start: default_audit_start(),
        }
    }
}

impl ScraperConfig {
    /// Configured delay, never below the source's ban threshold.
    pub fn effective_delay_ms(&self) -> u64 {
        self.request_delay_ms.max(MIN_REQUEST_DELAY_MS)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("AQI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?;

        cfg.try_deserialize()
            .context("Invalid configuration")
    }
}
