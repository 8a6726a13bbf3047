//! Deployment settings.
//! Settings come from an optional JSON file and are then overridden by `IDR_*` environment
//! variables. Every field has a default so an empty file (or no file) is a valid configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Where the pipeline runs. Only changes planner hints and the checkpoint backend,
/// never which rows are selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Local,
    Synthetic,
    Production,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Local => "local",
            LoadMode::Synthetic => "synthetic",
            LoadMode::Production => "production",
        }
    }
}

impl FromStr for LoadMode {
    type Err = PipelineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(LoadMode::Local),
            "synthetic" | "synthea" => Ok(LoadMode::Synthetic),
            "production" | "prod" | "idr" | "" => Ok(LoadMode::Production),
            other => Err(PipelineError::config("bad_mode".to_string(), format!("unknown load mode '{}'", other))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "Settings::default_mode")]
    pub mode: LoadMode,
    /// libpq-style connection string for the source warehouse
    #[serde(default)]
    pub warehouse_dsn: String,
    /// libpq-style connection string for the target store (also holds idr.load_progress)
    #[serde(default)]
    pub target_dsn: String,
    /// Maximum rows per loaded batch. A trailing run of rows sharing one cursor key may extend it.
    #[serde(default = "Settings::default_batch_size")]
    pub batch_size: usize,
    /// Number of (table, partition) units processed concurrently
    #[serde(default = "Settings::default_workers")]
    pub workers: usize,
    #[serde(default = "Settings::default_pool_size")]
    pub warehouse_pool_size: usize,
    #[serde(default = "Settings::default_pool_size")]
    pub target_pool_size: usize,
    /// Bound on one warehouse round trip (query start or next batch)
    #[serde(default = "Settings::default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Bound on one target transaction including the checkpoint advance
    #[serde(default = "Settings::default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    #[serde(default = "Settings::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "Settings::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Only load claims flagged as the latest version (Part D is always loaded in full)
    #[serde(default)]
    pub latest_claims: bool,
    /// Lower bound on claim load date for claim-item extraction
    #[serde(default)]
    pub min_transaction_date: Option<NaiveDate>,
    #[serde(default = "Settings::default_death_cutoff_years")]
    pub death_cutoff_years: u32,
    #[serde(default = "Settings::default_pac_cutoff_days")]
    pub pac_cutoff_days: i64,
    /// Target tables to process; empty means every registered table
    #[serde(default)]
    pub tables: Vec<String>,
    /// Persist progress even outside production
    #[serde(default)]
    pub force_load_progress: bool,
}

impl Settings {
    fn default_mode() -> LoadMode { LoadMode::Production }
    fn default_batch_size() -> usize { 100_000 }
    fn default_workers() -> usize { 4 }
    fn default_pool_size() -> usize { 8 }
    fn default_fetch_timeout_secs() -> u64 { 3_600 }
    fn default_load_timeout_secs() -> u64 { 900 }
    fn default_max_attempts() -> u32 { 3 }
    fn default_retry_backoff_ms() -> u64 { 5_000 }
    fn default_death_cutoff_years() -> u32 { 4 }
    fn default_pac_cutoff_days() -> i64 { 60 }

    /// Read the optional JSON file, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> PipelineResult<Settings> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => Settings::default(),
        };
        settings.apply_env_with(|k| std::env::var(k).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> PipelineResult<Settings> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config("settings_read".to_string(), format!("{}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            PipelineError::config("settings_parse".to_string(), format!("{}: {}", path.display(), e))
        })
    }

    /// Apply `IDR_*` overrides using the supplied lookup (the process environment in production).
    pub fn apply_env_with<F>(&mut self, lookup: F) -> PipelineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("IDR_MODE") { self.mode = v.parse()?; }
        if let Some(v) = lookup("IDR_WAREHOUSE_DSN") { self.warehouse_dsn = v; }
        if let Some(v) = lookup("IDR_TARGET_DSN") { self.target_dsn = v; }
        if let Some(v) = parse_num::<usize, _>(&lookup, "IDR_BATCH_SIZE")? { self.batch_size = v; }
        if let Some(v) = parse_num::<usize, _>(&lookup, "IDR_WORKERS")? { self.workers = v; }
        if let Some(v) = parse_num::<usize, _>(&lookup, "IDR_WAREHOUSE_POOL_SIZE")? { self.warehouse_pool_size = v; }
        if let Some(v) = parse_num::<usize, _>(&lookup, "IDR_TARGET_POOL_SIZE")? { self.target_pool_size = v; }
        if let Some(v) = parse_num::<u64, _>(&lookup, "IDR_FETCH_TIMEOUT_SECS")? { self.fetch_timeout_secs = v; }
        if let Some(v) = parse_num::<u64, _>(&lookup, "IDR_LOAD_TIMEOUT_SECS")? { self.load_timeout_secs = v; }
        if let Some(v) = parse_num::<u32, _>(&lookup, "IDR_MAX_ATTEMPTS")? { self.max_attempts = v; }
        if let Some(v) = parse_num::<u64, _>(&lookup, "IDR_RETRY_BACKOFF_MS")? { self.retry_backoff_ms = v; }
        if let Some(v) = parse_bool(&lookup, "IDR_LATEST_CLAIMS") { self.latest_claims = v; }
        if let Some(v) = parse_num::<u32, _>(&lookup, "IDR_DEATH_CUTOFF_YEARS")? { self.death_cutoff_years = v; }
        if let Some(v) = parse_num::<i64, _>(&lookup, "IDR_PAC_CUTOFF_DAYS")? { self.pac_cutoff_days = v; }
        if let Some(v) = parse_bool(&lookup, "IDR_FORCE_LOAD_PROGRESS") { self.force_load_progress = v; }
        if let Some(v) = lookup("IDR_MIN_TRANSACTION_DATE") {
            let d = NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").map_err(|e| {
                PipelineError::config("bad_env".to_string(), format!("IDR_MIN_TRANSACTION_DATE='{}': {}", v, e))
            })?;
            self.min_transaction_date = Some(d);
        }
        if let Some(v) = lookup("IDR_TABLES") {
            self.tables = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::config("bad_setting", "batch_size must be positive"));
        }
        if self.workers == 0 {
            return Err(PipelineError::config("bad_setting", "workers must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::config("bad_setting", "max_attempts must be at least 1"));
        }
        if self.pac_cutoff_days < 0 {
            return Err(PipelineError::config("bad_setting", "pac_cutoff_days must not be negative"));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration { Duration::from_secs(self.fetch_timeout_secs) }
    pub fn load_timeout(&self) -> Duration { Duration::from_secs(self.load_timeout_secs) }
    pub fn retry_backoff(&self) -> Duration { Duration::from_millis(self.retry_backoff_ms) }

    /// Progress is only persisted in production unless forced.
    pub fn progress_enabled(&self) -> bool {
        self.mode == LoadMode::Production || self.force_load_progress
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            warehouse_dsn: String::new(),
            target_dsn: String::new(),
            batch_size: Self::default_batch_size(),
            workers: Self::default_workers(),
            warehouse_pool_size: Self::default_pool_size(),
            target_pool_size: Self::default_pool_size(),
            fetch_timeout_secs: Self::default_fetch_timeout_secs(),
            load_timeout_secs: Self::default_load_timeout_secs(),
            max_attempts: Self::default_max_attempts(),
            retry_backoff_ms: Self::default_retry_backoff_ms(),
            latest_claims: false,
            min_transaction_date: None,
            death_cutoff_years: Self::default_death_cutoff_years(),
            pac_cutoff_days: Self::default_pac_cutoff_days(),
            tables: Vec::new(),
            force_load_progress: false,
        }
    }
}

fn parse_bool<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str) -> Option<bool> {
    match lookup(name) {
        Some(v) => {
            let s = v.to_lowercase();
            match s.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        }
        None => None,
    }
}

fn parse_num<T: FromStr, F: Fn(&str) -> Option<String>>(lookup: &F, name: &str) -> PipelineResult<Option<T>> {
    match lookup(name) {
        Some(v) => v.trim().parse::<T>().map(Some).map_err(|_| {
            PipelineError::config("bad_env".to_string(), format!("{}='{}' is not a valid number", name, v))
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.death_cutoff_years, 4);
        assert_eq!(s.pac_cutoff_days, 60);
        assert!(s.progress_enabled());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"mode":"local","batch_size":500,"tables":["idr.beneficiary"]}}"#).unwrap();
        let mut s = Settings::from_file(f.path()).unwrap();
        assert_eq!(s.mode, LoadMode::Local);
        assert_eq!(s.batch_size, 500);
        assert!(!s.progress_enabled());

        s.apply_env_with(env(&[
            ("IDR_BATCH_SIZE", "250"),
            ("IDR_LATEST_CLAIMS", "yes"),
            ("IDR_MIN_TRANSACTION_DATE", "2024-01-02"),
            ("IDR_TABLES", "idr.claim_rx, idr.beneficiary_mbi_id,"),
            ("IDR_FORCE_LOAD_PROGRESS", "1"),
        ]))
        .unwrap();
        assert_eq!(s.batch_size, 250);
        assert!(s.latest_claims);
        assert_eq!(s.min_transaction_date, NaiveDate::from_ymd_opt(2024, 1, 2));
        assert_eq!(s.tables, vec!["idr.claim_rx".to_string(), "idr.beneficiary_mbi_id".to_string()]);
        assert!(s.progress_enabled());
    }

    #[test]
    fn bad_numbers_and_modes_are_configuration_errors() {
        let mut s = Settings::default();
        let err = s.apply_env_with(env(&[("IDR_WORKERS", "many")])).unwrap_err();
        assert_eq!(err.code_str(), "bad_env");
        let err = "warp".parse::<LoadMode>().unwrap_err();
        assert!(err.is_fatal_for_run());
        s.workers = 0;
        assert!(s.validate().is_err());
    }
}
