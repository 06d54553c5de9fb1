use anyhow::{Context, Result, anyhow};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::aggregate::AggregateOptions;
use crate::bucket::{DEFAULT_WINDOW_DAYS, MAX_WINDOW_DAYS};
use crate::db::Database;
use crate::rank::DEFAULT_TOP_JOBS;
use crate::reader::ReadLimits;

#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite file backing the entity readers.
    pub db_path: PathBuf,
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Length of the trend window ending at "now".
    pub window_days: i64,
    /// How many jobs the performance ranking exposes.
    pub top_jobs: usize,
    /// Rows fetched per reader call.
    pub page_size: usize,
    /// Ceiling on jobs + applications + views loaded for one report.
    pub max_records: usize,
    /// Budget for the whole read phase of one report.
    pub read_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: Database::default_path(),
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            window_days: DEFAULT_WINDOW_DAYS,
            top_jobs: DEFAULT_TOP_JOBS,
            page_size: 500,
            max_records: 200_000,
            read_timeout: Duration::from_secs(10),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        None => Ok(None),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `FUNNEL_*` variables as resolved by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(path) = lookup("FUNNEL_DB") {
            settings.db_path = PathBuf::from(path);
        }
        if let Some(listen) = parse_var(&lookup, "FUNNEL_LISTEN")? {
            settings.listen = listen;
        }
        if let Some(days) = parse_var(&lookup, "FUNNEL_WINDOW_DAYS")? {
            settings.window_days = days;
        }
        if let Some(top) = parse_var(&lookup, "FUNNEL_TOP_JOBS")? {
            settings.top_jobs = top;
        }
        if let Some(size) = parse_var(&lookup, "FUNNEL_PAGE_SIZE")? {
            settings.page_size = size;
        }
        if let Some(max) = parse_var(&lookup, "FUNNEL_MAX_RECORDS")? {
            settings.max_records = max;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FUNNEL_READ_TIMEOUT_SECS")? {
            settings.read_timeout = Duration::from_secs(secs);
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_WINDOW_DAYS).contains(&self.window_days) {
            return Err(anyhow!(
                "window_days must be between 1 and {}, got {}",
                MAX_WINDOW_DAYS,
                self.window_days
            ));
        }
        if self.top_jobs == 0 {
            return Err(anyhow!("top_jobs must be at least 1"));
        }
        if self.page_size == 0 {
            return Err(anyhow!("page_size must be at least 1"));
        }
        if self.read_timeout.is_zero() {
            return Err(anyhow!("read_timeout must be non-zero"));
        }
        Ok(())
    }

    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            window_days: self.window_days,
            top_jobs: self.top_jobs,
        }
    }

    pub fn read_limits(&self) -> ReadLimits {
        ReadLimits {
            page_size: self.page_size,
            max_records: self.max_records,
        }
    }
}
