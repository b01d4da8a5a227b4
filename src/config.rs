//! Environment-driven configuration.
//!
//! `.env` is loaded by [`AppConfig::from_env`]; the parsing itself goes through
//! a lookup closure so it can be exercised with a plain `HashMap`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{CrawlerError, Result};

/// Knobs the scan orchestrator reads on every run.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Attempts per sample point, including the first one.
    pub max_attempts: u32,
    pub point_delay_min: Duration,
    pub point_delay_max: Duration,
    /// Rank charged to a point where the target was not found, when averaging.
    pub missing_rank_penalty: f64,
    /// Minimum |avg rank delta| between consecutive scans that raises an alert.
    pub rank_alert_threshold: f64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            point_delay_min: Duration::from_millis(2000),
            point_delay_max: Duration::from_millis(5000),
            missing_rank_penalty: 21.0,
            rank_alert_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub search_base_url: String,
    pub headless: bool,
    pub navigation_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            search_base_url: "https://www.google.com/maps/search/".to_string(),
            headless: true,
            navigation_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub validation_concurrency: usize,
    pub probe_timeout: Duration,
    pub probe_url: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            validation_concurrency: 20,
            probe_timeout: Duration::from_secs(10),
            probe_url: "https://www.google.com/generate_204".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub queue_key: String,
    pub bind_addr: SocketAddr,
    pub geocoder_url: String,
    pub scheduler_cron: String,
    pub scan: ScanSettings,
    pub browser: BrowserSettings,
    pub proxy: ProxySettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let or_default = |var: &str, default: &str| -> String {
            lookup(var).unwrap_or_else(|| default.to_string())
        };

        fn parsed<T: std::str::FromStr>(var: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim().parse::<T>().map_err(|e| CrawlerError::InvalidEnvVar {
                var: var.to_string(),
                reason: e.to_string(),
            })
        }

        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| CrawlerError::MissingEnvVar("DATABASE_URL".into()))?;

        let scan = ScanSettings {
            max_attempts: parsed("SCAN_MAX_ATTEMPTS", or_default("SCAN_MAX_ATTEMPTS", "3"))?,
            point_delay_min: Duration::from_millis(parsed(
                "POINT_DELAY_MIN_MS",
                or_default("POINT_DELAY_MIN_MS", "2000"),
            )?),
            point_delay_max: Duration::from_millis(parsed(
                "POINT_DELAY_MAX_MS",
                or_default("POINT_DELAY_MAX_MS", "5000"),
            )?),
            missing_rank_penalty: parsed(
                "MISSING_RANK_PENALTY",
                or_default("MISSING_RANK_PENALTY", "21"),
            )?,
            rank_alert_threshold: parsed(
                "RANK_ALERT_THRESHOLD",
                or_default("RANK_ALERT_THRESHOLD", "0.5"),
            )?,
        };

        if scan.max_attempts == 0 {
            return Err(CrawlerError::InvalidEnvVar {
                var: "SCAN_MAX_ATTEMPTS".into(),
                reason: "must be at least 1".into(),
            });
        }
        if scan.point_delay_min > scan.point_delay_max {
            return Err(CrawlerError::InvalidEnvVar {
                var: "POINT_DELAY_MIN_MS".into(),
                reason: "must not exceed POINT_DELAY_MAX_MS".into(),
            });
        }

        let browser = BrowserSettings {
            search_base_url: or_default("SEARCH_BASE_URL", "https://www.google.com/maps/search/"),
            headless: parsed("CHROME_HEADLESS", or_default("CHROME_HEADLESS", "true"))?,
            navigation_timeout: Duration::from_secs(parsed(
                "NAVIGATION_TIMEOUT_SECS",
                or_default("NAVIGATION_TIMEOUT_SECS", "45"),
            )?),
        };

        let proxy = ProxySettings {
            validation_concurrency: parsed(
                "PROXY_VALIDATION_CONCURRENCY",
                or_default("PROXY_VALIDATION_CONCURRENCY", "20"),
            )?,
            probe_timeout: Duration::from_secs(parsed(
                "PROXY_PROBE_TIMEOUT_SECS",
                or_default("PROXY_PROBE_TIMEOUT_SECS", "10"),
            )?),
            probe_url: or_default("PROXY_PROBE_URL", "https://www.google.com/generate_204"),
        };

        Ok(Self {
            database_url,
            redis_url: or_default("REDIS_URL", "redis://127.0.0.1:6379"),
            queue_key: or_default("QUEUE_KEY", "geo_rank:scan_queue"),
            bind_addr: parsed("BIND_ADDR", or_default("BIND_ADDR", "0.0.0.0:3000"))?,
            geocoder_url: or_default("GEOCODER_URL", "https://nominatim.openstreetmap.org"),
            scheduler_cron: or_default("SCHEDULER_CRON", "0 */5 * * * *"),
            scan,
            browser,
            proxy,
        })
    }
}
