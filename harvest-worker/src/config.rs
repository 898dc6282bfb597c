use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use harvest_common::logging::{LogFormat, ParseLogFormatError};
use harvest_common::ratelimit::RateLimit;
use harvest_queue::{JobKind, PoolConfig};

use crate::runtime::WorkerSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3305")]
    pub port: u16,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "LOG_FORMAT", default = "pretty")]
    pub log_format: String,

    #[envconfig(from = "WORKER_NAME", default = "harvest-worker")]
    pub worker_name: String,

    /// `worker` consumes the scrape queue; `create-jobs` enqueues one
    /// scrape job per configured app and exits.
    #[envconfig(from = "SCRAPER_MODE", default = "worker")]
    pub scraper_mode: String,

    /// `worker` consumes the label queue; `process-unlabeled` runs one
    /// catch-up pass and exits; `disabled` skips labeling entirely.
    #[envconfig(from = "LABELER_MODE", default = "worker")]
    pub labeler_mode: String,

    /// Comma-separated app ids, used by `create-jobs` mode.
    #[envconfig(from = "APP_IDS", default = "")]
    pub app_ids: String,

    /// Comma-separated country codes, used by `create-jobs` mode.
    #[envconfig(from = "SCRAPE_COUNTRIES", default = "us")]
    pub scrape_countries: String,

    #[envconfig(from = "SCRAPE_CONCURRENCY")]
    pub scrape_concurrency: Option<usize>,

    #[envconfig(from = "SCRAPE_RATE_LIMIT_MAX", default = "10")]
    pub scrape_rate_limit_max: u32,

    #[envconfig(from = "SCRAPE_RATE_LIMIT_WINDOW_SECS", default = "60")]
    pub scrape_rate_limit_window_secs: u64,

    #[envconfig(from = "LABEL_CONCURRENCY")]
    pub label_concurrency: Option<usize>,

    #[envconfig(from = "LABEL_RATE_LIMIT_MAX", default = "5")]
    pub label_rate_limit_max: u32,

    #[envconfig(from = "LABEL_RATE_LIMIT_WINDOW_SECS", default = "60")]
    pub label_rate_limit_window_secs: u64,

    #[envconfig(from = "POLL_INTERVAL_MS", default = "1000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "VISIBILITY_TIMEOUT_SECS", default = "300")]
    pub visibility_timeout_secs: u64,

    #[envconfig(from = "SHUTDOWN_GRACE_SECS", default = "30")]
    pub shutdown_grace_secs: u64,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: u64,

    #[envconfig(from = "MONITOR_INTERVAL_SECS", default = "30")]
    pub monitor_interval_secs: u64,

    #[envconfig(from = "CATALOG_BASE_URL", default = "https://itunes.apple.com")]
    pub catalog_base_url: String,

    #[envconfig(from = "CATALOG_TIMEOUT_MS", default = "30000")]
    pub catalog_timeout: EnvMsDuration,

    #[envconfig(from = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    #[envconfig(from = "OPENAI_API_BASE", default = "https://api.openai.com/v1")]
    pub openai_api_base: String,

    #[envconfig(from = "LLM_TIMEOUT_MS", default = "120000")]
    pub llm_timeout: EnvMsDuration,

    #[envconfig(from = "LABEL_SLEEP_MS", default = "1000")]
    pub label_sleep: EnvMsDuration,

    #[envconfig(from = "PROCESS_UNLABELED_LIMIT", default = "200")]
    pub process_unlabeled_limit: i64,

    #[envconfig(from = "DB_MAX_CONNECTIONS", default = "20")]
    pub db_max_connections: u32,

    #[envconfig(from = "DB_MIN_CONNECTIONS", default = "2")]
    pub db_min_connections: u32,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log_format(&self) -> Result<LogFormat, ParseLogFormatError> {
        self.log_format.parse()
    }

    pub fn is_development(&self) -> bool {
        self.environment != "production"
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            db_url: self.database_url.clone(),
            max_connections: Some(self.db_max_connections),
            min_connections: Some(self.db_min_connections),
            acquire_timeout_seconds: None,
            idle_timeout_seconds: Some(30),
            statement_timeout_seconds: Some(60),
        }
    }

    pub fn scrape_settings(&self) -> WorkerSettings {
        WorkerSettings {
            kind: JobKind::Scrape,
            concurrency: self
                .scrape_concurrency
                .unwrap_or(if self.is_development() { 1 } else { 3 }),
            rate_limit: RateLimit {
                max_tokens: self.scrape_rate_limit_max,
                window: Duration::from_secs(self.scrape_rate_limit_window_secs),
            },
            poll_interval: self.poll_interval.0,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn label_settings(&self) -> WorkerSettings {
        WorkerSettings {
            kind: JobKind::Label,
            concurrency: self
                .label_concurrency
                .unwrap_or(if self.is_development() { 1 } else { 2 }),
            rate_limit: RateLimit {
                max_tokens: self.label_rate_limit_max,
                window: Duration::from_secs(self.label_rate_limit_window_secs),
            },
            poll_interval: self.poll_interval.0,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    /// Settings for the stubbed kinds: single slot, generous rate budget.
    pub fn stub_settings(&self, kind: JobKind) -> WorkerSettings {
        WorkerSettings {
            kind,
            concurrency: 1,
            rate_limit: RateLimit {
                max_tokens: 60,
                window: Duration::from_secs(60),
            },
            poll_interval: self.poll_interval.0,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn app_id_list(&self) -> Vec<String> {
        split_csv(&self.app_ids)
    }

    pub fn country_list(&self) -> Vec<String> {
        split_csv(&self.scrape_countries)
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a duration in whole milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}
