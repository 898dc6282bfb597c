use std::time::Duration;

use envconfig::Envconfig;

use harvest_queue::{JanitorSettings, PoolConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3306")]
    pub port: u16,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "LOG_FORMAT", default = "pretty")]
    pub log_format: String,

    #[envconfig(from = "CLEANUP_INTERVAL_SECS", default = "150")]
    pub cleanup_interval_secs: u64,

    /// Should match the workers' visibility timeout.
    #[envconfig(from = "STALL_TIMEOUT_SECS", default = "300")]
    pub stall_timeout_secs: u64,

    #[envconfig(from = "MAX_TOUCHES", default = "3")]
    pub max_touches: i16,

    #[envconfig(from = "KEEP_COMPLETED", default = "50")]
    pub keep_completed: i64,

    #[envconfig(from = "KEEP_FAILED", default = "100")]
    pub keep_failed: i64,

    #[envconfig(from = "DEAD_LETTER_RETENTION_HOURS", default = "720")]
    pub dead_letter_retention_hours: u64,

    #[envconfig(from = "RUN_MIGRATIONS", default = "true")]
    pub run_migrations: bool,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            db_url: self.database_url.clone(),
            // The janitor runs a handful of statements per pass.
            max_connections: Some(4),
            min_connections: Some(1),
            acquire_timeout_seconds: None,
            idle_timeout_seconds: Some(30),
            statement_timeout_seconds: Some(60),
        }
    }

    pub fn janitor_settings(&self) -> JanitorSettings {
        JanitorSettings {
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            max_touches: self.max_touches,
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
            dead_letter_retention: Duration::from_secs(self.dead_letter_retention_hours * 3600),
        }
    }
}
