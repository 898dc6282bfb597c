use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

/// Connection pool settings, passable across component boundaries. The
/// single pool constructed from this is shared by every worker task in the
/// process.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,          // Default 20
    pub min_connections: Option<u32>,          // Default 2
    pub acquire_timeout_seconds: Option<u64>,  // Default 10
    pub idle_timeout_seconds: Option<u64>,     // Default 30
    pub statement_timeout_seconds: Option<u64>, // Default 60
}

impl PoolConfig {
    pub fn new(db_url: &str) -> Self {
        Self {
            db_url: db_url.to_owned(),
            max_connections: None,
            min_connections: None,
            acquire_timeout_seconds: None,
            idle_timeout_seconds: None,
            statement_timeout_seconds: None,
        }
    }

    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        let statement_timeout =
            format!("{}s", self.statement_timeout_seconds.unwrap_or(60));
        let options = PgConnectOptions::from_str(&self.db_url)?
            .options([("statement_timeout", statement_timeout.as_str())]);

        PgPoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(20))
            .min_connections(self.min_connections.unwrap_or(2))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(10),
            ))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds.unwrap_or(30)))
            .connect_with(options)
            .await
    }
}
