use envconfig::Envconfig;

use harvest_queue::PoolConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3307")]
    pub port: u16,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "LOG_FORMAT", default = "pretty")]
    pub log_format: String,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            db_url: self.database_url.clone(),
            max_connections: Some(10),
            min_connections: Some(1),
            acquire_timeout_seconds: None,
            idle_timeout_seconds: Some(30),
            statement_timeout_seconds: Some(60),
        }
    }
}
