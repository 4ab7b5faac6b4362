use anyhow::Context;

use crate::weeks::LOG_JITTER_WINDOW;

#[derive(Debug, Clone)]
pub struct Config {
    /// Tolerance (seconds) for out-of-order log delivery; decides when a
    /// week's raw data counts as complete.
    pub jitter_window_secs: i64,
    /// SQLite connection pool size.
    pub db_max_connections: u32,
}

impl Config {
    const fn default_db_max_connections() -> u32 {
        5
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let jitter_window_secs = match std::env::var("COUNTME_JITTER_WINDOW") {
            Ok(value) => value
                .parse::<i64>()
                .context("COUNTME_JITTER_WINDOW must be a number of seconds")?,
            Err(_) => LOG_JITTER_WINDOW,
        };

        let db_max_connections = std::env::var("COUNTME_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or_else(Self::default_db_max_connections);

        Ok(Config {
            jitter_window_secs,
            db_max_connections,
        })
    }
}
