//! Postgres pool setup.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use patchtag_core::{Error, Result};

/// Size and acquire timeout of the connection pool.
///
/// | Variable | Default |
/// |----------|---------|
/// | `PATCHTAG_DB_MAX_CONNECTIONS` | `10` |
/// | `PATCHTAG_DB_CONNECT_TIMEOUT_SECS` | `30` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var("PATCHTAG_DB_MAX_CONNECTIONS").ok().as_deref(),
            std::env::var("PATCHTAG_DB_CONNECT_TIMEOUT_SECS").ok().as_deref(),
        )
    }

    /// Unparseable values keep the default. The pool always allows one
    /// connection.
    fn from_values(max_connections: Option<&str>, timeout_secs: Option<&str>) -> Self {
        let defaults = Self::default();
        Self {
            max_connections: max_connections
                .and_then(|v| v.trim().parse::<u32>().ok())
                .map_or(defaults.max_connections, |n| n.max(1)),
            connect_timeout: timeout_secs
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(defaults.connect_timeout, Duration::from_secs),
        }
    }
}

/// Connect a pool to `database_url`.
pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool connected"
    );
    Ok(pool)
}
