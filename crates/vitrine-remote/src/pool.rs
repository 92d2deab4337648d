//! Connection pool sizing for the metadata store.
//!
//! A sync holds one connection per in-flight image listing and one per upload
//! worker creating a record, so the pool is derived from those two widths.
//! Operators can override the result from the environment.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use vitrine_core::defaults::{
    FETCH_CONCURRENCY, REMOTE_ACQUIRE_TIMEOUT_SECS, REMOTE_IDLE_TIMEOUT_SECS,
    REMOTE_POOL_MAX_CONNECTIONS, UPLOAD_WORKERS,
};
use vitrine_core::logging::SUBSYSTEM_REMOTE;
use vitrine_core::{Error, Result};

/// How the metadata store's connection pool is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemotePoolOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for RemotePoolOptions {
    fn default() -> Self {
        Self::for_concurrency(UPLOAD_WORKERS, FETCH_CONCURRENCY)
    }
}

impl RemotePoolOptions {
    /// One connection per upload worker plus one per concurrent listing,
    /// within `1..=REMOTE_POOL_MAX_CONNECTIONS`.
    pub fn for_concurrency(upload_workers: usize, fetch_concurrency: usize) -> Self {
        let wanted = upload_workers.saturating_add(fetch_concurrency);
        let max_connections = u32::try_from(wanted)
            .unwrap_or(u32::MAX)
            .clamp(1, REMOTE_POOL_MAX_CONNECTIONS);
        Self {
            max_connections,
            acquire_timeout: Duration::from_secs(REMOTE_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(REMOTE_IDLE_TIMEOUT_SECS),
        }
    }

    /// Apply environment overrides.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `VITRINE_DB_MAX_CONNECTIONS` | Pool size (at least 1) |
    /// | `VITRINE_DB_ACQUIRE_TIMEOUT_SECS` | Wait for a free connection |
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<u32>("VITRINE_DB_MAX_CONNECTIONS") {
            self.max_connections = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("VITRINE_DB_ACQUIRE_TIMEOUT_SECS") {
            self.acquire_timeout = Duration::from_secs(secs);
        }
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    fn pg_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
    }

    /// Open the pool.
    pub async fn connect(&self, database_url: &str) -> Result<PgPool> {
        let start = Instant::now();
        let pool = self
            .pg_options()
            .connect(database_url)
            .await
            .map_err(Error::Database)?;

        info!(
            subsystem = SUBSYSTEM_REMOTE,
            component = "pool",
            op = "established",
            max_connections = self.max_connections,
            duration_ms = start.elapsed().as_millis() as u64,
            "Metadata store pool ready"
        );
        Ok(pool)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}
