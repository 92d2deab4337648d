//! Embedded SQLite key/value backend.
//!
//! The transactional tier of the backend chain. Values live in a single
//! `kv_store` table; writes are upserts. A database that runs out of pages
//! (`SQLITE_FULL`) surfaces as [`Error::QuotaExceeded`].

use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use vitrine_core::{Error, KeyValueBackend, Result};

/// SQLite primary result code for "database or disk is full".
const SQLITE_FULL: &str = "13";

/// SQLite-backed key/value store.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_with_page_limit(path, None).await
    }

    /// Open with `PRAGMA max_page_count`, bounding the database size.
    pub async fn open_with_page_limit(path: &Path, max_pages: Option<u64>) -> Result<Self> {
        let start = Instant::now();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::from_io)?;
        }

        let mut opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        if let Some(pages) = max_pages {
            opts = opts.pragma("max_page_count", pages.to_string());
        }

        let backend = Self::connect(opts).await?;
        info!(
            subsystem = vitrine_core::logging::SUBSYSTEM_STORE,
            component = "sqlite",
            path = %path.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "SQLite key/value backend opened"
        );
        Ok(backend)
    }

    /// Private in-memory database (tests, ephemeral sessions).
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(opts).await
    }

    async fn connect(opts: SqliteConnectOptions) -> Result<Self> {
        // One connection: writes are serialized and an in-memory database is
        // shared by every query.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key         TEXT PRIMARY KEY NOT NULL,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn map_write_error(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref db) = e {
        if db.code().as_deref() == Some(SQLITE_FULL) {
            return Error::QuotaExceeded(db.message().to_string());
        }
    }
    Error::Database(e)
}

#[async_trait]
impl KeyValueBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;
        debug!(backend = "sqlite", key, size_bytes = value.len(), "kv: set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM kv_store ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("key")).collect())
    }
}
