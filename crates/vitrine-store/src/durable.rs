//! Durable Local Store: namespaced key/value access over the highest-priority
//! backend that can be opened, plus the one-time migration out of
//! lower-priority backends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use vitrine_core::defaults::{FILE_STORE_DIR, MIGRATION_MARKER_KEY, SQLITE_FILE_NAME};
use vitrine_core::logging::SUBSYSTEM_STORE;
use vitrine_core::{KeyValueBackend, Result};

use crate::file::FileBackend;
use crate::memory::MemoryBackend;
use crate::sqlite::SqliteBackend;

/// Namespaced view over the primary key/value backend.
#[derive(Clone)]
pub struct DurableStore {
    primary: Arc<dyn KeyValueBackend>,
    namespace: String,
}

/// Outcome of [`DurableStore::migrate_from`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Keys copied into the primary backend.
    pub copied: usize,
    /// Keys dropped from a source because the primary already held them.
    pub skipped: usize,
    /// The marker was present; nothing was read.
    pub already_complete: bool,
}

impl DurableStore {
    pub fn new(primary: Arc<dyn KeyValueBackend>, namespace: impl Into<String>) -> Self {
        Self {
            primary,
            namespace: namespace.into(),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }

    fn prefix(&self) -> String {
        format!("{}/", self.namespace)
    }

    /// Name of the backend all reads and writes go to.
    pub fn backend_name(&self) -> &str {
        self.primary.name()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.primary.get(&self.namespaced(key)).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.primary.set(&self.namespaced(key), value).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.primary.delete(&self.namespaced(key)).await
    }

    /// Whether the migration marker has been written to the primary backend.
    pub async fn migration_complete(&self) -> Result<bool> {
        Ok(self.get(MIGRATION_MARKER_KEY).await?.is_some())
    }

    /// Move every key of this namespace out of `sources` into the primary.
    ///
    /// A key the primary already holds is never overwritten; the source copy
    /// is discarded instead. Each source key is deleted after it has been
    /// handled. The marker is written only once every source has been
    /// drained, so an interrupted migration resumes on the next open and a
    /// completed one never runs again.
    pub async fn migrate_from(
        &self,
        sources: &[Arc<dyn KeyValueBackend>],
    ) -> Result<MigrationReport> {
        if self.migration_complete().await? {
            debug!(
                subsystem = SUBSYSTEM_STORE,
                component = "migration",
                backend = self.backend_name(),
                "Migration marker present, skipping"
            );
            return Ok(MigrationReport {
                already_complete: true,
                ..Default::default()
            });
        }

        let start = Instant::now();
        let prefix = self.prefix();
        let marker = self.namespaced(MIGRATION_MARKER_KEY);
        let mut report = MigrationReport::default();

        for source in sources {
            for key in source.keys().await? {
                if !key.starts_with(&prefix) || key == marker {
                    continue;
                }
                if self.primary.get(&key).await?.is_some() {
                    report.skipped += 1;
                } else if let Some(value) = source.get(&key).await? {
                    self.primary.set(&key, &value).await?;
                    report.copied += 1;
                }
                source.delete(&key).await?;
            }
        }

        let sources_names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
        let marker_value = json!({
            "completed_at": Utc::now().to_rfc3339(),
            "primary": self.backend_name(),
            "sources": sources_names,
        });
        self.primary.set(&marker, &marker_value.to_string()).await?;

        info!(
            subsystem = SUBSYSTEM_STORE,
            component = "migration",
            primary = self.backend_name(),
            copied = report.copied,
            skipped = report.skipped,
            duration_ms = start.elapsed().as_millis() as u64,
            "Local store migration complete"
        );
        Ok(report)
    }
}

// =============================================================================
// BACKEND CHAIN
// =============================================================================

enum Tier {
    Host(Arc<dyn KeyValueBackend>),
    Sqlite {
        path: PathBuf,
        max_pages: Option<u64>,
    },
    File(PathBuf),
    Memory,
}

impl Tier {
    fn label(&self) -> &'static str {
        match self {
            Tier::Host(_) => "host",
            Tier::Sqlite { .. } => "sqlite",
            Tier::File(_) => "file",
            Tier::Memory => "memory",
        }
    }

    /// Open as the primary backend.
    async fn open_primary(&self) -> Result<Arc<dyn KeyValueBackend>> {
        match self {
            Tier::Host(backend) => {
                backend.get(MIGRATION_MARKER_KEY).await?;
                Ok(Arc::clone(backend))
            }
            Tier::Sqlite { path, max_pages } => Ok(Arc::new(
                SqliteBackend::open_with_page_limit(path, *max_pages).await?,
            )),
            Tier::File(dir) => Ok(Arc::new(FileBackend::open(dir.clone()).await?)),
            Tier::Memory => Ok(Arc::new(MemoryBackend::new())),
        }
    }

    /// Open as a migration source. Only backends that already hold data on
    /// disk are opened, so no empty database or directory gets created.
    async fn open_source(&self) -> Result<Option<Arc<dyn KeyValueBackend>>> {
        match self {
            Tier::Host(backend) => Ok(Some(Arc::clone(backend))),
            Tier::Sqlite { path, .. } => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Ok(None);
                }
                Ok(Some(Arc::new(SqliteBackend::open(path).await?)))
            }
            Tier::File(dir) => {
                if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
                    return Ok(None);
                }
                Ok(Some(Arc::new(FileBackend::new(dir.clone()))))
            }
            Tier::Memory => Ok(None),
        }
    }
}

/// A store opened from a [`BackendChain`].
pub struct OpenedStore {
    pub store: DurableStore,
    /// `None` when migration failed; the store is usable regardless.
    pub migration: Option<MigrationReport>,
}

/// Priority-ordered list of candidate backends.
///
/// ```ignore
/// let opened = BackendChain::new("vitrine")
///     .with_sqlite(data_dir.join("vitrine.db"))
///     .with_file(data_dir.join("kv"))
///     .open()
///     .await;
/// ```
pub struct BackendChain {
    namespace: String,
    tiers: Vec<Tier>,
}

impl BackendChain {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tiers: Vec::new(),
        }
    }

    /// The standard on-device chain: SQLite database, then flat files.
    pub fn for_data_dir(namespace: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self::new(namespace)
            .with_sqlite(data_dir.join(SQLITE_FILE_NAME))
            .with_file(data_dir.join(FILE_STORE_DIR))
    }

    /// Host-provided key/value API. Highest priority when present.
    pub fn with_host(mut self, backend: Arc<dyn KeyValueBackend>) -> Self {
        self.tiers.push(Tier::Host(backend));
        self
    }

    pub fn with_sqlite(self, path: impl Into<PathBuf>) -> Self {
        self.with_sqlite_page_limit(path, None)
    }

    /// SQLite tier with a `max_page_count` bound.
    pub fn with_sqlite_page_limit(mut self, path: impl Into<PathBuf>, max_pages: Option<u64>) -> Self {
        self.tiers.push(Tier::Sqlite {
            path: path.into(),
            max_pages,
        });
        self
    }

    pub fn with_file(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tiers.push(Tier::File(dir.into()));
        self
    }

    pub fn with_memory(mut self) -> Self {
        self.tiers.push(Tier::Memory);
        self
    }

    /// Open the first tier that initializes, then migrate the tiers below it.
    ///
    /// Never fails: a tier that cannot open is logged and skipped, and when
    /// no tier opens the store runs on volatile memory.
    pub async fn open(self) -> OpenedStore {
        let mut primary: Option<(usize, Arc<dyn KeyValueBackend>)> = None;
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.open_primary().await {
                Ok(backend) => {
                    primary = Some((idx, backend));
                    break;
                }
                Err(e) => {
                    warn!(
                        subsystem = SUBSYSTEM_STORE,
                        component = "chain",
                        tier = tier.label(),
                        error = %e,
                        "Backend failed to initialize, falling back one tier"
                    );
                }
            }
        }

        let (primary_idx, primary) = match primary {
            Some(found) => found,
            None => {
                warn!(
                    subsystem = SUBSYSTEM_STORE,
                    component = "chain",
                    "No durable backend available, using volatile memory"
                );
                (self.tiers.len(), Arc::new(MemoryBackend::new()) as Arc<dyn KeyValueBackend>)
            }
        };

        let mut sources = Vec::new();
        for tier in self.tiers.iter().skip(primary_idx + 1) {
            match tier.open_source().await {
                Ok(Some(source)) => sources.push(source),
                Ok(None) => {}
                Err(e) => warn!(
                    subsystem = SUBSYSTEM_STORE,
                    component = "chain",
                    tier = tier.label(),
                    error = %e,
                    "Migration source could not be opened"
                ),
            }
        }

        let store = DurableStore::new(primary, self.namespace);
        info!(
            subsystem = SUBSYSTEM_STORE,
            component = "chain",
            backend = store.backend_name(),
            sources = sources.len(),
            "Durable local store opened"
        );

        let migration = match store.migrate_from(&sources).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(
                    subsystem = SUBSYSTEM_STORE,
                    component = "migration",
                    error = %e,
                    "Local store migration failed, will retry on next open"
                );
                None
            }
        };

        OpenedStore { store, migration }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(name: &str) -> (MemoryBackend, Arc<dyn KeyValueBackend>) {
        let backend = MemoryBackend::named(name);
        let shared: Arc<dyn KeyValueBackend> = Arc::new(backend.clone());
        (backend, shared)
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let (raw, primary) = memory("primary");
        let store = DurableStore::new(primary, "vitrine");
        store.set("library:alice", "{}").await.unwrap();
        assert_eq!(raw.peek("vitrine/library:alice").as_deref(), Some("{}"));
        assert_eq!(store.get("library:alice").await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_migration_ignores_foreign_namespaces() {
        let (_, primary) = memory("primary");
        let (legacy_raw, legacy) = memory("legacy");
        legacy_raw.seed("other-app/settings", "x");
        legacy_raw.seed("vitrine/library:alice", "a");

        let store = DurableStore::new(primary, "vitrine");
        let report = store.migrate_from(&[legacy]).await.unwrap();

        assert_eq!(report.copied, 1);
        assert_eq!(legacy_raw.peek("other-app/settings").as_deref(), Some("x"));
        assert!(legacy_raw.peek("vitrine/library:alice").is_none());
    }

    #[tokio::test]
    async fn test_failed_source_leaves_marker_unset() {
        let (legacy_raw, legacy) = memory("legacy");
        legacy_raw.seed("vitrine/library:alice", "a-very-long-value");

        // The primary rejects the copy, so migration must be retried later.
        let tiny: Arc<dyn KeyValueBackend> =
            Arc::new(MemoryBackend::named("tiny").with_capacity_bytes(4));
        let store = DurableStore::new(tiny, "vitrine");
        let err = store.migrate_from(&[legacy]).await.unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(!store.migration_complete().await.unwrap());
        assert!(legacy_raw.peek("vitrine/library:alice").is_some());
    }
}
