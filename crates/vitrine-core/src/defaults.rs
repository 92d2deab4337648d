//! Centralized default constants for the vitrine sync engine.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers. Organized by component.

// =============================================================================
// LOCAL PERSISTENCE
// =============================================================================

/// Debounce window for the library writer in milliseconds.
pub const SAVE_DEBOUNCE_MS: u64 = 500;

/// Key prefix under which a user's library record is stored.
pub const LIBRARY_KEY_PREFIX: &str = "library";

/// Key of the marker written once backend migration has completed.
pub const MIGRATION_MARKER_KEY: &str = "__vitrine_migration_complete";

/// SQLite database file name inside the data directory.
pub const SQLITE_FILE_NAME: &str = "vitrine.db";

/// Directory name used by the filesystem key/value fallback.
pub const FILE_STORE_DIR: &str = "kv";

// =============================================================================
// UPLOAD PIPELINE
// =============================================================================

/// Default upload worker pool size.
pub const UPLOAD_WORKERS: usize = 3;

/// Upper bound accepted for the upload worker pool size.
pub const UPLOAD_WORKERS_MAX: usize = 16;

/// Retries after the first failed transfer attempt.
pub const UPLOAD_MAX_RETRIES: u32 = 3;

/// First backoff delay in milliseconds; doubles on each retry (1s, 2s, 4s).
pub const RETRY_BASE_DELAY_MS: u64 = 1000;

// =============================================================================
// RECONCILIATION
// =============================================================================

/// Concurrent binary retrievals during a pull or merge.
pub const FETCH_CONCURRENCY: usize = 6;

/// Polling interval of the background sync loop in seconds.
pub const SYNC_INTERVAL_SECS: u64 = 300;

// =============================================================================
// BINARY OPTIMIZER
// =============================================================================

/// Maximum encoded width in pixels.
pub const OPTIMIZE_MAX_WIDTH: u32 = 2048;

/// Maximum encoded height in pixels.
pub const OPTIMIZE_MAX_HEIGHT: u32 = 2048;

/// JPEG encoding quality (1-100).
pub const OPTIMIZE_QUALITY: u8 = 82;

// =============================================================================
// EVENTS
// =============================================================================

/// Sync event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// REMOTE
// =============================================================================

/// Object storage request timeout in seconds.
pub const STORAGE_TIMEOUT_SECS: u64 = 60;

/// Upper bound on metadata store connections, whatever the engine's concurrency.
pub const REMOTE_POOL_MAX_CONNECTIONS: u32 = 32;

/// Seconds to wait for a free metadata store connection.
pub const REMOTE_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Seconds before an idle metadata store connection is closed.
pub const REMOTE_IDLE_TIMEOUT_SECS: u64 = 600;
