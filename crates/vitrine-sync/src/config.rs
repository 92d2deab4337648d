//! Engine configuration.

use std::time::Duration;

use vitrine_core::defaults::{
    FETCH_CONCURRENCY, OPTIMIZE_MAX_HEIGHT, OPTIMIZE_MAX_WIDTH, OPTIMIZE_QUALITY,
    RETRY_BASE_DELAY_MS, SAVE_DEBOUNCE_MS, SYNC_INTERVAL_SECS, UPLOAD_MAX_RETRIES, UPLOAD_WORKERS,
    UPLOAD_WORKERS_MAX,
};
use vitrine_core::OptimizeOptions;
use vitrine_remote::RemotePoolOptions;

use crate::retry::RetryPolicy;

/// Tunables for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Debounce window of the library writer.
    pub save_debounce: Duration,
    /// Upload worker pool size.
    pub upload_workers: usize,
    /// Transfer retry policy.
    pub retry: RetryPolicy,
    /// Concurrent binary retrievals during reconciliation.
    pub fetch_concurrency: usize,
    /// Optimizer bounds applied before every transfer.
    pub optimize: OptimizeOptions,
    /// Polling interval of the daemon's sync loop.
    pub sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(SAVE_DEBOUNCE_MS),
            upload_workers: UPLOAD_WORKERS,
            retry: RetryPolicy::default(),
            fetch_concurrency: FETCH_CONCURRENCY,
            optimize: OptimizeOptions::default(),
            sync_interval: Duration::from_secs(SYNC_INTERVAL_SECS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl SyncConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `VITRINE_SAVE_DEBOUNCE_MS` | `500` | Writer debounce window |
    /// | `VITRINE_UPLOAD_WORKERS` | `3` | Upload pool size (1..=16) |
    /// | `VITRINE_UPLOAD_MAX_RETRIES` | `3` | Retries after the first transfer attempt |
    /// | `VITRINE_RETRY_BASE_MS` | `1000` | First backoff delay, doubled per retry |
    /// | `VITRINE_FETCH_CONCURRENCY` | `6` | Binary retrieval fan-out |
    /// | `VITRINE_OPTIMIZE_MAX_WIDTH` | `2048` | Optimizer max width |
    /// | `VITRINE_OPTIMIZE_MAX_HEIGHT` | `2048` | Optimizer max height |
    /// | `VITRINE_OPTIMIZE_QUALITY` | `82` | JPEG quality (1-100) |
    /// | `VITRINE_SYNC_INTERVAL_SECS` | `300` | Daemon polling interval |
    pub fn from_env() -> Self {
        Self::default()
            .with_save_debounce(Duration::from_millis(
                env_parse("VITRINE_SAVE_DEBOUNCE_MS").unwrap_or(SAVE_DEBOUNCE_MS),
            ))
            .with_upload_workers(env_parse("VITRINE_UPLOAD_WORKERS").unwrap_or(UPLOAD_WORKERS))
            .with_retry(RetryPolicy::new(
                env_parse("VITRINE_UPLOAD_MAX_RETRIES").unwrap_or(UPLOAD_MAX_RETRIES),
                Duration::from_millis(
                    env_parse("VITRINE_RETRY_BASE_MS").unwrap_or(RETRY_BASE_DELAY_MS),
                ),
            ))
            .with_fetch_concurrency(
                env_parse("VITRINE_FETCH_CONCURRENCY").unwrap_or(FETCH_CONCURRENCY),
            )
            .with_optimize(OptimizeOptions {
                max_width: env_parse("VITRINE_OPTIMIZE_MAX_WIDTH").unwrap_or(OPTIMIZE_MAX_WIDTH),
                max_height: env_parse("VITRINE_OPTIMIZE_MAX_HEIGHT")
                    .unwrap_or(OPTIMIZE_MAX_HEIGHT),
                quality: env_parse("VITRINE_OPTIMIZE_QUALITY").unwrap_or(OPTIMIZE_QUALITY),
            })
            .with_sync_interval(Duration::from_secs(
                env_parse("VITRINE_SYNC_INTERVAL_SECS").unwrap_or(SYNC_INTERVAL_SECS),
            ))
    }

    pub fn with_save_debounce(mut self, debounce: Duration) -> Self {
        self.save_debounce = debounce;
        self
    }

    /// Set the upload pool size, clamped to `1..=UPLOAD_WORKERS_MAX`.
    pub fn with_upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = workers.clamp(1, UPLOAD_WORKERS_MAX);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fetch_concurrency(mut self, n: usize) -> Self {
        self.fetch_concurrency = n.max(1);
        self
    }

    /// Set optimizer bounds; quality is clamped to 1-100 and sizes to at least 1.
    pub fn with_optimize(mut self, options: OptimizeOptions) -> Self {
        self.optimize = OptimizeOptions {
            max_width: options.max_width.max(1),
            max_height: options.max_height.max(1),
            quality: options.quality.clamp(1, 100),
        };
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Metadata store pool sized for this configuration's upload workers and
    /// listing fan-out.
    pub fn remote_pool(&self) -> RemotePoolOptions {
        RemotePoolOptions::for_concurrency(self.upload_workers, self.fetch_concurrency)
    }
}
