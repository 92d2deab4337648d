//! # vitrine-sync
//!
//! The offline-first sync engine for vitrine galleries.
//!
//! - [`SyncEngine`]: the per-session operation surface (add/update/delete
//!   categories and images, sync on load, hydration, retry sweep).
//! - [`upload`]: optimize, transfer and record, under a bounded worker pool
//!   with exponential-backoff retry.
//! - [`reconcile`]: full pull or four-phase incremental merge against the
//!   remote store.
//! - [`hydrate`]: natural-key matching for entities created offline.
//! - [`ImageOptimizer`]: JPEG re-encoding before transfer.

pub mod config;
pub mod engine;
pub mod hydrate;
pub mod optimizer;
pub mod pool;
pub mod reconcile;
pub mod retry;
pub mod upload;

pub use config::SyncConfig;
pub use engine::{
    BulkEditReport, CategoryAdded, Collaborators, DeleteReport, EditReport, RemoteOutcome,
    SweepReport, SyncEngine, SyncReport,
};
pub use hydrate::HydrationReport;
pub use optimizer::ImageOptimizer;
pub use reconcile::{MergeReport, Reconciler, RemoteSnapshot};
pub use retry::{RetryOutcome, RetryPolicy};
pub use upload::{BatchReport, ItemOutcome, UploadPipeline};
