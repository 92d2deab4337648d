//! # vitrine-store
//!
//! Local persistence for vitrine.
//!
//! - [`DurableStore`] / [`BackendChain`]: namespaced key/value access over the
//!   best available backend, with one-time migration out of older tiers.
//! - [`SqliteBackend`], [`FileBackend`], [`MemoryBackend`]: the tiers.
//! - [`EntityStore`]: the in-memory library snapshot, its mutation
//!   primitives and the debounced writer behind them.
//! - [`schema`]: the versioned on-disk record layout.

pub mod durable;
pub mod entities;
pub mod file;
pub mod memory;
pub mod schema;
pub mod sqlite;
mod writer;

pub use durable::{BackendChain, DurableStore, MigrationReport, OpenedStore};
pub use entities::EntityStore;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
