//! # vitrine-remote
//!
//! Remote collaborators for the vitrine sync engine.
//!
//! - [`PgMetadataStore`]: user-scoped category and image rows in PostgreSQL,
//!   with soft deletes.
//! - [`HttpObjectStorage`]: binary transfer over HTTP with bearer auth.
//! - [`FilesystemObjectStorage`]: content-addressed objects in a local
//!   directory, for development and single-host deployments.
//! - `mock` (feature `mock`): in-memory stand-ins for tests.

pub mod fs_storage;
pub mod http_storage;
pub mod metadata;
pub mod pool;

#[cfg(feature = "mock")]
pub mod mock;

pub use fs_storage::FilesystemObjectStorage;
pub use http_storage::HttpObjectStorage;
pub use metadata::PgMetadataStore;
pub use pool::RemotePoolOptions;
