//! Collaborator traits for the vitrine sync engine.
//!
//! These define the interfaces concrete backends must satisfy, enabling
//! pluggable local storage, remote stores and transports, and testability.

use async_trait::async_trait;

use crate::defaults::{OPTIMIZE_MAX_HEIGHT, OPTIMIZE_MAX_WIDTH, OPTIMIZE_QUALITY};
use crate::error::Result;
use crate::models::*;
use crate::session::Session;

// =============================================================================
// LOCAL KEY/VALUE PERSISTENCE
// =============================================================================

/// A key/value persistence backend.
///
/// All operations are idempotent: setting the same value twice or deleting a
/// missing key succeeds. A write rejected for lack of space must return
/// [`crate::Error::QuotaExceeded`].
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Short backend name used in logs and migration markers.
    fn name(&self) -> &str;

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value if present.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List every key held by this backend.
    async fn keys(&self) -> Result<Vec<String>>;
}

// =============================================================================
// REMOTE METADATA STORE
// =============================================================================

/// User-scoped CRUD over remote category and image rows.
///
/// Deletes are soft: rows get a deletion timestamp and disappear from the
/// `list_*` results, which only return live rows.
#[async_trait]
pub trait RemoteMetadataStore: Send + Sync {
    /// List live categories for the session's user.
    async fn list_categories(&self, session: &Session) -> Result<Vec<RemoteCategory>>;

    /// List live images of one category.
    async fn list_images(&self, session: &Session, category_id: RemoteId)
        -> Result<Vec<RemoteImage>>;

    /// List every live image of the user, across categories.
    async fn list_all_images(&self, session: &Session) -> Result<Vec<RemoteImage>>;

    /// Create a category row.
    async fn create_category(
        &self,
        session: &Session,
        req: &NewRemoteCategory,
    ) -> Result<RemoteCategory>;

    /// Patch only the fields present in `update`.
    async fn update_category(
        &self,
        session: &Session,
        id: RemoteId,
        update: &CategoryUpdate,
    ) -> Result<()>;

    /// Soft-delete a category row.
    async fn delete_category(&self, session: &Session, id: RemoteId) -> Result<()>;

    /// Create an image row under a category.
    async fn create_image(
        &self,
        session: &Session,
        category_id: RemoteId,
        req: &NewRemoteImage,
    ) -> Result<RemoteImage>;

    /// Patch only the fields present in `update`.
    async fn update_image(&self, session: &Session, id: RemoteId, update: &ImageUpdate)
        -> Result<()>;

    /// Soft-delete an image row.
    async fn delete_image(&self, session: &Session, id: RemoteId) -> Result<()>;
}

// =============================================================================
// OBJECT STORAGE TRANSPORT
// =============================================================================

/// Binary payload transport. Failures are independent of the metadata store.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload bytes under a suggested name.
    async fn upload(&self, bytes: &[u8], name: &str, auth_token: &str) -> Result<StoredObject>;

    /// Download the bytes stored at `key`.
    async fn fetch(&self, key: &str, auth_token: &str) -> Result<Vec<u8>>;

    /// Remove the object at `key`.
    async fn delete(&self, key: &str, auth_token: &str) -> Result<()>;

    /// Unauthenticated URL for `key`, used as a degraded reference.
    fn public_url(&self, key: &str) -> String;
}

// =============================================================================
// BINARY OPTIMIZER
// =============================================================================

/// Bounds for re-encoding an image before transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeOptions {
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality, 1-100.
    pub quality: u8,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            max_width: OPTIMIZE_MAX_WIDTH,
            max_height: OPTIMIZE_MAX_HEIGHT,
            quality: OPTIMIZE_QUALITY,
        }
    }
}

/// Pure, CPU-bound re-encoding step run before every transfer.
pub trait BinaryOptimizer: Send + Sync {
    fn optimize(&self, raw: &[u8], options: &OptimizeOptions) -> Result<Vec<u8>>;
}
