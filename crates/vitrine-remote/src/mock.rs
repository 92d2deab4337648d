//! In-memory mock collaborators for deterministic testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vitrine_remote::mock::{MockMetadataStore, MockObjectStorage};
//!
//! let metadata = MockMetadataStore::new();
//! let portraits = metadata.seed_category("alice", "Portraits");
//! metadata.seed_image("alice", portraits, "objects/1.jpg");
//!
//! let storage = MockObjectStorage::new().fail_uploads("broken.jpg", 4);
//! storage.seed("objects/1.jpg", b"jpeg bytes".to_vec());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use vitrine_core::{
    CategoryUpdate, Error, ImageUpdate, NewRemoteCategory, NewRemoteImage, ObjectStorage,
    RemoteCategory, RemoteId, RemoteImage, RemoteMetadataStore, Result, Session, StoredObject,
};

/// A recorded call to a mock collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub operation: String,
    pub target: String,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// METADATA STORE
// =============================================================================

#[derive(Debug, Clone)]
struct Row<T> {
    user_id: String,
    record: T,
    deleted: bool,
}

#[derive(Default)]
struct MetadataState {
    next_id: RemoteId,
    categories: BTreeMap<RemoteId, Row<RemoteCategory>>,
    images: BTreeMap<RemoteId, Row<RemoteImage>>,
    /// Remaining scripted failures per operation name.
    failures: HashMap<String, usize>,
    /// Categories whose image listing always fails.
    broken_listings: Vec<RemoteId>,
    calls: Vec<MockCall>,
}

impl MetadataState {
    fn allocate_id(&mut self) -> RemoteId {
        self.next_id += 1;
        self.next_id
    }

    fn record_call(&mut self, operation: &str, target: impl ToString) -> Result<()> {
        self.calls.push(MockCall {
            operation: operation.to_string(),
            target: target.to_string(),
        });
        if let Some(remaining) = self.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Transient(format!("scripted {} failure", operation)));
            }
        }
        Ok(())
    }
}

/// In-memory [`RemoteMetadataStore`] with soft deletes, call logging and
/// scripted failures.
#[derive(Clone, Default)]
pub struct MockMetadataStore {
    state: Arc<Mutex<MetadataState>>,
}

impl MockMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `operation` (e.g. `"create_image"`)
    /// with a transient error.
    pub fn fail_next(self, operation: &str, times: usize) -> Self {
        lock(&self.state)
            .failures
            .insert(operation.to_string(), times);
        self
    }

    /// Make `list_images` fail for one category.
    pub fn break_listing(self, category_id: RemoteId) -> Self {
        self.script_listing_failure(category_id);
        self
    }

    /// Like [`break_listing`](Self::break_listing), on a store already shared
    /// with an engine.
    pub fn script_listing_failure(&self, category_id: RemoteId) {
        lock(&self.state).broken_listings.push(category_id);
    }

    /// Insert a live category row directly.
    pub fn seed_category(&self, user_id: &str, name: &str) -> RemoteId {
        let mut state = lock(&self.state);
        let id = state.allocate_id();
        state.categories.insert(
            id,
            Row {
                user_id: user_id.to_string(),
                record: RemoteCategory {
                    id,
                    name: name.to_string(),
                    cover_image: None,
                    notes: String::new(),
                    tags: Vec::new(),
                    is_favorite: false,
                    is_private: false,
                    password_hash: None,
                },
                deleted: false,
            },
        );
        id
    }

    /// Insert a live image row directly.
    pub fn seed_image(&self, user_id: &str, category_id: RemoteId, object_key: &str) -> RemoteId {
        let mut state = lock(&self.state);
        let id = state.allocate_id();
        state.images.insert(
            id,
            Row {
                user_id: user_id.to_string(),
                record: RemoteImage {
                    id,
                    category_id,
                    object_key: object_key.to_string(),
                    pose_name: object_key.rsplit('/').next().unwrap_or(object_key).to_string(),
                    notes: String::new(),
                    tags: Vec::new(),
                    is_favorite: false,
                    size_bytes: 0,
                    created_at: Utc::now(),
                },
                deleted: false,
            },
        );
        id
    }

    /// Modify a stored category row in place (simulates an edit on another device).
    pub fn edit_category(&self, id: RemoteId, f: impl FnOnce(&mut RemoteCategory)) {
        if let Some(row) = lock(&self.state).categories.get_mut(&id) {
            f(&mut row.record);
        }
    }

    /// Modify a stored image row in place.
    pub fn edit_image(&self, id: RemoteId, f: impl FnOnce(&mut RemoteImage)) {
        if let Some(row) = lock(&self.state).images.get_mut(&id) {
            f(&mut row.record);
        }
    }

    /// Soft-delete a category row directly.
    pub fn tombstone_category(&self, id: RemoteId) {
        if let Some(row) = lock(&self.state).categories.get_mut(&id) {
            row.deleted = true;
        }
    }

    /// Soft-delete an image row directly.
    pub fn tombstone_image(&self, id: RemoteId) {
        if let Some(row) = lock(&self.state).images.get_mut(&id) {
            row.deleted = true;
        }
    }

    pub fn category(&self, id: RemoteId) -> Option<RemoteCategory> {
        lock(&self.state)
            .categories
            .get(&id)
            .map(|r| r.record.clone())
    }

    pub fn image(&self, id: RemoteId) -> Option<RemoteImage> {
        lock(&self.state).images.get(&id).map(|r| r.record.clone())
    }

    pub fn is_category_deleted(&self, id: RemoteId) -> bool {
        lock(&self.state)
            .categories
            .get(&id)
            .is_some_and(|r| r.deleted)
    }

    /// Live image rows, across users.
    pub fn live_images(&self) -> Vec<RemoteImage> {
        lock(&self.state)
            .images
            .values()
            .filter(|r| !r.deleted)
            .map(|r| r.record.clone())
            .collect()
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    /// Number of calls made to one operation.
    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }
}

#[async_trait]
impl RemoteMetadataStore for MockMetadataStore {
    async fn list_categories(&self, session: &Session) -> Result<Vec<RemoteCategory>> {
        let mut state = lock(&self.state);
        state.record_call("list_categories", session.user_id())?;
        Ok(state
            .categories
            .values()
            .filter(|r| !r.deleted && r.user_id == session.user_id())
            .map(|r| r.record.clone())
            .collect())
    }

    async fn list_images(
        &self,
        session: &Session,
        category_id: RemoteId,
    ) -> Result<Vec<RemoteImage>> {
        let mut state = lock(&self.state);
        state.record_call("list_images", category_id)?;
        if state.broken_listings.contains(&category_id) {
            return Err(Error::Transient(format!(
                "listing of category {} unavailable",
                category_id
            )));
        }
        Ok(state
            .images
            .values()
            .filter(|r| {
                !r.deleted && r.user_id == session.user_id() && r.record.category_id == category_id
            })
            .map(|r| r.record.clone())
            .collect())
    }

    async fn list_all_images(&self, session: &Session) -> Result<Vec<RemoteImage>> {
        let mut state = lock(&self.state);
        state.record_call("list_all_images", session.user_id())?;
        let live_categories: Vec<RemoteId> = state
            .categories
            .values()
            .filter(|r| !r.deleted && r.user_id == session.user_id())
            .map(|r| r.record.id)
            .collect();
        Ok(state
            .images
            .values()
            .filter(|r| {
                !r.deleted
                    && r.user_id == session.user_id()
                    && live_categories.contains(&r.record.category_id)
            })
            .map(|r| r.record.clone())
            .collect())
    }

    async fn create_category(
        &self,
        session: &Session,
        req: &NewRemoteCategory,
    ) -> Result<RemoteCategory> {
        let mut state = lock(&self.state);
        state.record_call("create_category", &req.name)?;
        let id = state.allocate_id();
        let record = RemoteCategory {
            id,
            name: req.name.clone(),
            cover_image: req.cover_image.clone(),
            notes: req.notes.clone(),
            tags: req.tags.clone(),
            is_favorite: req.is_favorite,
            is_private: req.is_private,
            password_hash: req.password_hash.clone(),
        };
        state.categories.insert(
            id,
            Row {
                user_id: session.user_id().to_string(),
                record: record.clone(),
                deleted: false,
            },
        );
        Ok(record)
    }

    async fn update_category(
        &self,
        session: &Session,
        id: RemoteId,
        update: &CategoryUpdate,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.record_call("update_category", id)?;
        let row = state
            .categories
            .get_mut(&id)
            .filter(|r| !r.deleted && r.user_id == session.user_id())
            .ok_or_else(|| Error::NotFound(format!("category {}", id)))?;
        let c = &mut row.record;
        if let Some(ref v) = update.name {
            c.name = v.clone();
        }
        if let Some(ref v) = update.cover_image {
            c.cover_image = v.clone();
        }
        if let Some(ref v) = update.notes {
            c.notes = v.clone();
        }
        if let Some(ref v) = update.tags {
            c.tags = v.clone();
        }
        if let Some(v) = update.is_favorite {
            c.is_favorite = v;
        }
        if let Some(v) = update.is_private {
            c.is_private = v;
        }
        if let Some(ref v) = update.private_password_hash {
            c.password_hash = v.clone();
        }
        Ok(())
    }

    async fn delete_category(&self, session: &Session, id: RemoteId) -> Result<()> {
        let mut state = lock(&self.state);
        state.record_call("delete_category", id)?;
        if let Some(row) = state
            .categories
            .get_mut(&id)
            .filter(|r| r.user_id == session.user_id())
        {
            row.deleted = true;
        }
        Ok(())
    }

    async fn create_image(
        &self,
        session: &Session,
        category_id: RemoteId,
        req: &NewRemoteImage,
    ) -> Result<RemoteImage> {
        let mut state = lock(&self.state);
        state.record_call("create_image", &req.object_key)?;
        let parent_live = state
            .categories
            .get(&category_id)
            .is_some_and(|r| !r.deleted && r.user_id == session.user_id());
        if !parent_live {
            return Err(Error::NotFound(format!("category {}", category_id)));
        }
        let id = state.allocate_id();
        let record = RemoteImage {
            id,
            category_id,
            object_key: req.object_key.clone(),
            pose_name: req.pose_name.clone(),
            notes: req.notes.clone(),
            tags: req.tags.clone(),
            is_favorite: req.is_favorite,
            size_bytes: req.size_bytes,
            created_at: req.created_at,
        };
        state.images.insert(
            id,
            Row {
                user_id: session.user_id().to_string(),
                record: record.clone(),
                deleted: false,
            },
        );
        Ok(record)
    }

    async fn update_image(
        &self,
        session: &Session,
        id: RemoteId,
        update: &ImageUpdate,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.record_call("update_image", id)?;
        let row = state
            .images
            .get_mut(&id)
            .filter(|r| !r.deleted && r.user_id == session.user_id())
            .ok_or_else(|| Error::NotFound(format!("image {}", id)))?;
        let i = &mut row.record;
        if let Some(ref v) = update.pose_name {
            i.pose_name = v.clone();
        }
        if let Some(ref v) = update.notes {
            i.notes = v.clone();
        }
        if let Some(ref v) = update.tags {
            i.tags = v.clone();
        }
        if let Some(v) = update.is_favorite {
            i.is_favorite = v;
        }
        Ok(())
    }

    async fn delete_image(&self, session: &Session, id: RemoteId) -> Result<()> {
        let mut state = lock(&self.state);
        state.record_call("delete_image", id)?;
        if let Some(row) = state
            .images
            .get_mut(&id)
            .filter(|r| r.user_id == session.user_id())
        {
            row.deleted = true;
        }
        Ok(())
    }
}

// =============================================================================
// OBJECT STORAGE
// =============================================================================

#[derive(Default)]
struct StorageState {
    objects: HashMap<String, Vec<u8>>,
    /// Remaining scripted upload failures per upload name.
    upload_failures: HashMap<String, usize>,
    upload_attempts: HashMap<String, usize>,
    broken_fetches: Vec<String>,
    calls: Vec<MockCall>,
}

/// In-memory [`ObjectStorage`] with scripted failures, attempt counting and
/// optional latency.
#[derive(Clone)]
pub struct MockObjectStorage {
    state: Arc<Mutex<StorageState>>,
    public_base_url: String,
    latency: Option<Duration>,
    next_key: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for MockObjectStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockObjectStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StorageState::default())),
            public_base_url: "https://public.storage.test".to_string(),
            latency: None,
            next_key: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the first `times` uploads of `name` with a transfer error.
    pub fn fail_uploads(self, name: &str, times: usize) -> Self {
        self.script_upload_failures(name, times);
        self
    }

    /// Like [`fail_uploads`](Self::fail_uploads), on a storage already shared
    /// with an engine.
    pub fn script_upload_failures(&self, name: &str, times: usize) {
        lock(&self.state)
            .upload_failures
            .insert(name.to_string(), times);
    }

    /// Make every fetch of `key` fail.
    pub fn break_fetch(self, key: &str) -> Self {
        lock(&self.state).broken_fetches.push(key.to_string());
        self
    }

    /// Sleep this long inside every upload and fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store an object directly.
    pub fn seed(&self, key: &str, bytes: Vec<u8>) {
        lock(&self.state).objects.insert(key.to_string(), bytes);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.state).objects.get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.state).objects.len()
    }

    /// Upload attempts made for `name`, failed ones included.
    pub fn upload_attempts(&self, name: &str) -> usize {
        lock(&self.state)
            .upload_attempts
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of concurrent uploads/fetches observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    async fn simulate_latency(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorage for MockObjectStorage {
    async fn upload(&self, bytes: &[u8], name: &str, _auth_token: &str) -> Result<StoredObject> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        state.calls.push(MockCall {
            operation: "upload".into(),
            target: name.to_string(),
        });
        *state.upload_attempts.entry(name.to_string()).or_insert(0) += 1;
        if let Some(remaining) = state.upload_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Transfer(format!("scripted upload failure for {}", name)));
            }
        }
        let n = self.next_key.fetch_add(1, Ordering::SeqCst) + 1;
        let key = format!("objects/{}/{}", n, name);
        state.objects.insert(key.clone(), bytes.to_vec());
        Ok(StoredObject {
            key,
            size: bytes.len() as u64,
        })
    }

    async fn fetch(&self, key: &str, _auth_token: &str) -> Result<Vec<u8>> {
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        state.calls.push(MockCall {
            operation: "fetch".into(),
            target: key.to_string(),
        });
        if state.broken_fetches.iter().any(|k| k == key) {
            return Err(Error::Transfer(format!("scripted fetch failure for {}", key)));
        }
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object {}", key)))
    }

    async fn delete(&self, key: &str, _auth_token: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(MockCall {
            operation: "delete".into(),
            target: key.to_string(),
        });
        state.objects.remove(key);
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("alice", "token").unwrap()
    }

    #[tokio::test]
    async fn test_soft_delete_hides_rows_from_listings() {
        let store = MockMetadataStore::new();
        let keep = store.seed_category("alice", "Keep");
        let gone = store.seed_category("alice", "Gone");
        store.seed_image("alice", gone, "objects/1.jpg");
        store.seed_category("bob", "Not mine");

        store.delete_category(&session(), gone).await.unwrap();

        let cats = store.list_categories(&session()).await.unwrap();
        assert_eq!(cats.iter().map(|c| c.id).collect::<Vec<_>>(), vec![keep]);
        assert!(store.is_category_deleted(gone));
        assert!(store.list_all_images(&session()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let store = MockMetadataStore::new().fail_next("list_categories", 2);
        assert!(store.list_categories(&session()).await.is_err());
        assert!(store.list_categories(&session()).await.is_err());
        assert!(store.list_categories(&session()).await.is_ok());
        assert_eq!(store.call_count("list_categories"), 3);
    }

    #[tokio::test]
    async fn test_broken_listing_only_affects_its_category() {
        let store = MockMetadataStore::new().break_listing(1);
        let broken = store.seed_category("alice", "Broken");
        let fine = store.seed_category("alice", "Fine");
        store.seed_image("alice", fine, "objects/1.jpg");
        assert_eq!(broken, 1);

        assert!(store.list_images(&session(), broken).await.is_err());
        assert_eq!(store.list_images(&session(), fine).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_image_requires_live_parent() {
        let store = MockMetadataStore::new();
        let req = NewRemoteImage {
            object_key: "objects/1.jpg".into(),
            pose_name: "p".into(),
            notes: String::new(),
            tags: vec![],
            is_favorite: false,
            size_bytes: 3,
            created_at: Utc::now(),
        };
        let err = store.create_image(&session(), 77, &req).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_storage_upload_failures_are_counted() {
        let storage = MockObjectStorage::new().fail_uploads("a.jpg", 1);
        assert!(storage.upload(b"x", "a.jpg", "t").await.is_err());
        let stored = storage.upload(b"x", "a.jpg", "t").await.unwrap();
        assert_eq!(storage.upload_attempts("a.jpg"), 2);
        assert_eq!(storage.fetch(&stored.key, "t").await.unwrap(), b"x");
    }
}
