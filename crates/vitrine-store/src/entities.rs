//! Entity Store: the canonical in-memory library and its mutation primitives.
//!
//! Every mutation clones the current snapshot, applies the change, publishes
//! the result as a new immutable `Arc<Library>` and schedules a debounced
//! save. Mutations are synchronous and applied in call order; readers holding
//! an older snapshot are never affected.
//!
//! User actions, reconciliation and hydration all mutate through this type,
//! so there is one code path for persistence.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use vitrine_core::logging::SUBSYSTEM_STORE;
use vitrine_core::{
    Category, CategoryUpdate, EventBus, Image, ImageUpdate, Library, LocalId, NewCategory,
    RemoteId, Result, SyncEvent, TransferStatus,
};

use crate::durable::DurableStore;
use crate::schema;
use crate::writer::LibraryWriter;

/// In-memory library for one session, backed by a debounced writer.
pub struct EntityStore {
    state: watch::Sender<Arc<Library>>,
    mutation: Mutex<()>,
    writer: LibraryWriter,
    events: EventBus,
}

impl EntityStore {
    /// Load the record stored under `key` (or start empty) and spawn the writer.
    ///
    /// A record that cannot be parsed is an error rather than an empty
    /// library, so a corrupt file is never overwritten by the next save.
    pub async fn load(
        durable: DurableStore,
        key: impl Into<String>,
        debounce: Duration,
        events: EventBus,
    ) -> Result<Self> {
        let key = key.into();
        let library = match durable.get(&key).await? {
            Some(raw) => schema::decode(&raw)?,
            None => Library::new(),
        };
        info!(
            subsystem = SUBSYSTEM_STORE,
            component = "entities",
            backend = durable.backend_name(),
            categories = library.categories.len(),
            images = library.image_count(),
            "Library loaded"
        );

        let (state, snapshot) = watch::channel(Arc::new(library));
        let writer = LibraryWriter::spawn(durable, key, snapshot, debounce, events.clone());
        Ok(Self {
            state,
            mutation: Mutex::new(()),
            writer,
            events,
        })
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<Library> {
        Arc::clone(&self.state.borrow())
    }

    /// Receive every new snapshot as it is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Library>> {
        self.state.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Apply `f` to a working copy and publish it when `f` reports a change.
    fn commit<R>(&self, persist: bool, f: impl FnOnce(&mut Library) -> (R, bool)) -> R {
        let _guard = self.mutation.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Library::clone(&self.state.borrow());
        let (result, changed) = f(&mut next);
        if changed {
            self.state.send_replace(Arc::new(next));
            if persist {
                self.writer.schedule();
            }
        }
        result
    }

    /// Run an arbitrary transformation as a single commit.
    ///
    /// The snapshot is published (and a save scheduled) only when the
    /// library actually differs afterwards.
    pub fn apply<R>(&self, f: impl FnOnce(&mut Library) -> R) -> R {
        self.commit(true, |lib| {
            let before = lib.clone();
            let result = f(lib);
            let changed = *lib != before;
            (result, changed)
        })
    }

    /// Replace the whole library.
    pub fn replace(&self, library: Library) {
        self.commit(true, |lib| {
            let changed = *lib != library;
            *lib = library;
            ((), changed)
        })
    }

    // ─── Categories ────────────────────────────────────────────────────────

    pub fn add_category(&self, new: NewCategory) -> LocalId {
        self.commit(true, |lib| (lib.push_category(new), true))
    }

    /// Returns `false` when the category is missing or nothing changed.
    pub fn update_category(&self, id: LocalId, update: &CategoryUpdate) -> bool {
        self.commit(true, |lib| {
            let changed = lib
                .category_mut(id)
                .is_some_and(|c| update.apply(c));
            (changed, changed)
        })
    }

    /// Remove a category and its images, returning what was removed.
    pub fn delete_category(&self, id: LocalId) -> Option<Category> {
        self.commit(true, |lib| {
            let removed = lib
                .categories
                .iter()
                .position(|c| c.local_id == id)
                .map(|pos| lib.categories.remove(pos));
            let changed = removed.is_some();
            (removed, changed)
        })
    }

    /// Link a category to its remote row. Returns `false` when the category
    /// no longer exists.
    pub fn set_category_remote_id(&self, id: LocalId, remote_id: RemoteId) -> bool {
        self.commit(true, |lib| match lib.category_mut(id) {
            Some(c) => {
                let changed = c.remote_id != Some(remote_id);
                c.remote_id = Some(remote_id);
                (true, changed)
            }
            None => (false, false),
        })
    }

    // ─── Images ────────────────────────────────────────────────────────────

    /// Append images to a category. Returns their client ids, or `None` when
    /// the category does not exist.
    pub fn add_images(&self, category: LocalId, images: Vec<Image>) -> Option<Vec<Uuid>> {
        self.commit(true, |lib| match lib.category_mut(category) {
            Some(c) if !images.is_empty() => {
                let ids = images.iter().map(|i| i.client_id).collect();
                c.images.extend(images);
                (Some(ids), true)
            }
            Some(_) => (Some(Vec::new()), false),
            None => (None, false),
        })
    }

    /// Update the image at `index` within a category (UI addressing).
    pub fn update_image(&self, category: LocalId, index: usize, update: &ImageUpdate) -> bool {
        self.commit(true, |lib| {
            let changed = lib
                .category_mut(category)
                .and_then(|c| c.images.get_mut(index))
                .is_some_and(|i| update.apply(i));
            (changed, changed)
        })
    }

    /// Update an image by client id (engine addressing).
    pub fn update_image_by_id(&self, client_id: Uuid, update: &ImageUpdate) -> bool {
        self.commit(true, |lib| {
            let changed = lib
                .find_image_mut(client_id)
                .is_some_and(|i| update.apply(i));
            (changed, changed)
        })
    }

    /// Remove the image at `index` within a category.
    pub fn delete_image(&self, category: LocalId, index: usize) -> Option<Image> {
        self.commit(true, |lib| {
            let removed = lib
                .category_mut(category)
                .filter(|c| index < c.images.len())
                .map(|c| c.images.remove(index));
            let changed = removed.is_some();
            (removed, changed)
        })
    }

    /// Apply one update to several images of a category. Returns how many changed.
    pub fn bulk_update_images(
        &self,
        category: LocalId,
        indices: &[usize],
        update: &ImageUpdate,
    ) -> usize {
        self.commit(true, |lib| {
            let Some(c) = lib.category_mut(category) else {
                return (0, false);
            };
            let mut count = 0;
            for &index in indices {
                if let Some(image) = c.images.get_mut(index) {
                    if update.apply(image) {
                        count += 1;
                    }
                }
            }
            (count, count > 0)
        })
    }

    /// Move an image through the transfer status machine.
    ///
    /// `Uploading` is published for observers but does not schedule a save.
    pub fn set_transfer_status(&self, client_id: Uuid, status: TransferStatus) -> bool {
        let persist = status != TransferStatus::Uploading;
        let changed = self.commit(persist, |lib| {
            let changed = match lib.find_image_mut(client_id) {
                Some(i) if i.transfer_status != status => {
                    i.transfer_status = status;
                    true
                }
                _ => false,
            };
            (changed, changed)
        });
        if changed {
            self.events
                .emit(SyncEvent::TransferStatusChanged { client_id, status });
        }
        changed
    }

    /// Record a completed binary transfer: object key, stored size, `Uploaded`.
    pub fn record_transfer(&self, client_id: Uuid, object_key: &str, size_bytes: u64) -> bool {
        let changed = self.commit(true, |lib| match lib.find_image_mut(client_id) {
            Some(i) => {
                i.remote_object_key = Some(object_key.to_string());
                i.size_bytes = size_bytes;
                i.transfer_status = TransferStatus::Uploaded;
                (true, true)
            }
            None => (false, false),
        });
        if changed {
            self.events.emit(SyncEvent::TransferStatusChanged {
                client_id,
                status: TransferStatus::Uploaded,
            });
        } else {
            debug!(
                subsystem = SUBSYSTEM_STORE,
                component = "entities",
                %client_id,
                object_key,
                "Transfer finished for an image that no longer exists"
            );
        }
        changed
    }

    /// Link an image to its remote row. Returns `false` when the image no
    /// longer exists.
    pub fn set_image_remote_id(&self, client_id: Uuid, remote_id: RemoteId) -> bool {
        self.commit(true, |lib| match lib.find_image_mut(client_id) {
            Some(i) => {
                let changed = i.remote_id != Some(remote_id);
                i.remote_id = Some(remote_id);
                (true, changed)
            }
            None => (false, false),
        })
    }

    // ─── Persistence ───────────────────────────────────────────────────────

    /// Persist now, bypassing the debounce but after any in-flight write.
    pub async fn force_save(&self) -> Result<()> {
        self.writer.flush().await
    }

    /// Final flush; the store stays readable but no longer persists.
    pub async fn close(&self) -> Result<()> {
        self.writer.shutdown().await
    }

    /// Number of physical writes performed so far.
    pub fn write_count(&self) -> u64 {
        self.writer.write_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use vitrine_core::BinaryRef;

    async fn store() -> (MemoryBackend, EntityStore) {
        let backend = MemoryBackend::new();
        let durable = DurableStore::new(Arc::new(backend.clone()), "vitrine");
        let store = EntityStore::load(
            durable,
            "library:alice",
            Duration::from_millis(500),
            EventBus::default(),
        )
        .await
        .unwrap();
        (backend, store)
    }

    fn image(name: &str) -> Image {
        Image::new(BinaryRef::inline(name.as_bytes().to_vec()), name)
    }

    #[tokio::test]
    async fn test_mutations_produce_new_snapshots() {
        let (_, store) = store().await;
        let before = store.snapshot();
        let id = store.add_category(NewCategory::new("Portraits"));
        let after = store.snapshot();

        assert!(before.categories.is_empty());
        assert_eq!(after.category(id).unwrap().name, "Portraits");
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_noop_update_keeps_snapshot() {
        let (_, store) = store().await;
        let id = store.add_category(NewCategory::new("A"));
        let before = store.snapshot();

        let same = CategoryUpdate {
            name: Some("A".into()),
            ..Default::default()
        };
        assert!(!store.update_category(id, &same));
        assert!(!store.update_category(LocalId(99), &same));
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[tokio::test]
    async fn test_image_addressing_by_index_and_id() {
        let (_, store) = store().await;
        let cat = store.add_category(NewCategory::new("A"));
        let ids = store
            .add_images(cat, vec![image("one"), image("two"), image("three")])
            .unwrap();
        assert!(store.add_images(LocalId(42), vec![image("x")]).is_none());

        let fav = ImageUpdate {
            is_favorite: Some(true),
            ..Default::default()
        };
        assert_eq!(store.bulk_update_images(cat, &[0, 2, 7], &fav), 2);

        let removed = store.delete_image(cat, 1).unwrap();
        assert_eq!(removed.client_id, ids[1]);
        assert!(store.delete_image(cat, 5).is_none());

        let rename = ImageUpdate {
            pose_name: Some("renamed".into()),
            ..Default::default()
        };
        assert!(store.update_image_by_id(ids[2], &rename));
        let snap = store.snapshot();
        let c = snap.category(cat).unwrap();
        assert_eq!(c.images.len(), 2);
        assert_eq!(c.images[1].pose_name, "renamed");
        assert!(c.images.iter().all(|i| i.is_favorite));
    }

    #[tokio::test]
    async fn test_transfer_status_emits_events() {
        let (_, store) = store().await;
        let mut events = store.events().subscribe();
        let cat = store.add_category(NewCategory::new("A"));
        let id = store.add_images(cat, vec![image("one")]).unwrap()[0];

        assert!(store.set_transfer_status(id, TransferStatus::Uploading));
        assert!(!store.set_transfer_status(id, TransferStatus::Uploading));
        assert!(store.record_transfer(id, "users/alice/one.jpg", 3));

        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::TransferStatusChanged {
                client_id: id,
                status: TransferStatus::Uploading
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::TransferStatusChanged {
                client_id: id,
                status: TransferStatus::Uploaded
            }
        );

        let snap = store.snapshot();
        let (_, img) = snap.find_image(id).unwrap();
        assert_eq!(img.remote_object_key.as_deref(), Some("users/alice/one.jpg"));
        assert!(img.awaits_record());
    }

    #[tokio::test]
    async fn test_remote_id_backfill_reports_missing_entities() {
        let (_, store) = store().await;
        let cat = store.add_category(NewCategory::new("A"));
        let id = store.add_images(cat, vec![image("one")]).unwrap()[0];

        assert!(store.set_image_remote_id(id, 7));
        assert!(store.set_image_remote_id(id, 7));
        assert!(store.set_category_remote_id(cat, 3));

        store.delete_category(cat).unwrap();
        assert!(!store.set_category_remote_id(cat, 3));
        assert!(!store.set_image_remote_id(id, 7));
    }

    #[tokio::test]
    async fn test_force_save_writes_latest_snapshot() {
        let (backend, store) = store().await;
        store.add_category(NewCategory::new("A"));
        store.add_category(NewCategory::new("B"));
        store.force_save().await.unwrap();

        let raw = backend.peek("vitrine/library:alice").unwrap();
        let lib = schema::decode(&raw).unwrap();
        assert_eq!(lib.categories.len(), 2);
        assert_eq!(store.write_count(), 1);

        // Nothing changed since: no second physical write.
        store.force_save().await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_fails_load() {
        let backend = MemoryBackend::new();
        backend.seed("vitrine/library:alice", "{not json");
        let durable = DurableStore::new(Arc::new(backend), "vitrine");
        let result = EntityStore::load(
            durable,
            "library:alice",
            Duration::from_millis(500),
            EventBus::default(),
        )
        .await;
        assert!(result.is_err());
    }
}
