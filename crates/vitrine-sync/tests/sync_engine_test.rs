//! End-to-end tests of the sync engine against in-memory collaborators:
//! full pull, incremental merge, the upload pipeline under failure, identifier
//! hydration, the retry sweep, remote cleanup ordering and deletes that race
//! a remote create.
//!
//! Time is paused so retry backoff and the save debounce run instantly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vitrine_core::{
    BinaryOptimizer, BinaryRef, CategoryUpdate, Image, ImageUpdate, Library, NewCategory,
    NewRemoteCategory, NewRemoteImage, ObjectStorage, OptimizeOptions, RemoteCategory, RemoteId,
    RemoteImage, RemoteMetadataStore, Result, Session, StoredObject, SyncEvent, TransferStatus,
};
use vitrine_remote::mock::{MockMetadataStore, MockObjectStorage};
use vitrine_store::{schema, DurableStore, MemoryBackend};
use vitrine_sync::upload::upload_name;
use vitrine_sync::{Collaborators, ItemOutcome, RemoteOutcome, SyncConfig, SyncEngine};

const USER: &str = "alice";
const STORED_KEY: &str = "vitrine/library:alice";

/// Sends bytes unchanged so tests can compare what was stored.
struct Passthrough;

impl BinaryOptimizer for Passthrough {
    fn optimize(&self, raw: &[u8], _options: &OptimizeOptions) -> Result<Vec<u8>> {
        Ok(raw.to_vec())
    }
}

async fn open_engine(
    backend: &MemoryBackend,
    metadata: &MockMetadataStore,
    storage: Arc<dyn ObjectStorage>,
) -> SyncEngine {
    open_engine_with(backend, Arc::new(metadata.clone()), storage).await
}

async fn open_engine_with(
    backend: &MemoryBackend,
    remote: Arc<dyn RemoteMetadataStore>,
    storage: Arc<dyn ObjectStorage>,
) -> SyncEngine {
    let session = Session::new(USER, "token").unwrap();
    let durable = DurableStore::new(Arc::new(backend.clone()), "vitrine");
    let collaborators = Collaborators {
        remote,
        storage,
        optimizer: Arc::new(Passthrough),
    };
    let config = SyncConfig::default().with_upload_workers(3);
    SyncEngine::open(session, durable, collaborators, config)
        .await
        .unwrap()
}

fn images(n: u8) -> Vec<Image> {
    (0..n)
        .map(|i| Image::new(BinaryRef::inline(vec![i; 32]), format!("pose-{i}")))
        .collect()
}

fn persisted(backend: &MemoryBackend) -> Library {
    schema::decode(&backend.peek(STORED_KEY).unwrap()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_full_pull_on_empty_library() {
    let metadata = MockMetadataStore::new();
    let portraits = metadata.seed_category(USER, "Portraits");
    let landscapes = metadata.seed_category(USER, "Landscapes");
    metadata.seed_image(USER, portraits, "objects/p1.jpg");
    metadata.seed_image(USER, portraits, "objects/p2.jpg");
    metadata.seed_image(USER, landscapes, "objects/l1.jpg");
    metadata.seed_category("bob", "Not mine");

    let storage = MockObjectStorage::new().break_fetch("objects/l1.jpg");
    storage.seed("objects/p1.jpg", b"p1".to_vec());
    storage.seed("objects/p2.jpg", b"p2".to_vec());

    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(storage.clone())).await;
    let mut events = engine.subscribe();

    let report = engine.sync_on_load().await.unwrap();
    assert!(report.merge.full_pull);
    assert!(report.sweep.uploads.items.is_empty());

    let lib = engine.snapshot();
    assert_eq!(lib.categories.len(), 2);
    assert_eq!(lib.image_count(), 3);
    for image in lib.categories.iter().flat_map(|c| c.images.iter()) {
        assert_eq!(image.transfer_status, TransferStatus::Uploaded);
        assert!(image.remote_id.is_some());
    }

    let l1 = lib
        .categories
        .iter()
        .flat_map(|c| c.images.iter())
        .find(|i| i.remote_object_key.as_deref() == Some("objects/l1.jpg"))
        .unwrap();
    assert_eq!(
        l1.binary,
        BinaryRef::Url {
            url: "https://public.storage.test/objects/l1.jpg".into()
        }
    );
    let p1 = lib
        .categories
        .iter()
        .flat_map(|c| c.images.iter())
        .find(|i| i.remote_object_key.as_deref() == Some("objects/p1.jpg"))
        .unwrap();
    assert!(p1.binary.is_local());

    let mut saw_completion = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::SyncCompleted { full_pull, categories } = event {
            assert!(full_pull);
            assert_eq!(categories, 2);
            saw_completion = true;
        }
    }
    assert!(saw_completion);

    engine.close().await.unwrap();
    assert_eq!(persisted(&backend).image_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_merge_adds_updates_and_drops_tombstoned_category() {
    let metadata = MockMetadataStore::new();
    let portraits = metadata.seed_category(USER, "Portraits");
    let travel = metadata.seed_category(USER, "Travel");
    metadata.seed_image(USER, portraits, "objects/a.jpg");
    metadata.seed_image(USER, portraits, "objects/b.jpg");
    metadata.seed_image(USER, travel, "objects/t.jpg");

    let storage = MockObjectStorage::new();
    for key in ["objects/a.jpg", "objects/b.jpg", "objects/t.jpg", "objects/c.jpg"] {
        storage.seed(key, key.as_bytes().to_vec());
    }

    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(storage)).await;
    assert!(engine.sync_on_load().await.unwrap().merge.full_pull);

    // Changes made on another device.
    metadata.seed_image(USER, portraits, "objects/c.jpg");
    metadata.tombstone_category(travel);
    metadata.edit_category(portraits, |c| c.notes = "from phone".into());

    let report = engine.sync_on_load().await.unwrap();
    assert!(!report.merge.full_pull);
    assert_eq!(report.merge.images_added, 1);
    assert_eq!(report.merge.categories_updated, 1);
    assert_eq!(report.merge.removed_categories.len(), 1);

    let lib = engine.snapshot();
    assert_eq!(lib.categories.len(), 1);
    let local = &lib.categories[0];
    assert_eq!(local.remote_id, Some(portraits));
    assert_eq!(local.notes, "from phone");
    assert_eq!(local.images.len(), 3);
    assert!(lib.category_by_remote_id(travel).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_merge_applies_image_edits_and_tombstones_but_spares_failed_listing() {
    let metadata = MockMetadataStore::new();
    let portraits = metadata.seed_category(USER, "Portraits");
    let travel = metadata.seed_category(USER, "Travel");
    let a = metadata.seed_image(USER, portraits, "objects/a.jpg");
    let b = metadata.seed_image(USER, portraits, "objects/b.jpg");
    let t = metadata.seed_image(USER, travel, "objects/t.jpg");

    let storage = MockObjectStorage::new();
    for key in ["objects/a.jpg", "objects/b.jpg", "objects/t.jpg"] {
        storage.seed(key, key.as_bytes().to_vec());
    }

    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(storage)).await;
    assert!(engine.sync_on_load().await.unwrap().merge.full_pull);

    metadata.edit_image(a, |i| i.tags = vec!["golden".into(), "studio".into()]);
    metadata.tombstone_image(b);
    // Travel's listing is unreadable, so its tombstone must not be applied.
    metadata.tombstone_image(t);
    metadata.script_listing_failure(travel);

    let report = engine.sync_on_load().await.unwrap();
    assert!(!report.merge.full_pull);
    assert_eq!(report.merge.images_updated, 1);
    assert_eq!(report.merge.images_removed, 1);
    assert_eq!(report.merge.skipped_listings, vec![travel]);
    assert!(report.merge.removed_categories.is_empty());

    let lib = engine.snapshot();
    let local_portraits = lib.category_by_remote_id(portraits).unwrap();
    assert_eq!(local_portraits.images.len(), 1);
    assert_eq!(local_portraits.images[0].remote_id, Some(a));
    assert_eq!(local_portraits.images[0].tags, ["golden", "studio"]);
    let local_travel = lib.category_by_remote_id(travel).unwrap();
    assert_eq!(local_travel.images.len(), 1);
    assert_eq!(local_travel.images[0].remote_id, Some(t));
}

#[tokio::test(start_paused = true)]
async fn test_offline_category_survives_merge_and_is_pushed() {
    let metadata = MockMetadataStore::new().fail_next("create_category", 1);
    let portraits = metadata.seed_category(USER, "Portraits");
    metadata.seed_image(USER, portraits, "objects/a.jpg");

    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(MockObjectStorage::new())).await;
    engine.sync_on_load().await.unwrap();

    let added = engine.add_category(NewCategory::new("Drafts")).await;
    assert!(matches!(added.remote, RemoteOutcome::Failed { .. }));

    let report = engine.sync_on_load().await.unwrap();
    assert!(report.merge.removed_categories.is_empty());
    assert_eq!(report.sweep.categories.len(), 1);
    assert!(matches!(
        report.sweep.categories[0].1,
        RemoteOutcome::Created { .. }
    ));
    assert!(engine
        .snapshot()
        .category(added.local_id)
        .unwrap()
        .remote_id
        .is_some());
}

/// Five images through three workers; the second fails every attempt.
#[tokio::test(start_paused = true)]
async fn test_upload_batch_with_one_permanent_failure() {
    let metadata = MockMetadataStore::new();
    let storage = MockObjectStorage::new();
    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(storage.clone())).await;

    let category = engine.add_category(NewCategory::new("Portraits")).await;
    assert!(matches!(category.remote, RemoteOutcome::Created { .. }));

    let batch = images(5);
    let ids: Vec<_> = batch.iter().map(|i| i.client_id).collect();
    let broken = upload_name(ids[1]);
    storage.script_upload_failures(&broken, 4);

    let report = engine.add_images(category.local_id, batch).await.unwrap();
    assert_eq!(report.uploaded(), 4);
    assert_eq!(report.failed(), 1);
    assert!(report.persist_error.is_none());

    match report.outcome(ids[1]).unwrap() {
        ItemOutcome::Failed { attempts, quota, .. } => {
            assert_eq!(*attempts, 4);
            assert!(!quota);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(storage.upload_attempts(&broken), 4);

    // The batch ends with a forced save, so the durable record is current.
    let stored = persisted(&backend);
    for (i, id) in ids.iter().enumerate() {
        let (_, image) = stored.find_image(*id).unwrap();
        if i == 1 {
            assert_eq!(image.transfer_status, TransferStatus::Failed);
            assert!(image.remote_object_key.is_none());
        } else {
            assert_eq!(image.transfer_status, TransferStatus::Uploaded);
            assert!(image.remote_id.is_some());
        }
    }
    assert_eq!(metadata.live_images().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_worker_pool_never_exceeds_configured_size() {
    let metadata = MockMetadataStore::new();
    let storage = MockObjectStorage::new().with_latency(Duration::from_millis(50));
    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(storage.clone())).await;

    let category = engine.add_category(NewCategory::new("Portraits")).await;
    let report = engine.add_images(category.local_id, images(9)).await.unwrap();

    assert_eq!(report.uploaded(), 9);
    assert!(storage.max_in_flight() <= 3);
    assert_eq!(storage.object_count(), 9);
}

#[tokio::test(start_paused = true)]
async fn test_file_backed_image_is_read_at_upload_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("studio.jpg");
    std::fs::write(&path, b"file bytes").unwrap();

    let metadata = MockMetadataStore::new();
    let storage = MockObjectStorage::new();
    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(storage.clone())).await;

    let category = engine.add_category(NewCategory::new("Studio")).await;
    let image = Image::new(BinaryRef::File { path }, "studio");
    let id = image.client_id;
    let report = engine
        .add_images(category.local_id, vec![image])
        .await
        .unwrap();
    assert_eq!(report.uploaded(), 1);

    let lib = engine.snapshot();
    let key = lib.find_image(id).unwrap().1.remote_object_key.clone().unwrap();
    assert_eq!(storage.object(&key).unwrap(), b"file bytes".to_vec());
}

/// A transfer finished while the category was unlinked gets its record on the
/// next sweep without being sent again.
#[tokio::test(start_paused = true)]
async fn test_deferred_record_is_created_by_retry_sweep() {
    let metadata = MockMetadataStore::new().fail_next("create_category", 1);
    let storage = MockObjectStorage::new();
    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(storage.clone())).await;

    let category = engine.add_category(NewCategory::new("Portraits")).await;
    assert!(matches!(category.remote, RemoteOutcome::Failed { .. }));

    let batch = images(1);
    let id = batch[0].client_id;
    let report = engine.add_images(category.local_id, batch).await.unwrap();
    assert_eq!(report.outcome(id), Some(&ItemOutcome::Deferred));
    {
        let lib = engine.snapshot();
        let image = lib.find_image(id).unwrap().1;
        assert_eq!(image.transfer_status, TransferStatus::Uploaded);
        assert!(image.awaits_record());
    }

    let sweep = engine.retry_pending().await;
    assert_eq!(sweep.categories.len(), 1);
    assert!(matches!(
        sweep.uploads.outcome(id),
        Some(ItemOutcome::Uploaded { .. })
    ));
    assert_eq!(storage.upload_attempts(&upload_name(id)), 1);
    assert!(engine.snapshot().find_image(id).unwrap().1.remote_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_hydration_links_by_name_and_key_and_is_idempotent() {
    let metadata = MockMetadataStore::new().fail_next("create_category", 1);
    let storage = MockObjectStorage::new();
    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(storage)).await;

    // Created offline; the remote row appears later from another device.
    let category = engine.add_category(NewCategory::new("Portraits")).await;
    let batch = images(1);
    let id = batch[0].client_id;
    engine.add_images(category.local_id, batch).await.unwrap();
    let key = engine
        .snapshot()
        .find_image(id)
        .unwrap()
        .1
        .remote_object_key
        .clone()
        .unwrap();

    let remote_category = metadata.seed_category(USER, "Portraits");
    let remote_image = metadata.seed_image(USER, remote_category, &key);

    let first = engine.hydrate_identifiers().await.unwrap();
    assert_eq!(first.categories, 1);
    assert_eq!(first.images, 1);
    let lib = engine.snapshot();
    assert_eq!(
        lib.category(category.local_id).unwrap().remote_id,
        Some(remote_category)
    );
    assert_eq!(lib.find_image(id).unwrap().1.remote_id, Some(remote_image));

    let second = engine.hydrate_identifiers().await.unwrap();
    assert!(second.is_empty());
    assert_eq!(*engine.snapshot(), *lib);
}

#[tokio::test(start_paused = true)]
async fn test_linked_edits_reach_remote_rows() {
    let metadata = MockMetadataStore::new();
    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(MockObjectStorage::new())).await;

    let category = engine.add_category(NewCategory::new("Portraits")).await;
    let RemoteOutcome::Created { remote_id } = category.remote else {
        panic!("category not created remotely");
    };

    let update = CategoryUpdate {
        notes: Some("golden hour".into()),
        ..Default::default()
    };
    let edit = engine.update_category(category.local_id, &update).await;
    assert!(edit.changed);
    assert_eq!(edit.remote, RemoteOutcome::Applied);
    assert_eq!(metadata.category(remote_id).unwrap().notes, "golden hour");

    let again = engine.update_category(category.local_id, &update).await;
    assert!(!again.changed);
    assert_eq!(again.remote, RemoteOutcome::Skipped);
}

/// Object storage that records, at every delete, how many image and category
/// row deletes the metadata store had seen.
struct DeleteOrderRecorder {
    inner: MockObjectStorage,
    metadata: MockMetadataStore,
    seen: std::sync::Mutex<Vec<(usize, usize)>>,
}

#[async_trait]
impl ObjectStorage for DeleteOrderRecorder {
    async fn upload(&self, bytes: &[u8], name: &str, auth_token: &str) -> Result<StoredObject> {
        self.inner.upload(bytes, name, auth_token).await
    }

    async fn fetch(&self, key: &str, auth_token: &str) -> Result<Vec<u8>> {
        self.inner.fetch(key, auth_token).await
    }

    async fn delete(&self, key: &str, auth_token: &str) -> Result<()> {
        self.seen.lock().unwrap().push((
            self.metadata.call_count("delete_image"),
            self.metadata.call_count("delete_category"),
        ));
        self.inner.delete(key, auth_token).await
    }

    fn public_url(&self, key: &str) -> String {
        self.inner.public_url(key)
    }
}

#[tokio::test(start_paused = true)]
async fn test_category_delete_removes_rows_then_objects_then_category() {
    let metadata = MockMetadataStore::new();
    let storage = MockObjectStorage::new();
    let recorder = Arc::new(DeleteOrderRecorder {
        inner: storage.clone(),
        metadata: metadata.clone(),
        seen: Default::default(),
    });
    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, recorder.clone()).await;

    let category = engine.add_category(NewCategory::new("Portraits")).await;
    let RemoteOutcome::Created { remote_id } = category.remote else {
        panic!("category not created remotely");
    };
    engine.add_images(category.local_id, images(2)).await.unwrap();
    assert_eq!(storage.object_count(), 2);

    let report = engine.delete_category(category.local_id).await.unwrap();
    assert!(engine.snapshot().category(category.local_id).is_none());
    assert_eq!(report.image_rows_deleted, 2);
    assert_eq!(report.objects_deleted, 2);
    assert!(report.category_row_deleted);
    assert!(report.failures.is_empty());

    assert_eq!(*recorder.seen.lock().unwrap(), vec![(2, 0), (2, 0)]);
    let ops: Vec<String> = metadata
        .calls()
        .into_iter()
        .map(|c| c.operation)
        .filter(|op| op.starts_with("delete"))
        .collect();
    assert_eq!(ops, ["delete_image", "delete_image", "delete_category"]);
    assert!(metadata.is_category_deleted(remote_id));
    assert_eq!(storage.object_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_library_survives_reopen() {
    let metadata = MockMetadataStore::new();
    let backend = MemoryBackend::new();
    let engine = open_engine(&backend, &metadata, Arc::new(MockObjectStorage::new())).await;
    let category = engine.add_category(NewCategory::new("Portraits")).await;
    engine.add_images(category.local_id, images(2)).await.unwrap();
    let before = engine.snapshot();
    engine.close().await.unwrap();

    let reopened = open_engine(&backend, &metadata, Arc::new(MockObjectStorage::new())).await;
    assert_eq!(*reopened.snapshot(), *before);
}

/// Metadata store whose creates take a while to answer, leaving room for a
/// local delete in between.
struct SlowCreates {
    inner: MockMetadataStore,
    delay: Duration,
}

#[async_trait]
impl RemoteMetadataStore for SlowCreates {
    async fn list_categories(&self, session: &Session) -> Result<Vec<RemoteCategory>> {
        self.inner.list_categories(session).await
    }

    async fn list_images(
        &self,
        session: &Session,
        category_id: RemoteId,
    ) -> Result<Vec<RemoteImage>> {
        self.inner.list_images(session, category_id).await
    }

    async fn list_all_images(&self, session: &Session) -> Result<Vec<RemoteImage>> {
        self.inner.list_all_images(session).await
    }

    async fn create_category(
        &self,
        session: &Session,
        req: &NewRemoteCategory,
    ) -> Result<RemoteCategory> {
        tokio::time::sleep(self.delay).await;
        self.inner.create_category(session, req).await
    }

    async fn update_category(
        &self,
        session: &Session,
        id: RemoteId,
        update: &CategoryUpdate,
    ) -> Result<()> {
        self.inner.update_category(session, id, update).await
    }

    async fn delete_category(&self, session: &Session, id: RemoteId) -> Result<()> {
        self.inner.delete_category(session, id).await
    }

    async fn create_image(
        &self,
        session: &Session,
        category_id: RemoteId,
        req: &NewRemoteImage,
    ) -> Result<RemoteImage> {
        tokio::time::sleep(self.delay).await;
        self.inner.create_image(session, category_id, req).await
    }

    async fn update_image(
        &self,
        session: &Session,
        id: RemoteId,
        update: &ImageUpdate,
    ) -> Result<()> {
        self.inner.update_image(session, id, update).await
    }

    async fn delete_image(&self, session: &Session, id: RemoteId) -> Result<()> {
        self.inner.delete_image(session, id).await
    }
}

fn slow_creates(metadata: &MockMetadataStore) -> Arc<dyn RemoteMetadataStore> {
    Arc::new(SlowCreates {
        inner: metadata.clone(),
        delay: Duration::from_millis(100),
    })
}

#[tokio::test(start_paused = true)]
async fn test_category_deleted_during_remote_create_stays_deleted() {
    let metadata = MockMetadataStore::new();
    let backend = MemoryBackend::new();
    let engine = open_engine_with(
        &backend,
        slow_creates(&metadata),
        Arc::new(MockObjectStorage::new()),
    )
    .await;

    let local_id = (*engine.snapshot()).clone().allocate_id();
    let (added, deleted) = tokio::join!(engine.add_category(NewCategory::new("Oops")), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.delete_category(local_id).await
    });
    assert_eq!(added.local_id, local_id);
    assert!(!deleted.unwrap().category_row_deleted);

    let RemoteOutcome::Discarded {
        remote_id,
        cleanup_error,
    } = added.remote
    else {
        panic!("unexpected outcome {:?}", added.remote);
    };
    assert!(cleanup_error.is_none());
    assert!(metadata.is_category_deleted(remote_id));

    let report = engine.sync_on_load().await.unwrap();
    assert_eq!(report.merge.categories_added, 0);
    assert!(engine.snapshot().categories.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_image_deleted_during_record_create_leaves_nothing_remote() {
    let metadata = MockMetadataStore::new();
    let storage = MockObjectStorage::new();
    let backend = MemoryBackend::new();
    let engine = open_engine_with(
        &backend,
        slow_creates(&metadata),
        Arc::new(storage.clone()),
    )
    .await;

    let category = engine.add_category(NewCategory::new("Portraits")).await;
    assert!(matches!(category.remote, RemoteOutcome::Created { .. }));

    let batch = images(1);
    let id = batch[0].client_id;
    let (report, deleted) = tokio::join!(engine.add_images(category.local_id, batch), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.delete_image(category.local_id, 0).await
    });
    assert!(deleted.is_some());

    let report = report.unwrap();
    assert_eq!(
        report.outcome(id),
        Some(&ItemOutcome::Discarded {
            cleanup_error: None
        })
    );
    assert_eq!(report.uploaded(), 0);
    assert!(metadata.live_images().is_empty());
    assert_eq!(storage.object_count(), 0);

    engine.sync_on_load().await.unwrap();
    let lib = engine.snapshot();
    assert!(lib.category(category.local_id).unwrap().images.is_empty());
}
