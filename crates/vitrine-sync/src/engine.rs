//! The operation surface used by a UI or the daemon.
//!
//! A [`SyncEngine`] lives for one login: it is opened with a [`Session`] and
//! closed on logout. Local mutations apply immediately and never fail for
//! expected conditions; their remote side effects are best-effort and come
//! back as reports instead of errors.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument, warn};

use vitrine_core::defaults::EVENT_BUS_CAPACITY;
use vitrine_core::logging::SUBSYSTEM_SYNC;
use vitrine_core::{
    BinaryOptimizer, Category, CategoryUpdate, EventBus, Image, ImageUpdate, Library, LocalId,
    NewCategory, NewRemoteCategory, ObjectStorage, RemoteId, RemoteMetadataStore, Result,
    Session, SyncEvent,
};
use vitrine_store::{DurableStore, EntityStore};

use crate::config::SyncConfig;
use crate::hydrate::{hydrate, HydrationReport};
use crate::reconcile::{MergeReport, Reconciler};
use crate::upload::{pending_work, BatchReport, UploadPipeline};

/// Remote collaborators of an engine.
#[derive(Clone)]
pub struct Collaborators {
    pub remote: Arc<dyn RemoteMetadataStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub optimizer: Arc<dyn BinaryOptimizer>,
}

/// Result of a best-effort remote side effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteOutcome {
    /// A remote row was created.
    Created { remote_id: RemoteId },
    /// The change was applied to an existing remote row.
    Applied,
    /// Nothing to send: no local change, or the entity is not linked yet.
    Skipped,
    /// The remote call failed; local state is kept.
    Failed { error: String },
    /// The entity was deleted locally while its row was being created, so
    /// the new row was deleted again. `cleanup_error` is set when that
    /// delete failed.
    Discarded {
        remote_id: RemoteId,
        cleanup_error: Option<String>,
    },
}

impl RemoteOutcome {
    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Applied,
            Err(e) => Self::Failed {
                error: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryAdded {
    pub local_id: LocalId,
    pub remote: RemoteOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditReport {
    pub changed: bool,
    pub remote: RemoteOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkEditReport {
    pub changed: usize,
    pub remote_applied: usize,
    pub remote_failures: Vec<String>,
}

/// Remote cleanup after a local delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteReport {
    pub image_rows_deleted: usize,
    pub objects_deleted: usize,
    pub category_row_deleted: bool,
    pub failures: Vec<String>,
}

/// Result of the retry sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Local-only categories pushed to the remote store.
    pub categories: Vec<(LocalId, RemoteOutcome)>,
    pub uploads: BatchReport,
}

/// Result of a load-time sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub merge: MergeReport,
    pub sweep: SweepReport,
}

/// Session-scoped sync engine.
pub struct SyncEngine {
    session: Session,
    store: Arc<EntityStore>,
    remote: Arc<dyn RemoteMetadataStore>,
    storage: Arc<dyn ObjectStorage>,
    uploads: UploadPipeline,
    reconciler: Reconciler,
}

impl SyncEngine {
    /// Load the session's library from `durable` and wire the pipelines.
    pub async fn open(
        session: Session,
        durable: DurableStore,
        collaborators: Collaborators,
        config: SyncConfig,
    ) -> Result<Self> {
        let events = EventBus::new(EVENT_BUS_CAPACITY);
        let store = Arc::new(
            EntityStore::load(durable, session.library_key(), config.save_debounce, events)
                .await?,
        );
        let uploads = UploadPipeline::new(
            Arc::clone(&store),
            Arc::clone(&collaborators.remote),
            Arc::clone(&collaborators.storage),
            collaborators.optimizer,
            config.optimize,
            config.retry,
            config.upload_workers,
        );
        let reconciler = Reconciler::new(
            Arc::clone(&collaborators.remote),
            Arc::clone(&collaborators.storage),
            config.fetch_concurrency,
        );
        info!(
            subsystem = SUBSYSTEM_SYNC,
            component = "engine",
            user_id = session.user_id(),
            upload_workers = config.upload_workers,
            "Sync engine opened"
        );
        Ok(Self {
            session,
            store,
            remote: collaborators.remote,
            storage: collaborators.storage,
            uploads,
            reconciler,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<Library> {
        self.store.snapshot()
    }

    /// Receive every new library snapshot.
    pub fn watch(&self) -> watch::Receiver<Arc<Library>> {
        self.store.subscribe()
    }

    /// Receive engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.store.events().subscribe()
    }

    // ─── Categories ────────────────────────────────────────────────────────

    /// Add a category locally, then create its remote row.
    #[instrument(skip(self, new), fields(subsystem = SUBSYSTEM_SYNC, component = "engine"))]
    pub async fn add_category(&self, new: NewCategory) -> CategoryAdded {
        let local_id = self.store.add_category(new);
        let remote = self.push_category(local_id).await;
        CategoryAdded { local_id, remote }
    }

    async fn push_category(&self, local_id: LocalId) -> RemoteOutcome {
        let request = match self.store.snapshot().category(local_id) {
            Some(c) if c.is_local_only() => NewRemoteCategory::from(c),
            _ => return RemoteOutcome::Skipped,
        };
        match self.remote.create_category(&self.session, &request).await {
            Ok(row) if self.store.set_category_remote_id(local_id, row.id) => {
                RemoteOutcome::Created { remote_id: row.id }
            }
            Ok(row) => {
                let cleanup_error = self
                    .remote
                    .delete_category(&self.session, row.id)
                    .await
                    .err()
                    .map(|e| e.to_string());
                warn!(
                    subsystem = SUBSYSTEM_SYNC,
                    component = "engine",
                    local_id = %local_id,
                    remote_id = row.id,
                    cleaned = cleanup_error.is_none(),
                    "Category deleted during remote create, row discarded"
                );
                RemoteOutcome::Discarded {
                    remote_id: row.id,
                    cleanup_error,
                }
            }
            Err(e) => {
                warn!(
                    subsystem = SUBSYSTEM_SYNC,
                    component = "engine",
                    local_id = %local_id,
                    error = %e,
                    "Remote category create failed, kept local-only"
                );
                RemoteOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Patch a category locally and, when linked, remotely.
    pub async fn update_category(&self, local_id: LocalId, update: &CategoryUpdate) -> EditReport {
        let changed = self.store.update_category(local_id, update);
        let remote_id = self
            .store
            .snapshot()
            .category(local_id)
            .and_then(|c| c.remote_id);
        let remote = match remote_id {
            Some(id) if changed => RemoteOutcome::from_result(
                self.remote.update_category(&self.session, id, update).await,
            ),
            _ => RemoteOutcome::Skipped,
        };
        EditReport { changed, remote }
    }

    /// Remove a category locally, then its image rows, objects, and finally
    /// its own row. Returns `None` when the category does not exist.
    #[instrument(skip(self), fields(subsystem = SUBSYSTEM_SYNC, component = "engine"))]
    pub async fn delete_category(&self, local_id: LocalId) -> Option<DeleteReport> {
        let removed = self.store.delete_category(local_id)?;
        Some(self.delete_remote_category(removed).await)
    }

    async fn delete_remote_category(&self, category: Category) -> DeleteReport {
        let mut report = DeleteReport::default();
        for image in &category.images {
            if let Some(id) = image.remote_id {
                match self.remote.delete_image(&self.session, id).await {
                    Ok(()) => report.image_rows_deleted += 1,
                    Err(e) => report.failures.push(format!("image row {}: {}", id, e)),
                }
            }
        }
        for image in &category.images {
            if let Some(key) = &image.remote_object_key {
                match self.storage.delete(key, self.session.auth_token()).await {
                    Ok(()) => report.objects_deleted += 1,
                    Err(e) => report.failures.push(format!("object {}: {}", key, e)),
                }
            }
        }
        if let Some(id) = category.remote_id {
            match self.remote.delete_category(&self.session, id).await {
                Ok(()) => report.category_row_deleted = true,
                Err(e) => report.failures.push(format!("category row {}: {}", id, e)),
            }
        }
        if !report.failures.is_empty() {
            warn!(
                subsystem = SUBSYSTEM_SYNC,
                component = "engine",
                local_id = %category.local_id,
                failures = report.failures.len(),
                "Remote cleanup incomplete"
            );
        }
        report
    }

    // ─── Images ────────────────────────────────────────────────────────────

    /// Append images to a category and upload them. Returns `None` when the
    /// category does not exist.
    #[instrument(skip(self, images), fields(subsystem = SUBSYSTEM_SYNC, component = "engine", count = images.len()))]
    pub async fn add_images(&self, category: LocalId, images: Vec<Image>) -> Option<BatchReport> {
        let ids = self.store.add_images(category, images)?;
        Some(self.uploads.run(&self.session, &ids).await)
    }

    /// Patch one image (by position) locally and, when linked, remotely.
    pub async fn update_image(
        &self,
        category: LocalId,
        index: usize,
        update: &ImageUpdate,
    ) -> EditReport {
        let changed = self.store.update_image(category, index, update);
        let remote_id = self
            .store
            .snapshot()
            .category(category)
            .and_then(|c| c.images.get(index))
            .and_then(|i| i.remote_id);
        let remote = match remote_id {
            Some(id) if changed => RemoteOutcome::from_result(
                self.remote.update_image(&self.session, id, update).await,
            ),
            _ => RemoteOutcome::Skipped,
        };
        EditReport { changed, remote }
    }

    /// Apply one patch to several images of a category.
    pub async fn bulk_update_images(
        &self,
        category: LocalId,
        indices: &[usize],
        update: &ImageUpdate,
    ) -> BulkEditReport {
        let changed = self.store.bulk_update_images(category, indices, update);
        let mut report = BulkEditReport {
            changed,
            ..Default::default()
        };
        if changed == 0 || update.is_empty() {
            return report;
        }

        let snapshot = self.store.snapshot();
        let linked: Vec<RemoteId> = snapshot
            .category(category)
            .map(|c| {
                indices
                    .iter()
                    .filter_map(|&i| c.images.get(i).and_then(|img| img.remote_id))
                    .collect()
            })
            .unwrap_or_default();
        drop(snapshot);

        for id in linked {
            match self.remote.update_image(&self.session, id, update).await {
                Ok(()) => report.remote_applied += 1,
                Err(e) => report.remote_failures.push(format!("image row {}: {}", id, e)),
            }
        }
        report
    }

    /// Remove one image locally, then its row and object.
    pub async fn delete_image(&self, category: LocalId, index: usize) -> Option<DeleteReport> {
        let image = self.store.delete_image(category, index)?;
        let mut report = DeleteReport::default();
        if let Some(id) = image.remote_id {
            match self.remote.delete_image(&self.session, id).await {
                Ok(()) => report.image_rows_deleted += 1,
                Err(e) => report.failures.push(format!("image row {}: {}", id, e)),
            }
        }
        if let Some(key) = &image.remote_object_key {
            match self.storage.delete(key, self.session.auth_token()).await {
                Ok(()) => report.objects_deleted += 1,
                Err(e) => report.failures.push(format!("object {}: {}", key, e)),
            }
        }
        Some(report)
    }

    // ─── Sync ──────────────────────────────────────────────────────────────

    /// Reconcile against the remote store, then sweep unfinished uploads.
    ///
    /// Fails only when the remote category list cannot be read; the local
    /// library is untouched in that case.
    pub async fn sync_on_load(&self) -> Result<SyncReport> {
        let merge = self.reconciler.reconcile(&self.session, &self.store).await?;
        let sweep = self.sweep().await;
        Ok(SyncReport { merge, sweep })
    }

    /// Link local-only entities to remote rows by name and object key.
    #[instrument(skip(self), fields(subsystem = SUBSYSTEM_SYNC, component = "hydrate"))]
    pub async fn hydrate_identifiers(&self) -> Result<HydrationReport> {
        let categories = self.remote.list_categories(&self.session).await?;
        let images = self.remote.list_all_images(&self.session).await?;
        let report = self
            .store
            .apply(|lib| hydrate(lib, &categories, &images));
        self.store.events().emit(SyncEvent::HydrationCompleted {
            categories: report.categories,
            images: report.images,
        });
        info!(
            subsystem = SUBSYSTEM_SYNC,
            component = "hydrate",
            categories = report.categories,
            images = report.images,
            "Hydration completed"
        );
        Ok(report)
    }

    /// Hydrate, then push local-only categories and re-run unfinished uploads.
    ///
    /// When hydration fails, categories are not pushed so a lost create
    /// response cannot turn into a duplicate row.
    pub async fn retry_pending(&self) -> SweepReport {
        match self.hydrate_identifiers().await {
            Ok(_) => self.sweep().await,
            Err(e) => {
                warn!(
                    subsystem = SUBSYSTEM_SYNC,
                    component = "engine",
                    error = %e,
                    "Hydration failed, sweeping uploads only"
                );
                SweepReport {
                    categories: Vec::new(),
                    uploads: self.upload_pending().await,
                }
            }
        }
    }

    async fn sweep(&self) -> SweepReport {
        let local_only: Vec<LocalId> = self
            .store
            .snapshot()
            .categories
            .iter()
            .filter(|c| c.is_local_only())
            .map(|c| c.local_id)
            .collect();
        let mut categories = Vec::with_capacity(local_only.len());
        for local_id in local_only {
            categories.push((local_id, self.push_category(local_id).await));
        }
        SweepReport {
            categories,
            uploads: self.upload_pending().await,
        }
    }

    async fn upload_pending(&self) -> BatchReport {
        let ids = pending_work(&self.store.snapshot());
        self.uploads.run(&self.session, &ids).await
    }

    /// Flush and stop persisting. Call on logout.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        info!(
            subsystem = SUBSYSTEM_SYNC,
            component = "engine",
            user_id = self.session.user_id(),
            "Sync engine closed"
        );
        Ok(())
    }
}
