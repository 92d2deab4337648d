//! Reconciliation of the local library against the remote store.
//!
//! Remote state is fetched first (category list, per-category image lists,
//! then the binaries of images not present locally) and then folded into the
//! library in one synchronous commit, so no intermediate state is ever
//! published or persisted.
//!
//! A library with no images gets a **full pull**: linked categories are
//! rebuilt from remote data and local-only categories are kept. Otherwise
//! the **incremental merge** runs in four phases:
//!
//! 1. remote categories with no local counterpart are materialized;
//! 2. linked categories take remote metadata where it differs;
//! 3. remote images missing locally are appended and matched images take
//!    remote metadata (tags compared as sets);
//! 4. linked categories and images absent from the remote result are removed.
//!
//! Entities without a remote id are never removed. Categories whose image
//! listing failed skip phases 3 and 4.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use vitrine_core::logging::SUBSYSTEM_SYNC;
use vitrine_core::{
    BinaryRef, Category, Image, Library, LocalId, ObjectStorage, RemoteCategory, RemoteId,
    RemoteImage, RemoteMetadataStore, Result, Session, SyncEvent, TransferStatus,
};
use vitrine_store::EntityStore;

use crate::hydrate::hydrate_categories;

/// Everything fetched from the remote side for one reconciliation.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub categories: Vec<RemoteCategory>,
    /// Live images per category. Categories whose listing failed are absent.
    pub images: HashMap<RemoteId, Vec<RemoteImage>>,
    /// Binaries retrieved for images missing locally, by remote image id.
    pub binaries: HashMap<RemoteId, BinaryRef>,
}

impl RemoteSnapshot {
    fn listing(&self, category_id: RemoteId) -> Option<&[RemoteImage]> {
        self.images.get(&category_id).map(Vec::as_slice)
    }
}

/// What a reconciliation changed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub full_pull: bool,
    /// Local-only categories linked to remote ones by name.
    pub categories_linked: usize,
    pub categories_added: usize,
    /// Linked categories whose metadata changed.
    pub categories_updated: usize,
    pub images_added: usize,
    /// Images linked to remote rows by object key.
    pub images_linked: usize,
    pub images_updated: usize,
    pub images_removed: usize,
    pub removed_categories: Vec<LocalId>,
    /// Remote categories whose image listing failed.
    pub skipped_listings: Vec<RemoteId>,
}

// =============================================================================
// PURE MERGE
// =============================================================================

/// Overwrite `local` with `remote` when they differ.
fn take_remote<T: PartialEq + Clone>(local: &mut T, remote: &T) -> bool {
    if local != remote {
        *local = remote.clone();
        true
    } else {
        false
    }
}

fn same_tags(a: &[String], b: &[String]) -> bool {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}

fn reconcile_category_fields(local: &mut Category, remote: &RemoteCategory) -> bool {
    let mut changed = take_remote(&mut local.name, &remote.name);
    changed |= take_remote(&mut local.notes, &remote.notes);
    changed |= take_remote(&mut local.is_favorite, &remote.is_favorite);
    changed |= take_remote(&mut local.is_private, &remote.is_private);
    changed |= take_remote(&mut local.private_password_hash, &remote.password_hash);
    changed
}

fn reconcile_image_fields(local: &mut Image, remote: &RemoteImage) -> bool {
    let mut changed = take_remote(&mut local.pose_name, &remote.pose_name);
    changed |= take_remote(&mut local.notes, &remote.notes);
    changed |= take_remote(&mut local.is_favorite, &remote.is_favorite);
    if !same_tags(&local.tags, &remote.tags) {
        local.tags = remote.tags.clone();
        changed = true;
    }
    changed
}

fn materialize_image(
    remote: &RemoteImage,
    binaries: &HashMap<RemoteId, BinaryRef>,
    public_url: &dyn Fn(&str) -> String,
) -> Image {
    let binary = binaries
        .get(&remote.id)
        .cloned()
        .unwrap_or_else(|| BinaryRef::Url {
            url: public_url(&remote.object_key),
        });
    Image {
        client_id: Uuid::now_v7(),
        binary,
        pose_name: remote.pose_name.clone(),
        notes: remote.notes.clone(),
        tags: remote.tags.clone(),
        is_favorite: remote.is_favorite,
        date_added: remote.created_at,
        remote_object_key: Some(remote.object_key.clone()),
        remote_id: Some(remote.id),
        transfer_status: TransferStatus::Uploaded,
        size_bytes: u64::try_from(remote.size_bytes).unwrap_or(0),
    }
}

fn materialize_category(
    remote: &RemoteCategory,
    local_id: LocalId,
    images: &[RemoteImage],
    binaries: &HashMap<RemoteId, BinaryRef>,
    public_url: &dyn Fn(&str) -> String,
) -> Category {
    Category {
        local_id,
        name: remote.name.clone(),
        cover_image: remote.cover_image.clone(),
        notes: remote.notes.clone(),
        tags: remote.tags.clone(),
        is_favorite: remote.is_favorite,
        is_private: remote.is_private,
        private_password_hash: remote.password_hash.clone(),
        remote_id: Some(remote.id),
        images: images
            .iter()
            .map(|i| materialize_image(i, binaries, public_url))
            .collect(),
    }
}

/// Rebuild linked categories from remote data, keeping local-only ones.
pub fn full_pull(
    library: &mut Library,
    remote: &RemoteSnapshot,
    public_url: &dyn Fn(&str) -> String,
) -> MergeReport {
    let mut report = MergeReport {
        full_pull: true,
        ..Default::default()
    };

    // Keep the id counter above every id in use while categories are detached.
    let floor = library
        .categories
        .iter()
        .map(|c| c.local_id.0 + 1)
        .max()
        .unwrap_or(1);
    library.next_local_id = library.next_local_id.max(floor);

    let mut linked: HashMap<RemoteId, LocalId> = HashMap::new();
    let mut local_only = Vec::new();
    for category in std::mem::take(&mut library.categories) {
        match category.remote_id {
            Some(remote_id) => {
                linked.insert(remote_id, category.local_id);
            }
            None => local_only.push(category),
        }
    }

    for rc in &remote.categories {
        let local_id = match linked.remove(&rc.id) {
            Some(id) => id,
            None => library.allocate_id(),
        };
        let images = remote.listing(rc.id).unwrap_or_else(|| {
            report.skipped_listings.push(rc.id);
            &[][..]
        });
        let category = materialize_category(rc, local_id, images, &remote.binaries, public_url);
        report.categories_added += 1;
        report.images_added += category.images.len();
        library.categories.push(category);
    }

    let mut removed: Vec<LocalId> = linked.into_values().collect();
    removed.sort();
    report.removed_categories = removed;
    library.categories.extend(local_only);
    report
}

/// Four-phase incremental merge.
pub fn merge(
    library: &mut Library,
    remote: &RemoteSnapshot,
    public_url: &dyn Fn(&str) -> String,
) -> MergeReport {
    let mut report = MergeReport::default();
    let remote_ids: HashSet<RemoteId> = remote.categories.iter().map(|c| c.id).collect();

    // Phase 1: additive categories.
    let mut added = HashSet::new();
    for rc in &remote.categories {
        if library.category_by_remote_id(rc.id).is_some() {
            continue;
        }
        let images = remote.listing(rc.id).unwrap_or_else(|| {
            report.skipped_listings.push(rc.id);
            &[][..]
        });
        let local_id = library.allocate_id();
        let category = materialize_category(rc, local_id, images, &remote.binaries, public_url);
        report.categories_added += 1;
        report.images_added += category.images.len();
        library.categories.push(category);
        added.insert(rc.id);
    }

    // Phase 2: category metadata, remote wins.
    for rc in remote.categories.iter().filter(|rc| !added.contains(&rc.id)) {
        let Some(category) = library
            .categories
            .iter_mut()
            .find(|c| c.remote_id == Some(rc.id))
        else {
            continue;
        };
        if reconcile_category_fields(category, rc) {
            report.categories_updated += 1;
        }
    }

    // Phase 3: additive images and image metadata.
    for rc in remote.categories.iter().filter(|rc| !added.contains(&rc.id)) {
        let Some(listing) = remote.listing(rc.id) else {
            report.skipped_listings.push(rc.id);
            continue;
        };
        let Some(category) = library
            .categories
            .iter_mut()
            .find(|c| c.remote_id == Some(rc.id))
        else {
            continue;
        };
        for ri in listing {
            let position = category
                .images
                .iter()
                .position(|i| i.remote_id == Some(ri.id))
                .or_else(|| {
                    category.images.iter().position(|i| {
                        i.is_local_only()
                            && i.remote_object_key.as_deref() == Some(ri.object_key.as_str())
                    })
                });
            match position {
                Some(pos) => {
                    let image = &mut category.images[pos];
                    if image.remote_id.is_none() {
                        image.remote_id = Some(ri.id);
                        report.images_linked += 1;
                    }
                    if reconcile_image_fields(image, ri) {
                        report.images_updated += 1;
                    }
                }
                None => {
                    category
                        .images
                        .push(materialize_image(ri, &remote.binaries, public_url));
                    report.images_added += 1;
                }
            }
        }
    }

    // Phase 4: tombstones. Only entities the remote side has seen can go.
    library.categories.retain(|c| match c.remote_id {
        Some(id) if !remote_ids.contains(&id) => {
            report.removed_categories.push(c.local_id);
            false
        }
        _ => true,
    });
    for category in library.categories.iter_mut() {
        let Some(listing) = category.remote_id.and_then(|id| remote.listing(id)) else {
            continue;
        };
        let live: HashSet<RemoteId> = listing.iter().map(|i| i.id).collect();
        let before = category.images.len();
        category
            .images
            .retain(|i| i.remote_id.map_or(true, |id| live.contains(&id)));
        report.images_removed += before - category.images.len();
    }

    report
}

/// Link categories by name, then run a full pull or a merge.
pub fn reconcile_library(
    library: &mut Library,
    remote: &RemoteSnapshot,
    public_url: &dyn Fn(&str) -> String,
) -> MergeReport {
    let linked = hydrate_categories(library, &remote.categories);
    let mut report = if library.has_no_images() {
        full_pull(library, remote, public_url)
    } else {
        merge(library, remote, public_url)
    };
    report.categories_linked = linked;
    report
}

// =============================================================================
// REMOTE FETCH + COMMIT
// =============================================================================

/// Fetches remote state and commits reconciled snapshots.
pub struct Reconciler {
    remote: Arc<dyn RemoteMetadataStore>,
    storage: Arc<dyn ObjectStorage>,
    fetch_concurrency: usize,
}

impl Reconciler {
    pub fn new(
        remote: Arc<dyn RemoteMetadataStore>,
        storage: Arc<dyn ObjectStorage>,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            remote,
            storage,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// Fetch categories, per-category images, and the binaries of images
    /// `local` does not hold yet. Only the category listing is fatal.
    pub async fn fetch(&self, session: &Session, local: &Library) -> Result<RemoteSnapshot> {
        let categories = self.remote.list_categories(session).await?;

        let listings: Vec<(RemoteId, Result<Vec<RemoteImage>>)> =
            stream::iter(categories.iter().map(|c| async move {
                (c.id, self.remote.list_images(session, c.id).await)
            }))
            .buffer_unordered(self.fetch_concurrency)
            .collect()
            .await;

        let mut images = HashMap::new();
        for (category_id, listing) in listings {
            match listing {
                Ok(rows) => {
                    images.insert(category_id, rows);
                }
                Err(e) => warn!(
                    subsystem = SUBSYSTEM_SYNC,
                    component = "reconcile",
                    remote_id = category_id,
                    error = %e,
                    "Image listing failed, category left as is"
                ),
            }
        }

        let known_ids: HashSet<RemoteId> = local
            .categories
            .iter()
            .flat_map(|c| c.images.iter())
            .filter_map(|i| i.remote_id)
            .collect();
        let known_keys: HashSet<&str> = local
            .categories
            .iter()
            .flat_map(|c| c.images.iter())
            .filter_map(|i| i.remote_object_key.as_deref())
            .collect();
        let missing: Vec<&RemoteImage> = images
            .values()
            .flatten()
            .filter(|i| !known_ids.contains(&i.id) && !known_keys.contains(i.object_key.as_str()))
            .collect();

        let binaries = self.fetch_binaries(session, &missing).await;
        Ok(RemoteSnapshot {
            categories,
            images,
            binaries,
        })
    }

    /// Bounded fan-out over binary retrievals. A failed fetch degrades to the
    /// object's public URL.
    async fn fetch_binaries(
        &self,
        session: &Session,
        images: &[&RemoteImage],
    ) -> HashMap<RemoteId, BinaryRef> {
        stream::iter(images.iter().map(|image| async move {
            let binary = match self
                .storage
                .fetch(&image.object_key, session.auth_token())
                .await
            {
                Ok(bytes) => BinaryRef::inline(bytes),
                Err(e) => {
                    warn!(
                        subsystem = SUBSYSTEM_SYNC,
                        component = "reconcile",
                        object_key = %image.object_key,
                        error = %e,
                        "Binary fetch failed, using public URL"
                    );
                    BinaryRef::Url {
                        url: self.storage.public_url(&image.object_key),
                    }
                }
            };
            (image.id, binary)
        }))
        .buffer_unordered(self.fetch_concurrency)
        .collect()
        .await
    }

    /// Fetch, reconcile and commit once.
    #[instrument(skip(self, session, store), fields(subsystem = SUBSYSTEM_SYNC, component = "reconcile", user_id = session.user_id()))]
    pub async fn reconcile(&self, session: &Session, store: &EntityStore) -> Result<MergeReport> {
        let start = Instant::now();
        let local = store.snapshot();
        let remote = self.fetch(session, &local).await?;
        drop(local);

        let public_url = |key: &str| self.storage.public_url(key);
        let report = store.apply(|lib| reconcile_library(lib, &remote, &public_url));

        for local_id in &report.removed_categories {
            debug!(subsystem = SUBSYSTEM_SYNC, component = "reconcile", local_id = %local_id, "Category tombstoned");
            store
                .events()
                .emit(SyncEvent::CategoryTombstoned { local_id: *local_id });
        }
        store.events().emit(SyncEvent::SyncCompleted {
            full_pull: report.full_pull,
            categories: store.snapshot().categories.len(),
        });
        info!(
            subsystem = SUBSYSTEM_SYNC,
            component = "reconcile",
            op = if report.full_pull { "full_pull" } else { "merge" },
            categories_added = report.categories_added,
            categories_updated = report.categories_updated,
            images_added = report.images_added,
            images_updated = report.images_updated,
            removed_categories = report.removed_categories.len(),
            images_removed = report.images_removed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Reconciliation committed"
        );
        Ok(report)
    }
}
