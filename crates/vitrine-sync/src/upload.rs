//! Upload pipeline: optimize, transfer, record, per image.
//!
//! Each image moves through `Pending -> Uploading -> Uploaded`, or ends in
//! `Failed` when the transfer exhausts its retries. Status changes go through
//! the entity store as they happen. A batch is processed by a bounded worker
//! pool and always ends with a forced save, whatever the item outcomes.
//!
//! The metadata record is created only once the owning category has a
//! remote id; otherwise the item is deferred for the retry sweep. A record
//! failure after a successful transfer is reported but never undoes the
//! transfer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use vitrine_core::logging::SUBSYSTEM_SYNC;
use vitrine_core::{
    BinaryOptimizer, BinaryRef, Error, Image, Library, NewRemoteImage, ObjectStorage,
    OptimizeOptions, RemoteId, RemoteMetadataStore, Result, Session, SyncEvent, TransferStatus,
};
use vitrine_store::EntityStore;

use crate::optimizer::optimize_or_raw;
use crate::pool::run_bounded;
use crate::retry::RetryPolicy;

/// What happened to one image in a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Transferred and recorded remotely.
    Uploaded { remote_id: RemoteId },
    /// Transferred; the record waits for the category's remote id.
    Deferred,
    /// Transferred, but creating the record failed.
    RecordFailed { error: String },
    /// Transfer failed for good; the image is marked `Failed`.
    Failed {
        error: String,
        attempts: u32,
        quota: bool,
    },
    /// Nothing to do: the image is gone, already complete, or being handled
    /// by another worker.
    Skipped,
    /// The image was deleted locally mid-flight; what was created remotely
    /// for it (object or record) was deleted again.
    Discarded { cleanup_error: Option<String> },
}

/// Per-item results of one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub items: Vec<(Uuid, ItemOutcome)>,
    /// Error from the forced save at the end of the batch, if any.
    pub persist_error: Option<String>,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn uploaded(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Uploaded { .. }))
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Deferred))
    }

    /// Transfer failures and record failures.
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { .. } | ItemOutcome::RecordFailed { .. }))
    }

    pub fn outcome(&self, client_id: Uuid) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|(id, _)| *id == client_id)
            .map(|(_, o)| o)
    }
}

/// Object name used for an image's upload.
pub fn upload_name(client_id: Uuid) -> String {
    format!("{}.jpg", client_id)
}

/// Images the retry sweep should process.
///
/// Excludes images whose only copy is a remote public URL, since there are
/// no local bytes to send.
pub fn pending_work(library: &Library) -> Vec<Uuid> {
    library
        .categories
        .iter()
        .flat_map(|c| c.images.iter())
        .filter(|i| i.needs_upload_work())
        .filter(|i| i.remote_object_key.is_some() || i.binary.is_local())
        .map(|i| i.client_id)
        .collect()
}

/// Removes a client id from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    client_id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.client_id);
    }
}

/// Drives images through the upload status machine.
pub struct UploadPipeline {
    store: Arc<EntityStore>,
    remote: Arc<dyn RemoteMetadataStore>,
    storage: Arc<dyn ObjectStorage>,
    optimizer: Arc<dyn BinaryOptimizer>,
    optimize: OptimizeOptions,
    retry: RetryPolicy,
    workers: usize,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl UploadPipeline {
    pub fn new(
        store: Arc<EntityStore>,
        remote: Arc<dyn RemoteMetadataStore>,
        storage: Arc<dyn ObjectStorage>,
        optimizer: Arc<dyn BinaryOptimizer>,
        optimize: OptimizeOptions,
        retry: RetryPolicy,
        workers: usize,
    ) -> Self {
        Self {
            store,
            remote,
            storage,
            optimizer,
            optimize,
            retry,
            workers: workers.max(1),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Process a batch, then force a save regardless of item outcomes.
    #[instrument(skip(self, session, client_ids), fields(subsystem = SUBSYSTEM_SYNC, component = "upload", batch_size = client_ids.len()))]
    pub async fn run(&self, session: &Session, client_ids: &[Uuid]) -> BatchReport {
        let start = Instant::now();
        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = client_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let outcomes = run_bounded(&ids, self.workers, |_, client_id| {
            let client_id = *client_id;
            async move { (client_id, self.process(session, client_id).await) }
        })
        .await;

        let mut report = BatchReport {
            items: outcomes,
            persist_error: None,
        };

        if let Err(e) = self.store.force_save().await {
            error!(
                subsystem = SUBSYSTEM_SYNC,
                component = "upload",
                error = %e,
                quota = e.is_quota_exceeded(),
                "Batch flush failed"
            );
            report.persist_error = Some(e.to_string());
        }

        self.store.events().emit(SyncEvent::UploadBatchCompleted {
            uploaded: report.uploaded(),
            failed: report.failed(),
            deferred: report.deferred(),
        });
        info!(
            subsystem = SUBSYSTEM_SYNC,
            component = "upload",
            op = "batch",
            uploaded = report.uploaded(),
            failed = report.failed(),
            deferred = report.deferred(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Upload batch completed"
        );
        report
    }

    /// Run one image through the pipeline. Never returns an error: every
    /// failure becomes an outcome.
    async fn process(&self, session: &Session, client_id: Uuid) -> ItemOutcome {
        let Some(_guard) = self.claim(client_id) else {
            debug!(subsystem = SUBSYSTEM_SYNC, component = "upload", %client_id, "Already in flight");
            return ItemOutcome::Skipped;
        };

        let snapshot = self.store.snapshot();
        let Some((_, image)) = snapshot.find_image(client_id) else {
            return ItemOutcome::Skipped;
        };

        if let Some(key) = image.remote_object_key.clone() {
            if image.remote_id.is_some() {
                return ItemOutcome::Skipped;
            }
            // Transfer already done in an earlier run; only the record is missing.
            if image.transfer_status != TransferStatus::Uploaded {
                self.store
                    .set_transfer_status(client_id, TransferStatus::Uploaded);
            }
            return self.create_record(session, client_id, &key).await;
        }

        let image = image.clone();
        drop(snapshot);

        self.store
            .set_transfer_status(client_id, TransferStatus::Uploading);

        let raw = match read_binary(&image).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(subsystem = SUBSYSTEM_SYNC, component = "upload", %client_id, error = %e, "Cannot read image bytes");
                self.store
                    .set_transfer_status(client_id, TransferStatus::Failed);
                return ItemOutcome::Failed {
                    quota: e.is_quota_exceeded(),
                    error: e.to_string(),
                    attempts: 0,
                };
            }
        };

        let bytes = optimize_or_raw(Arc::clone(&self.optimizer), raw, self.optimize).await;
        let name = upload_name(client_id);
        let outcome = self
            .retry
            .run("transfer", |_| {
                self.storage
                    .upload(&bytes, &name, session.auth_token())
            })
            .await;

        let stored = match outcome.result {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    subsystem = SUBSYSTEM_SYNC,
                    component = "upload",
                    %client_id,
                    attempt = outcome.attempts,
                    error = %e,
                    "Transfer failed"
                );
                self.store
                    .set_transfer_status(client_id, TransferStatus::Failed);
                return ItemOutcome::Failed {
                    quota: e.is_quota_exceeded(),
                    error: e.to_string(),
                    attempts: outcome.attempts,
                };
            }
        };

        if !self
            .store
            .record_transfer(client_id, &stored.key, stored.size)
        {
            let cleanup_error = self
                .storage
                .delete(&stored.key, session.auth_token())
                .await
                .err()
                .map(|e| e.to_string());
            warn!(
                subsystem = SUBSYSTEM_SYNC,
                component = "upload",
                %client_id,
                object_key = %stored.key,
                cleaned = cleanup_error.is_none(),
                "Image deleted during transfer, object discarded"
            );
            return ItemOutcome::Discarded { cleanup_error };
        }
        debug!(
            subsystem = SUBSYSTEM_SYNC,
            component = "upload",
            %client_id,
            object_key = %stored.key,
            size_bytes = stored.size,
            attempt = outcome.attempts,
            "Transfer complete"
        );

        self.create_record(session, client_id, &stored.key).await
    }

    /// Create the metadata record if the owning category is linked.
    async fn create_record(&self, session: &Session, client_id: Uuid, key: &str) -> ItemOutcome {
        let snapshot = self.store.snapshot();
        let Some((category, image)) = snapshot.find_image(client_id) else {
            return ItemOutcome::Skipped;
        };
        let Some(category_id) = category.remote_id else {
            debug!(
                subsystem = SUBSYSTEM_SYNC,
                component = "upload",
                %client_id,
                local_id = %category.local_id,
                "Category not linked yet, record deferred"
            );
            return ItemOutcome::Deferred;
        };
        let request = NewRemoteImage::from_image(image, key);
        drop(snapshot);

        match self.remote.create_image(session, category_id, &request).await {
            Ok(row) if self.store.set_image_remote_id(client_id, row.id) => {
                ItemOutcome::Uploaded { remote_id: row.id }
            }
            Ok(row) => {
                let cleanup_error = self
                    .remote
                    .delete_image(session, row.id)
                    .await
                    .err()
                    .map(|e| e.to_string());
                warn!(
                    subsystem = SUBSYSTEM_SYNC,
                    component = "upload",
                    %client_id,
                    remote_id = row.id,
                    cleaned = cleanup_error.is_none(),
                    "Image deleted during record creation, row discarded"
                );
                ItemOutcome::Discarded { cleanup_error }
            }
            Err(e) => {
                warn!(
                    subsystem = SUBSYSTEM_SYNC,
                    component = "upload",
                    %client_id,
                    object_key = key,
                    error = %e,
                    "Record creation failed, transfer kept"
                );
                ItemOutcome::RecordFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn claim(&self, client_id: Uuid) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id);
        inserted.then_some(InFlightGuard {
            set: &self.in_flight,
            client_id,
        })
    }
}

async fn read_binary(image: &Image) -> Result<Arc<[u8]>> {
    match &image.binary {
        BinaryRef::Inline { data } => Ok(Arc::clone(data)),
        BinaryRef::File { path } => tokio::fs::read(path)
            .await
            .map(Arc::from)
            .map_err(Error::from_io),
        BinaryRef::Url { url } => Err(Error::InvalidInput(format!(
            "no local bytes for image, only {}",
            url
        ))),
    }
}
