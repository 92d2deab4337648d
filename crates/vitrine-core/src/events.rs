//! Sync event types and the event bus used to observe engine progress.
//!
//! A UI (or the daemon's logger) subscribes once and receives transfer status
//! transitions, persistence failures and sync completions. Emission never
//! blocks and events are dropped when nobody listens.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{LocalId, TransferStatus};

/// Engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An image moved through the upload status machine.
    TransferStatusChanged {
        client_id: Uuid,
        status: TransferStatus,
    },
    /// The library writer failed to persist. `quota` marks capacity failures
    /// the user must be told about.
    PersistFailed { error: String, quota: bool },
    /// An upload batch finished.
    UploadBatchCompleted {
        uploaded: usize,
        failed: usize,
        deferred: usize,
    },
    /// Reconciliation committed a new snapshot.
    SyncCompleted { full_pull: bool, categories: usize },
    /// Identifier hydration finished.
    HydrationCompleted { categories: usize, images: usize },
    /// A category was removed locally by tombstone detection.
    CategoryTombstoned { local_id: LocalId },
}

impl SyncEvent {
    /// Dot-namespaced event name for logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TransferStatusChanged { .. } => "image.transfer_status",
            Self::PersistFailed { .. } => "library.persist_failed",
            Self::UploadBatchCompleted { .. } => "upload.batch_completed",
            Self::SyncCompleted { .. } => "sync.completed",
            Self::HydrationCompleted { .. } => "hydration.completed",
            Self::CategoryTombstoned { .. } => "category.tombstoned",
        }
    }
}

/// Broadcast bus for [`SyncEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently with no subscribers.
    pub fn emit(&self, event: SyncEvent) {
        tracing::trace!(
            event_type = event.event_type(),
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(event);
    }

    /// Subscribe to receive events. Each subscriber gets its own stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}
