//! Debounced, coalescing library writer.
//!
//! A single background task owns every physical write of the library record.
//! Mutations send a `Schedule` carrying the instant they happened; the task
//! writes once the debounce window after the latest mutation has elapsed.
//! Because one task performs all writes, a write is never overlapped by
//! another: requests that arrive mid-write wait in the channel and run as
//! soon as it finishes, and every write serializes the latest snapshot.
//!
//! ```text
//! Idle --mutation--> Pending(deadline) --deadline--> Writing --> Idle
//!                                                       |
//!                                     mutation mid-write --> Pending
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

use vitrine_core::logging::SUBSYSTEM_STORE;
use vitrine_core::{Error, EventBus, Library, Result, SyncEvent};

use crate::durable::DurableStore;
use crate::schema;

enum Command {
    /// A mutation happened at this instant.
    Schedule(Instant),
    /// Write now (unless nothing changed) and report the outcome.
    Flush(oneshot::Sender<Result<()>>),
    /// Final flush, then stop.
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Handle to the writer task.
pub(crate) struct LibraryWriter {
    tx: mpsc::UnboundedSender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
    writes: Arc<AtomicU64>,
}

impl LibraryWriter {
    pub(crate) fn spawn(
        durable: DurableStore,
        key: String,
        snapshot: watch::Receiver<Arc<Library>>,
        debounce: Duration,
        events: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writes = Arc::new(AtomicU64::new(0));
        let task = WriterTask {
            durable,
            key,
            snapshot,
            debounce,
            events,
            writes: Arc::clone(&writes),
            last_written: None,
        };
        let handle = tokio::spawn(task.run(rx));
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            writes,
        }
    }

    /// Arm (or re-arm) the debounce timer. Never blocks.
    pub(crate) fn schedule(&self) {
        if self.tx.send(Command::Schedule(Instant::now())).is_err() {
            debug!(
                subsystem = SUBSYSTEM_STORE,
                component = "writer",
                "Mutation after writer shutdown, not persisted"
            );
        }
    }

    /// Write the latest snapshot, waiting for any in-flight write first.
    pub(crate) async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .map_err(|_| Error::Internal("library writer is closed".into()))?;
        rx.await
            .map_err(|_| Error::Internal("library writer stopped during flush".into()))?
    }

    /// Flush and stop the task. Later calls are no-ops.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let (reply, rx) = oneshot::channel();
        let result = match self.tx.send(Command::Shutdown(reply)) {
            Ok(()) => rx
                .await
                .map_err(|_| Error::Internal("library writer stopped during shutdown".into()))
                .and_then(|r| r),
            Err(_) => Err(Error::Internal("library writer is closed".into())),
        };
        if let Err(e) = handle.await {
            error!(subsystem = SUBSYSTEM_STORE, component = "writer", error = ?e, "Writer task panicked");
        }
        result
    }

    /// Number of physical writes performed.
    pub(crate) fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

struct WriterTask {
    durable: DurableStore,
    key: String,
    snapshot: watch::Receiver<Arc<Library>>,
    debounce: Duration,
    events: EventBus,
    writes: Arc<AtomicU64>,
    last_written: Option<Arc<Library>>,
}

impl WriterTask {
    #[instrument(skip_all, fields(key = %self.key))]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!(
            subsystem = SUBSYSTEM_STORE,
            component = "writer",
            debounce_ms = self.debounce.as_millis() as u64,
            "Library writer started"
        );

        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                biased;
                cmd = rx.recv() => match cmd {
                    Some(Command::Schedule(at)) => {
                        deadline = Some(at + self.debounce);
                    }
                    Some(Command::Flush(reply)) => {
                        deadline = None;
                        let _ = reply.send(self.write().await);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(self.write().await);
                        break;
                    }
                    None => {
                        if deadline.is_some() {
                            let _ = self.write().await;
                        }
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    let _ = self.write().await;
                }
            }
        }

        info!(
            subsystem = SUBSYSTEM_STORE,
            component = "writer",
            writes = self.writes.load(Ordering::SeqCst),
            "Library writer stopped"
        );
    }

    /// Persist the current snapshot unless it is the one already on disk.
    async fn write(&mut self) -> Result<()> {
        let current = Arc::clone(&self.snapshot.borrow());
        if self
            .last_written
            .as_ref()
            .is_some_and(|last| Arc::ptr_eq(last, &current))
        {
            return Ok(());
        }

        let start = std::time::Instant::now();
        let result = match schema::encode(&current) {
            Ok(raw) => self.durable.set(&self.key, &raw).await.map(|()| raw.len()),
            Err(e) => Err(e),
        };

        match result {
            Ok(size_bytes) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                self.last_written = Some(current);
                debug!(
                    subsystem = SUBSYSTEM_STORE,
                    component = "writer",
                    backend = self.durable.backend_name(),
                    size_bytes,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Library persisted"
                );
                Ok(())
            }
            Err(e) => {
                let quota = e.is_quota_exceeded();
                if quota {
                    error!(
                        subsystem = SUBSYSTEM_STORE,
                        component = "writer",
                        error = %e,
                        "Library not persisted: storage quota exceeded"
                    );
                } else {
                    warn!(
                        subsystem = SUBSYSTEM_STORE,
                        component = "writer",
                        error = %e,
                        "Library write failed"
                    );
                }
                self.events.emit(SyncEvent::PersistFailed {
                    error: e.to_string(),
                    quota,
                });
                Err(e)
            }
        }
    }
}
