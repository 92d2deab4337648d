//! Structured logging schema for vitrine.
//!
//! Every crate logs through `tracing` with the field names listed here so
//! that log aggregation can query by the same keys across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (open, close), sync and batch completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (single image transfer, single fetch) |
//!
//! ## Field names
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `subsystem` | One of the `SUBSYSTEM_*` values below |
//! | `component` | Part of a subsystem, e.g. `writer`, `sqlite`, `pool` |
//! | `op` | Logical operation, e.g. `sync_on_load`, `upload_batch` |
//! | `user_id` | Session user |
//! | `local_id` | Category local id |
//! | `remote_id` | Remote row id |
//! | `client_id` | Image client id |
//! | `object_key` | Object storage key |
//! | `attempt` | 1-based transfer attempt |
//! | `duration_ms` | Wall-clock duration |

/// Local persistence: backends, migration, entity store, writer.
pub const SUBSYSTEM_STORE: &str = "store";

/// Remote collaborators: metadata store and object storage.
pub const SUBSYSTEM_REMOTE: &str = "remote";

/// Upload pipeline, reconciliation and hydration.
pub const SUBSYSTEM_SYNC: &str = "sync";

/// The headless daemon.
pub const SUBSYSTEM_DAEMON: &str = "daemon";
