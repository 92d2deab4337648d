//! # vitrine-core
//!
//! Core types, traits, and abstractions for the vitrine gallery sync engine.
//!
//! This crate provides the data model shared by the local store, the remote
//! collaborators and the sync engine, together with the trait seams that let
//! each collaborator be swapped out in tests.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod session;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, SyncEvent};
pub use models::*;
pub use session::Session;
pub use traits::*;
