//! Offline mutation queue and local persistence for the studio hosts.
//!
//! Mutations issued while the remote API is unreachable are recorded as
//! pending operations in a local store, made durable, and replayed later by
//! the sync collaborator. See [`OfflineContext`] for the startup entry point.

pub mod composite_key;
pub mod config;
pub mod context;
mod error;
pub mod location;
pub mod logging;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod time;

pub use config::OfflineConfig;
pub use context::OfflineContext;
pub use error::{AppError, AppResult};
pub use location::{HostEnvironment, StorageLocation, StorageResolver};
pub use model::{IdMapping, Payload, PendingOperation, StatusCounts, SyncAction, SyncStatus};
pub use queue::PendingQueue;
pub use store::{FlushMode, LocalStore};

/// Git commit the crate was built from, when known.
pub fn build_commit() -> &'static str {
    env!("STUDIO_GIT_HASH")
}
