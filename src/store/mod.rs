//! Record-level storage contract shared by both local backends.
//!
//! [`sqlite::SqliteStore`] keeps everything in an in-memory relational
//! engine and persists by exporting a full image; [`object_store::ObjectStore`]
//! writes each record durably as it changes. The queue only ever talks to
//! [`LocalStore`], so it never branches on the host type.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{IdMapping, PendingOperation, StatusCounts, SyncAction, SyncStatus};
use crate::AppResult;

pub mod object_store;
pub mod sqlite;

pub use object_store::ObjectStore;
pub use sqlite::SqliteStore;

/// Whether durable state needs an explicit export after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Mutations live in memory until `export_snapshot` is written out.
    Explicit,
    /// Every write is already durable.
    Implicit,
}

pub trait LocalStore: Send + Sync {
    /// Open or create the backing tables and indexes. Safe to call repeatedly.
    fn init(&self) -> AppResult<()>;

    fn flush_mode(&self) -> FlushMode;

    /// Most recent pending record with this key and action, if any.
    fn query_pending_by_key(
        &self,
        composite_key: &str,
        action: SyncAction,
    ) -> AppResult<Option<PendingOperation>>;

    fn get(&self, local_id: &Uuid) -> AppResult<Option<PendingOperation>>;

    /// Insert, or replace the record with the same `local_id`.
    fn insert_or_update(&self, record: &PendingOperation) -> AppResult<()>;

    /// Records in the given state, in no particular order.
    fn select_by_status(&self, status: SyncStatus) -> AppResult<Vec<PendingOperation>>;

    fn select_all_pending(&self) -> AppResult<Vec<PendingOperation>> {
        self.select_by_status(SyncStatus::Pending)
    }

    /// Records in the given state for one entity type.
    fn select_by_table(
        &self,
        table_name: &str,
        status: SyncStatus,
    ) -> AppResult<Vec<PendingOperation>>;

    /// Returns `false` when no record has that `local_id`.
    fn update_status(
        &self,
        local_id: &Uuid,
        status: SyncStatus,
        server_id: Option<i64>,
        updated_at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Returns `false` when no record has that `local_id`.
    fn delete(&self, local_id: &Uuid) -> AppResult<bool>;

    fn upsert_id_mapping(&self, mapping: &IdMapping) -> AppResult<()>;

    fn select_server_id(&self, local_id: &Uuid) -> AppResult<Option<i64>>;

    /// Delete synced records last written before `cutoff`. Returns the count removed.
    fn delete_synced_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    fn count_by_status(&self) -> AppResult<StatusCounts>;

    fn export_snapshot(&self) -> AppResult<Vec<u8>>;

    /// Replace the store's contents with a previously exported snapshot.
    fn import_snapshot(&self, blob: &[u8]) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn LocalStore) {}
    }
}
