//! Object-store backend: one durable object per record, keyed by `local_id`,
//! with secondary indexes kept in memory.
//!
//! Layout under the host-provided root:
//! `<root>/<database>/pending_ops/<local_id>.json` and
//! `<root>/<database>/id_map/<local_id>.json`. Each write lands on disk
//! before the in-memory view changes, so there is nothing to flush.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FlushMode, LocalStore};
use crate::model::{IdMapping, PendingOperation, StatusCounts, SyncAction, SyncStatus};
use crate::snapshot::{self, write_atomic, PayloadKind};
use crate::{AppError, AppResult};

pub const DEFAULT_DATABASE_NAME: &str = "studio_offline";
pub const PENDING_STORE_NAME: &str = "pending_ops";
pub const ID_MAP_STORE_NAME: &str = "id_map";
const RECORD_EXTENSION: &str = "json";

#[derive(Default)]
struct Indexes {
    ops: HashMap<Uuid, PendingOperation>,
    by_status: HashMap<SyncStatus, BTreeSet<Uuid>>,
    by_key: HashMap<String, BTreeSet<Uuid>>,
    by_table: HashMap<String, BTreeSet<Uuid>>,
    id_map: HashMap<Uuid, IdMapping>,
}

impl Indexes {
    fn insert(&mut self, op: PendingOperation) {
        if let Some(previous) = self.ops.remove(&op.local_id) {
            self.unindex(&previous);
        }
        self.by_status
            .entry(op.sync_status)
            .or_default()
            .insert(op.local_id);
        self.by_key
            .entry(op.composite_key.clone())
            .or_default()
            .insert(op.local_id);
        self.by_table
            .entry(op.table_name.clone())
            .or_default()
            .insert(op.local_id);
        self.ops.insert(op.local_id, op);
    }

    fn remove(&mut self, local_id: &Uuid) -> Option<PendingOperation> {
        let previous = self.ops.remove(local_id)?;
        self.unindex(&previous);
        Some(previous)
    }

    fn unindex(&mut self, op: &PendingOperation) {
        fn drop_entry<K: std::hash::Hash + Eq>(
            index: &mut HashMap<K, BTreeSet<Uuid>>,
            key: &K,
            id: &Uuid,
        ) {
            if let Some(ids) = index.get_mut(key) {
                ids.remove(id);
                if ids.is_empty() {
                    index.remove(key);
                }
            }
        }
        drop_entry(&mut self.by_status, &op.sync_status, &op.local_id);
        drop_entry(&mut self.by_key, &op.composite_key, &op.local_id);
        drop_entry(&mut self.by_table, &op.table_name, &op.local_id);
    }

    fn with_status(&self, status: SyncStatus) -> impl Iterator<Item = &PendingOperation> {
        self.by_status
            .get(&status)
            .into_iter()
            .flatten()
            .filter_map(|id| self.ops.get(id))
    }
}

#[derive(Serialize, Deserialize)]
struct RecordsDocument {
    pending_ops: Vec<PendingOperation>,
    id_map: Vec<IdMapping>,
}

pub struct ObjectStore {
    database_dir: PathBuf,
    indexes: Mutex<Indexes>,
}

impl ObjectStore {
    pub fn new(root: impl AsRef<Path>, database_name: &str) -> Self {
        Self {
            database_dir: root.as_ref().join(database_name),
            indexes: Mutex::new(Indexes::default()),
        }
    }

    pub fn database_dir(&self) -> &Path {
        &self.database_dir
    }

    fn indexes(&self) -> MutexGuard<'_, Indexes> {
        self.indexes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store_dir(&self, store: &str) -> PathBuf {
        self.database_dir.join(store)
    }

    fn record_path(&self, store: &str, local_id: &Uuid) -> PathBuf {
        self.store_dir(store)
            .join(format!("{local_id}.{RECORD_EXTENSION}"))
    }

    fn put<T: Serialize>(&self, store: &str, local_id: &Uuid, value: &T) -> AppResult<()> {
        let path = self.record_path(store, local_id);
        let bytes = serde_json::to_vec(value)?;
        write_atomic(&path, &bytes).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "put_object")
                .with_context("path", path.display().to_string())
        })
    }

    fn remove_object(&self, store: &str, local_id: &Uuid) -> AppResult<()> {
        let path = self.record_path(store, local_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::from(err)
                .with_context("operation", "delete_object")
                .with_context("path", path.display().to_string())),
        }
    }

    fn load_all<T: DeserializeOwned>(&self, store: &str) -> AppResult<Vec<T>> {
        let dir = self.store_dir(store);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_object_store")
                .with_context("path", dir.display().to_string())
        })? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(
                        target: "studio_offline",
                        event = "skip_unreadable_object",
                        error = %err
                    );
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(AppError::from)
                .and_then(|bytes| serde_json::from_slice::<T>(&bytes).map_err(AppError::from));
            match parsed {
                Ok(value) => out.push(value),
                Err(err) => {
                    tracing::warn!(
                        target: "studio_offline",
                        event = "skip_corrupt_object",
                        path = %path.display(),
                        error = %err
                    );
                }
            }
        }
        Ok(out)
    }

    fn clear_store(&self, store: &str) -> AppResult<()> {
        let dir = self.store_dir(store);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "clear_object_store")
                    .with_context("path", dir.display().to_string())
            })?;
        }
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_object_store")
                .with_context("path", dir.display().to_string())
        })
    }
}

impl LocalStore for ObjectStore {
    fn init(&self) -> AppResult<()> {
        for store in [PENDING_STORE_NAME, ID_MAP_STORE_NAME] {
            let dir = self.store_dir(store);
            fs::create_dir_all(&dir).map_err(|err| {
                AppError::new("STORE/INIT_FAILED", "Unable to create object store")
                    .with_context("path", dir.display().to_string())
                    .with_cause(err)
            })?;
        }

        let ops: Vec<PendingOperation> = self.load_all(PENDING_STORE_NAME)?;
        let mappings: Vec<IdMapping> = self.load_all(ID_MAP_STORE_NAME)?;

        let mut indexes = Indexes::default();
        for op in ops {
            indexes.insert(op);
        }
        for mapping in mappings {
            indexes.id_map.insert(mapping.local_id, mapping);
        }
        tracing::debug!(
            target: "studio_offline",
            event = "object_store_loaded",
            path = %self.database_dir.display(),
            records = indexes.ops.len(),
            mappings = indexes.id_map.len()
        );
        *self.indexes() = indexes;
        Ok(())
    }

    fn flush_mode(&self) -> FlushMode {
        FlushMode::Implicit
    }

    fn query_pending_by_key(
        &self,
        composite_key: &str,
        action: SyncAction,
    ) -> AppResult<Option<PendingOperation>> {
        let indexes = self.indexes();
        let found = indexes
            .by_key
            .get(composite_key)
            .into_iter()
            .flatten()
            .filter_map(|id| indexes.ops.get(id))
            .filter(|op| op.sync_status == SyncStatus::Pending && op.sync_action == action)
            .max_by_key(|op| op.updated_at)
            .cloned();
        Ok(found)
    }

    fn get(&self, local_id: &Uuid) -> AppResult<Option<PendingOperation>> {
        Ok(self.indexes().ops.get(local_id).cloned())
    }

    fn insert_or_update(&self, record: &PendingOperation) -> AppResult<()> {
        let mut indexes = self.indexes();
        self.put(PENDING_STORE_NAME, &record.local_id, record)?;
        indexes.insert(record.clone());
        Ok(())
    }

    fn select_by_status(&self, status: SyncStatus) -> AppResult<Vec<PendingOperation>> {
        Ok(self.indexes().with_status(status).cloned().collect())
    }

    fn select_by_table(
        &self,
        table_name: &str,
        status: SyncStatus,
    ) -> AppResult<Vec<PendingOperation>> {
        let indexes = self.indexes();
        Ok(indexes
            .by_table
            .get(table_name)
            .into_iter()
            .flatten()
            .filter_map(|id| indexes.ops.get(id))
            .filter(|op| op.sync_status == status)
            .cloned()
            .collect())
    }

    fn update_status(
        &self,
        local_id: &Uuid,
        status: SyncStatus,
        server_id: Option<i64>,
        updated_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut indexes = self.indexes();
        let Some(existing) = indexes.ops.get(local_id) else {
            return Ok(false);
        };
        let mut updated = existing.clone();
        updated.sync_status = status;
        updated.updated_at = updated_at;
        if server_id.is_some() {
            updated.server_id = server_id;
        }
        self.put(PENDING_STORE_NAME, local_id, &updated)?;
        indexes.insert(updated);
        Ok(true)
    }

    fn delete(&self, local_id: &Uuid) -> AppResult<bool> {
        let mut indexes = self.indexes();
        if !indexes.ops.contains_key(local_id) {
            return Ok(false);
        }
        self.remove_object(PENDING_STORE_NAME, local_id)?;
        indexes.remove(local_id);
        Ok(true)
    }

    fn upsert_id_mapping(&self, mapping: &IdMapping) -> AppResult<()> {
        let mut indexes = self.indexes();
        self.put(ID_MAP_STORE_NAME, &mapping.local_id, mapping)?;
        indexes.id_map.insert(mapping.local_id, mapping.clone());
        Ok(())
    }

    fn select_server_id(&self, local_id: &Uuid) -> AppResult<Option<i64>> {
        Ok(self
            .indexes()
            .id_map
            .get(local_id)
            .map(|mapping| mapping.server_id))
    }

    fn delete_synced_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut indexes = self.indexes();
        let expired: Vec<Uuid> = indexes
            .with_status(SyncStatus::Synced)
            .filter(|op| op.updated_at < cutoff)
            .map(|op| op.local_id)
            .collect();
        let mut removed = 0;
        for local_id in expired {
            self.remove_object(PENDING_STORE_NAME, &local_id)?;
            indexes.remove(&local_id);
            removed += 1;
        }
        Ok(removed)
    }

    fn count_by_status(&self) -> AppResult<StatusCounts> {
        let indexes = self.indexes();
        let mut counts = StatusCounts::default();
        for (status, ids) in &indexes.by_status {
            counts.add(*status, ids.len() as u64);
        }
        Ok(counts)
    }

    fn export_snapshot(&self) -> AppResult<Vec<u8>> {
        let indexes = self.indexes();
        let mut pending_ops: Vec<PendingOperation> = indexes.ops.values().cloned().collect();
        pending_ops.sort_by_key(|op| op.local_id);
        let mut id_map: Vec<IdMapping> = indexes.id_map.values().cloned().collect();
        id_map.sort_by_key(|mapping| mapping.local_id);
        let payload = serde_json::to_vec(&RecordsDocument {
            pending_ops,
            id_map,
        })?;
        Ok(snapshot::encode(PayloadKind::JsonRecords, &payload))
    }

    fn import_snapshot(&self, blob: &[u8]) -> AppResult<()> {
        let payload = snapshot::decode_kind(blob, PayloadKind::JsonRecords)?;
        let document: RecordsDocument = serde_json::from_slice(payload)?;

        let mut indexes = self.indexes();
        self.clear_store(PENDING_STORE_NAME)?;
        self.clear_store(ID_MAP_STORE_NAME)?;
        let mut rebuilt = Indexes::default();
        for op in document.pending_ops {
            self.put(PENDING_STORE_NAME, &op.local_id, &op)?;
            rebuilt.insert(op);
        }
        for mapping in document.id_map {
            self.put(ID_MAP_STORE_NAME, &mapping.local_id, &mapping)?;
            rebuilt.id_map.insert(mapping.local_id, mapping);
        }
        *indexes = rebuilt;
        Ok(())
    }
}
