//! Relational backend: an in-memory SQLite engine whose full image is the
//! durable artifact.

use std::fs;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::backup::Progress;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row};
use uuid::Uuid;

use super::{FlushMode, LocalStore};
use crate::model::{IdMapping, Payload, PendingOperation, StatusCounts, SyncAction, SyncStatus};
use crate::snapshot::{self, PayloadKind};
use crate::time::{from_storage, to_storage};
use crate::{AppError, AppResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pending_ops (
    local_id      TEXT PRIMARY KEY,
    server_id     INTEGER,
    table_name    TEXT NOT NULL,
    sync_status   TEXT NOT NULL,
    sync_action   TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    composite_key TEXT NOT NULL,
    data          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS pending_ops_sync_status_idx ON pending_ops(sync_status);
CREATE INDEX IF NOT EXISTS pending_ops_composite_key_idx ON pending_ops(composite_key);
CREATE INDEX IF NOT EXISTS pending_ops_table_name_idx ON pending_ops(table_name);
CREATE TABLE IF NOT EXISTS id_map (
    local_id   TEXT PRIMARY KEY,
    server_id  INTEGER NOT NULL,
    table_name TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS id_map_table_name_idx ON id_map(table_name);
";

const SELECT_COLUMNS: &str = "local_id, server_id, table_name, sync_status, sync_action, \
                              updated_at, composite_key, data";

const IMAGE_FILE_NAME: &str = "queue-image.sqlite3";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|err| AppError::from(err).with_context("operation", "open_in_memory"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_schema(conn: &Connection) -> AppResult<()> {
        conn.execute_batch(SCHEMA)
            .map_err(|err| AppError::from(err).with_context("operation", "apply_schema"))?;
        conn.pragma_update(None, "user_version", i64::from(snapshot::SCHEMA_VERSION))
            .map_err(|err| AppError::from(err).with_context("operation", "set_user_version"))?;
        Ok(())
    }
}

/// Text columns as stored; parsed into the model outside the rusqlite closure
/// so decode failures keep their own error codes.
struct RawOperation {
    local_id: String,
    server_id: Option<i64>,
    table_name: String,
    sync_status: String,
    sync_action: String,
    updated_at: String,
    composite_key: String,
    data: String,
}

impl RawOperation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            server_id: row.get(1)?,
            table_name: row.get(2)?,
            sync_status: row.get(3)?,
            sync_action: row.get(4)?,
            updated_at: row.get(5)?,
            composite_key: row.get(6)?,
            data: row.get(7)?,
        })
    }

    fn into_operation(self) -> AppResult<PendingOperation> {
        let local_id = Uuid::parse_str(&self.local_id).map_err(|err| {
            AppError::new("STORE/BAD_LOCAL_ID", err.to_string())
                .with_context("value", self.local_id.clone())
        })?;
        let updated_at = from_storage(&self.updated_at).ok_or_else(|| {
            AppError::new("STORE/BAD_TIMESTAMP", "Unparseable updated_at")
                .with_context("local_id", self.local_id.clone())
                .with_context("value", self.updated_at.clone())
        })?;
        let data: Payload = serde_json::from_str(&self.data).map_err(|err| {
            AppError::from(err).with_context("local_id", self.local_id.clone())
        })?;
        Ok(PendingOperation {
            local_id,
            server_id: self.server_id,
            table_name: self.table_name,
            sync_status: self.sync_status.parse()?,
            sync_action: self.sync_action.parse()?,
            updated_at,
            composite_key: self.composite_key,
            data,
        })
    }
}

impl LocalStore for SqliteStore {
    fn init(&self) -> AppResult<()> {
        Self::apply_schema(&self.conn())
    }

    fn flush_mode(&self) -> FlushMode {
        FlushMode::Explicit
    }

    fn query_pending_by_key(
        &self,
        composite_key: &str,
        action: SyncAction,
    ) -> AppResult<Option<PendingOperation>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_ops
             WHERE composite_key = ?1 AND sync_status = ?2 AND sync_action = ?3
             ORDER BY updated_at DESC LIMIT 1"
        );
        let raw = conn
            .query_row(
                &sql,
                params![composite_key, SyncStatus::Pending.as_str(), action.as_str()],
                RawOperation::from_row,
            )
            .optional()?;
        raw.map(RawOperation::into_operation).transpose()
    }

    fn get(&self, local_id: &Uuid) -> AppResult<Option<PendingOperation>> {
        let conn = self.conn();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM pending_ops WHERE local_id = ?1");
        let raw = conn
            .query_row(&sql, params![local_id.to_string()], RawOperation::from_row)
            .optional()?;
        raw.map(RawOperation::into_operation).transpose()
    }

    fn insert_or_update(&self, record: &PendingOperation) -> AppResult<()> {
        let data = serde_json::to_string(&record.data)?;
        self.conn().execute(
            "INSERT INTO pending_ops
                (local_id, server_id, table_name, sync_status, sync_action,
                 updated_at, composite_key, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(local_id) DO UPDATE SET
                server_id = excluded.server_id,
                table_name = excluded.table_name,
                sync_status = excluded.sync_status,
                sync_action = excluded.sync_action,
                updated_at = excluded.updated_at,
                composite_key = excluded.composite_key,
                data = excluded.data",
            params![
                record.local_id.to_string(),
                record.server_id,
                record.table_name,
                record.sync_status.as_str(),
                record.sync_action.as_str(),
                to_storage(&record.updated_at),
                record.composite_key,
                data,
            ],
        )?;
        Ok(())
    }

    fn select_by_status(&self, status: SyncStatus) -> AppResult<Vec<PendingOperation>> {
        let conn = self.conn();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM pending_ops WHERE sync_status = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![status.as_str()], RawOperation::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawOperation::into_operation).collect()
    }

    fn select_by_table(
        &self,
        table_name: &str,
        status: SyncStatus,
    ) -> AppResult<Vec<PendingOperation>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_ops WHERE table_name = ?1 AND sync_status = ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![table_name, status.as_str()], RawOperation::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawOperation::into_operation).collect()
    }

    fn update_status(
        &self,
        local_id: &Uuid,
        status: SyncStatus,
        server_id: Option<i64>,
        updated_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let changed = self.conn().execute(
            "UPDATE pending_ops
             SET sync_status = ?2, server_id = COALESCE(?3, server_id), updated_at = ?4
             WHERE local_id = ?1",
            params![
                local_id.to_string(),
                status.as_str(),
                server_id,
                to_storage(&updated_at),
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete(&self, local_id: &Uuid) -> AppResult<bool> {
        let changed = self.conn().execute(
            "DELETE FROM pending_ops WHERE local_id = ?1",
            params![local_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn upsert_id_mapping(&self, mapping: &IdMapping) -> AppResult<()> {
        self.conn().execute(
            "INSERT INTO id_map (local_id, server_id, table_name) VALUES (?1, ?2, ?3)
             ON CONFLICT(local_id) DO UPDATE SET
                server_id = excluded.server_id,
                table_name = excluded.table_name",
            params![
                mapping.local_id.to_string(),
                mapping.server_id,
                mapping.table_name
            ],
        )?;
        Ok(())
    }

    fn select_server_id(&self, local_id: &Uuid) -> AppResult<Option<i64>> {
        let server_id = self
            .conn()
            .query_row(
                "SELECT server_id FROM id_map WHERE local_id = ?1",
                params![local_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(server_id)
    }

    fn delete_synced_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let removed = self.conn().execute(
            "DELETE FROM pending_ops WHERE sync_status = ?1 AND updated_at < ?2",
            params![SyncStatus::Synced.as_str(), to_storage(&cutoff)],
        )?;
        Ok(removed as u64)
    }

    fn count_by_status(&self) -> AppResult<StatusCounts> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT sync_status, COUNT(*) FROM pending_ops GROUP BY sync_status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    fn export_snapshot(&self) -> AppResult<Vec<u8>> {
        let dir = tempfile::tempdir()
            .map_err(|err| AppError::from(err).with_context("operation", "export_tempdir"))?;
        let image_path = dir.path().join(IMAGE_FILE_NAME);
        self.conn()
            .backup(DatabaseName::Main, &image_path, None)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_to_image"))?;
        let image = fs::read(&image_path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_image")
                .with_context("path", image_path.display().to_string())
        })?;
        Ok(snapshot::encode(PayloadKind::SqliteImage, &image))
    }

    fn import_snapshot(&self, blob: &[u8]) -> AppResult<()> {
        let image = snapshot::decode_kind(blob, PayloadKind::SqliteImage)?;
        let dir = tempfile::tempdir()
            .map_err(|err| AppError::from(err).with_context("operation", "import_tempdir"))?;
        let image_path = dir.path().join(IMAGE_FILE_NAME);
        fs::write(&image_path, image).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "stage_image")
                .with_context("path", image_path.display().to_string())
        })?;
        let mut conn = self.conn();
        conn.restore(DatabaseName::Main, &image_path, None::<fn(Progress)>)
            .map_err(|err| AppError::from(err).with_context("operation", "restore_from_image"))?;
        // Older images may predate an index; the schema is additive.
        Self::apply_schema(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use serde_json::json;

    fn op(key: &str, status: SyncStatus, updated_at: DateTime<Utc>) -> PendingOperation {
        PendingOperation {
            local_id: Uuid::new_v4(),
            server_id: None,
            table_name: "customers".into(),
            sync_status: status,
            sync_action: SyncAction::Create,
            updated_at: updated_at.trunc_subsecs(3),
            composite_key: key.into(),
            data: json!({"name": "Ali"}).as_object().cloned().unwrap(),
        }
    }

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init().unwrap();
        store.init().unwrap();
        store
    }

    #[test]
    fn upsert_replaces_by_local_id() {
        let store = store();
        let mut record = op("customers|ali|0100", SyncStatus::Pending, Utc::now());
        store.insert_or_update(&record).unwrap();
        record.data.insert("email".into(), json!("a@x.com"));
        store.insert_or_update(&record).unwrap();

        let pending = store.select_all_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data.get("email"), Some(&json!("a@x.com")));
    }

    #[test]
    fn key_lookup_returns_most_recent_pending_create() {
        let store = store();
        let now = Utc::now();
        let older = op("k", SyncStatus::Pending, now - Duration::minutes(5));
        let newer = op("k", SyncStatus::Pending, now);
        let synced = op("k", SyncStatus::Synced, now + Duration::minutes(1));
        for record in [&older, &newer, &synced] {
            store.insert_or_update(record).unwrap();
        }

        let found = store
            .query_pending_by_key("k", SyncAction::Create)
            .unwrap()
            .unwrap();
        assert_eq!(found.local_id, newer.local_id);
        assert!(store
            .query_pending_by_key("k", SyncAction::Delete)
            .unwrap()
            .is_none());
    }

    #[test]
    fn update_status_keeps_server_id_when_none_given() {
        let store = store();
        let mut record = op("k", SyncStatus::Pending, Utc::now());
        record.server_id = Some(9);
        store.insert_or_update(&record).unwrap();

        assert!(store
            .update_status(&record.local_id, SyncStatus::Conflict, None, Utc::now())
            .unwrap());
        let stored = store.get(&record.local_id).unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflict);
        assert_eq!(stored.server_id, Some(9));
        assert!(!store
            .update_status(&Uuid::new_v4(), SyncStatus::Synced, Some(1), Utc::now())
            .unwrap());
    }

    #[test]
    fn image_round_trip_restores_both_tables() {
        let source = store();
        let record = op("k", SyncStatus::Pending, Utc::now());
        source.insert_or_update(&record).unwrap();
        source
            .upsert_id_mapping(&IdMapping {
                local_id: record.local_id,
                server_id: 501,
                table_name: "customers".into(),
            })
            .unwrap();
        let blob = source.export_snapshot().unwrap();

        let target = store();
        target.import_snapshot(&blob).unwrap();
        assert_eq!(target.get(&record.local_id).unwrap(), Some(record.clone()));
        assert_eq!(target.select_server_id(&record.local_id).unwrap(), Some(501));
    }

    #[test]
    fn import_rejects_object_store_snapshot() {
        let target = store();
        let blob = snapshot::encode(PayloadKind::JsonRecords, b"{}");
        let err = target.import_snapshot(&blob).unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT/KIND_MISMATCH");
    }

    #[test]
    fn counts_group_by_status() {
        let store = store();
        let now = Utc::now();
        store.insert_or_update(&op("a", SyncStatus::Pending, now)).unwrap();
        store.insert_or_update(&op("b", SyncStatus::Pending, now)).unwrap();
        store.insert_or_update(&op("c", SyncStatus::Conflict, now)).unwrap();
        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.conflict, 1);
        assert_eq!(counts.synced, 0);
    }
}
