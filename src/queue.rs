//! Pending Operation Queue: the API the network client and the sync
//! collaborator use. Nothing else writes to the local store.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::composite_key::derive_key;
use crate::config::OfflineConfig;
use crate::location::OpenedStore;
use crate::model::{IdMapping, Payload, PendingOperation, StatusCounts, SyncAction, SyncStatus};
use crate::scheduler::{FlushFn, FlushPolicy, PersistenceScheduler};
use crate::snapshot::BlobStore;
use crate::store::{FlushMode, LocalStore};
use crate::time::{Clock, SystemClock};
use crate::{AppError, AppResult};

pub struct PendingQueue {
    store: Arc<dyn LocalStore>,
    scheduler: Option<PersistenceScheduler>,
    clock: Arc<dyn Clock>,
    /// Held across "derive key, look up pending, insert or update" so two
    /// callers cannot both miss the existing record.
    write_gate: Mutex<()>,
    retention: std::time::Duration,
    strict_mark_synced: bool,
}

impl PendingQueue {
    pub fn new(
        store: Arc<dyn LocalStore>,
        blob: Option<Arc<dyn BlobStore>>,
        config: &OfflineConfig,
    ) -> Self {
        let scheduler = match (store.flush_mode(), blob) {
            (FlushMode::Explicit, Some(blob)) => {
                let source = Arc::clone(&store);
                let flush: FlushFn = Arc::new(move || {
                    let bytes = source.export_snapshot()?;
                    blob.write(&bytes)
                });
                Some(PersistenceScheduler::new(flush, FlushPolicy::from(config)))
            }
            _ => None,
        };
        Self {
            store,
            scheduler,
            clock: Arc::new(SystemClock),
            write_gate: Mutex::new(()),
            retention: config.retention,
            strict_mark_synced: config.strict_mark_synced,
        }
    }

    pub fn from_opened(opened: OpenedStore, config: &OfflineConfig) -> Self {
        Self::new(opened.store, opened.blob, config)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        // Millisecond precision is what both backends persist.
        self.clock.now().trunc_subsecs(3)
    }

    fn gate(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a mutation intent and make it durable before returning.
    ///
    /// A second `create` for a composite key that already has a pending
    /// create overwrites that record's data and returns its `local_id`.
    /// If the durable write fails the intent stays queued in memory, a
    /// debounced retry is armed, and `QUEUE/FLUSH_FAILED` is returned.
    pub async fn enqueue(
        &self,
        table_name: &str,
        action: SyncAction,
        data: Payload,
        server_id: Option<i64>,
    ) -> AppResult<Uuid> {
        if table_name.trim().is_empty() {
            return Err(AppError::new("QUEUE/INVALID_TABLE", "Table name is required"));
        }
        let local_id = self.record_intent(table_name, action, data, server_id)?;
        self.flush_immediately(&local_id).await?;
        Ok(local_id)
    }

    fn record_intent(
        &self,
        table_name: &str,
        action: SyncAction,
        data: Payload,
        server_id: Option<i64>,
    ) -> AppResult<Uuid> {
        let _gate = self.gate();
        let composite_key = derive_key(table_name, &data);
        let now = self.now();

        if action == SyncAction::Create {
            if let Some(mut existing) = self
                .store
                .query_pending_by_key(&composite_key, SyncAction::Create)?
            {
                existing.data = data;
                existing.updated_at = now;
                // A known server id is only ever reassigned by mark_synced.
                let known = self.store.select_server_id(&existing.local_id)?;
                if known.is_none() && server_id.is_some() {
                    existing.server_id = server_id;
                }
                self.persist(&existing)?;
                if known.is_none() {
                    self.write_mapping(&existing.local_id, table_name, server_id)?;
                }
                debug!(
                    target: "studio_offline",
                    event = "queue_dedup",
                    table = table_name,
                    local_id = %existing.local_id,
                    composite_key = %composite_key
                );
                return Ok(existing.local_id);
            }
        }

        let record = PendingOperation {
            local_id: Uuid::new_v4(),
            server_id,
            table_name: table_name.to_string(),
            sync_status: SyncStatus::Pending,
            sync_action: action,
            updated_at: now,
            composite_key,
            data,
        };
        self.persist(&record)?;
        self.write_mapping(&record.local_id, table_name, server_id)?;
        info!(
            target: "studio_offline",
            event = "queue_enqueued",
            table = table_name,
            action = %action,
            local_id = %record.local_id
        );
        Ok(record.local_id)
    }

    /// Backends that write through on every call report a failed write the
    /// same way a failed snapshot flush is reported.
    fn persist(&self, op: &PendingOperation) -> AppResult<()> {
        self.store.insert_or_update(op).map_err(|err| match self.store.flush_mode() {
            FlushMode::Implicit => {
                AppError::new("QUEUE/FLUSH_FAILED", "Queued mutation is not yet durable")
                    .with_context("local_id", op.local_id.to_string())
                    .with_context("table", op.table_name.clone())
                    .with_cause(err)
            }
            FlushMode::Explicit => err,
        })
    }

    fn write_mapping(
        &self,
        local_id: &Uuid,
        table_name: &str,
        server_id: Option<i64>,
    ) -> AppResult<()> {
        match server_id {
            Some(server_id) => self.store.upsert_id_mapping(&IdMapping {
                local_id: *local_id,
                server_id,
                table_name: table_name.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn flush_immediately(&self, local_id: &Uuid) -> AppResult<()> {
        let Some(scheduler) = &self.scheduler else {
            return Ok(());
        };
        scheduler.flush_now().await.map_err(|err| {
            scheduler.schedule();
            AppError::new("QUEUE/FLUSH_FAILED", "Queued mutation is not yet durable")
                .with_context("local_id", local_id.to_string())
                .with_cause(err)
        })
    }

    fn note_mutation(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.schedule();
        }
    }

    /// Every record still waiting to be replayed, oldest first.
    pub fn list_pending(&self) -> AppResult<Vec<PendingOperation>> {
        let mut pending = self.store.select_all_pending()?;
        pending.sort_by_key(|op| op.updated_at);
        Ok(pending)
    }

    pub fn list_pending_for_table(&self, table_name: &str) -> AppResult<Vec<PendingOperation>> {
        let mut pending = self.store.select_by_table(table_name, SyncStatus::Pending)?;
        pending.sort_by_key(|op| op.updated_at);
        Ok(pending)
    }

    /// Record that the remote side accepted the replay and assigned `server_id`.
    ///
    /// Unknown ids are a no-op: the sync collaborator can race with a purge.
    /// Conflict records stay in conflict until discarded.
    pub async fn mark_synced(&self, local_id: &Uuid, server_id: i64) -> AppResult<()> {
        let updated = {
            let _gate = self.gate();
            match self.store.get(local_id)? {
                Some(op) if op.sync_status == SyncStatus::Conflict => {
                    warn!(
                        target: "studio_offline",
                        event = "mark_synced_ignored",
                        local_id = %local_id,
                        status = %op.sync_status
                    );
                    false
                }
                Some(op) => {
                    self.store.update_status(
                        local_id,
                        SyncStatus::Synced,
                        Some(server_id),
                        self.now(),
                    )?;
                    self.store.upsert_id_mapping(&IdMapping {
                        local_id: *local_id,
                        server_id,
                        table_name: op.table_name,
                    })?;
                    true
                }
                None => {
                    self.report_unknown_id(
                        local_id,
                        "mark_synced_already_purged",
                        "mark_synced_unknown_id",
                    )?;
                    false
                }
            }
        };
        if !updated {
            return Ok(());
        }
        debug!(
            target: "studio_offline",
            event = "queue_marked_synced",
            local_id = %local_id,
            server_id
        );
        if self.strict_mark_synced {
            self.flush_immediately(local_id).await
        } else {
            self.note_mutation();
            Ok(())
        }
    }

    /// Record that the remote side rejected the replay. Only pending records
    /// move to `conflict`; returns whether the record changed.
    pub fn mark_conflict(&self, local_id: &Uuid) -> AppResult<bool> {
        let _gate = self.gate();
        let Some(op) = self.store.get(local_id)? else {
            self.report_unknown_id(
                local_id,
                "mark_conflict_already_purged",
                "mark_conflict_unknown_id",
            )?;
            return Ok(false);
        };
        if op.sync_status != SyncStatus::Pending {
            warn!(
                target: "studio_offline",
                event = "mark_conflict_ignored",
                local_id = %local_id,
                status = %op.sync_status
            );
            return Ok(false);
        }
        self.store
            .update_status(local_id, SyncStatus::Conflict, None, self.now())?;
        warn!(
            target: "studio_offline",
            event = "queue_conflict",
            table = op.table_name.as_str(),
            local_id = %local_id
        );
        self.note_mutation();
        Ok(true)
    }

    /// An id with a surviving IdMapping was synced and purged; anything else
    /// never existed here.
    fn report_unknown_id(
        &self,
        local_id: &Uuid,
        purged: &'static str,
        unknown: &'static str,
    ) -> AppResult<()> {
        if self.store.select_server_id(local_id)?.is_some() {
            debug!(target: "studio_offline", event = purged, local_id = %local_id);
        } else {
            warn!(target: "studio_offline", event = unknown, local_id = %local_id);
        }
        Ok(())
    }

    /// Server identity for a locally created entity, once known.
    pub fn resolve_server_id(&self, local_id: &Uuid) -> AppResult<Option<i64>> {
        self.store.select_server_id(local_id)
    }

    /// Delete synced records older than `older_than`. Pending and conflict
    /// records are never touched.
    pub fn purge_synced(&self, older_than: std::time::Duration) -> AppResult<u64> {
        let age = chrono::Duration::from_std(older_than).map_err(|err| {
            AppError::new("QUEUE/INVALID_RETENTION", err.to_string())
                .with_context("seconds", older_than.as_secs().to_string())
        })?;
        // Nothing stored can predate the earliest representable instant.
        let Some(cutoff) = self.now().checked_sub_signed(age) else {
            debug!(
                target: "studio_offline",
                event = "queue_purge_skipped",
                seconds = older_than.as_secs()
            );
            return Ok(0);
        };
        let removed = {
            let _gate = self.gate();
            self.store.delete_synced_before(cutoff)?
        };
        if removed > 0 {
            info!(
                target: "studio_offline",
                event = "queue_purged",
                removed,
                cutoff = %cutoff
            );
            self.note_mutation();
        }
        Ok(removed)
    }

    /// [`purge_synced`](Self::purge_synced) with the configured retention.
    pub fn purge_expired(&self) -> AppResult<u64> {
        self.purge_synced(self.retention)
    }

    pub fn list_conflicts(&self) -> AppResult<Vec<PendingOperation>> {
        let mut conflicts = self.store.select_by_status(SyncStatus::Conflict)?;
        conflicts.sort_by_key(|op| op.updated_at);
        Ok(conflicts)
    }

    /// Manually clear a conflict record. Records in any other state are left alone.
    pub fn discard_conflict(&self, local_id: &Uuid) -> AppResult<bool> {
        let removed = {
            let _gate = self.gate();
            match self.store.get(local_id)? {
                Some(op) if op.sync_status == SyncStatus::Conflict => self.store.delete(local_id)?,
                _ => false,
            }
        };
        if removed {
            info!(
                target: "studio_offline",
                event = "queue_conflict_discarded",
                local_id = %local_id
            );
            self.note_mutation();
        }
        Ok(removed)
    }

    pub fn status_counts(&self) -> AppResult<StatusCounts> {
        self.store.count_by_status()
    }

    /// Last flush failure that has not yet been cleared by a successful flush.
    pub fn flush_error(&self) -> Option<AppError> {
        self.scheduler
            .as_ref()
            .and_then(PersistenceScheduler::last_error)
    }

    pub fn has_unflushed_changes(&self) -> bool {
        self.scheduler
            .as_ref()
            .map(PersistenceScheduler::is_dirty)
            .unwrap_or(false)
    }

    /// Cancel the debounce timer and write out anything not yet flushed.
    pub async fn shutdown(&self) -> AppResult<()> {
        match &self.scheduler {
            Some(scheduler) => scheduler.shutdown().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::open_memory;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().expect("object payload")
    }

    fn memory_queue() -> PendingQueue {
        PendingQueue::new(open_memory().unwrap(), None, &OfflineConfig::default())
    }

    #[tokio::test]
    async fn update_intents_are_never_deduplicated() {
        let queue = memory_queue();
        let data = payload(json!({"name": "Ali", "phone": "0100"}));
        let a = queue
            .enqueue("customers", SyncAction::Update, data.clone(), Some(8))
            .await
            .unwrap();
        let b = queue
            .enqueue("customers", SyncAction::Update, data, Some(8))
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(queue.list_pending().unwrap().len(), 2);
        assert_eq!(queue.resolve_server_id(&a).unwrap(), Some(8));
    }

    #[tokio::test]
    async fn empty_table_name_is_rejected() {
        let queue = memory_queue();
        let err = queue
            .enqueue("  ", SyncAction::Create, Payload::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUEUE/INVALID_TABLE");
    }

    #[tokio::test]
    async fn mark_synced_on_unknown_id_is_a_no_op() {
        let queue = memory_queue();
        queue.mark_synced(&Uuid::new_v4(), 1).await.unwrap();
        assert_eq!(queue.status_counts().unwrap().total(), 0);
    }

    #[tokio::test]
    async fn conflict_only_applies_to_pending_records() {
        let queue = memory_queue();
        let id = queue
            .enqueue("invoices", SyncAction::Delete, Payload::new(), Some(3))
            .await
            .unwrap();
        assert!(queue.mark_conflict(&id).unwrap());
        assert!(!queue.mark_conflict(&id).unwrap());
        assert!(queue.list_pending().unwrap().is_empty());
        assert_eq!(queue.list_conflicts().unwrap().len(), 1);

        assert!(queue.discard_conflict(&id).unwrap());
        assert!(queue.list_conflicts().unwrap().is_empty());
        assert!(!queue.discard_conflict(&id).unwrap());
    }

    #[tokio::test]
    async fn discard_leaves_pending_records_alone() {
        let queue = memory_queue();
        let id = queue
            .enqueue("customers", SyncAction::Create, payload(json!({"name": "Zed"})), None)
            .await
            .unwrap();
        assert!(!queue.discard_conflict(&id).unwrap());
        assert_eq!(queue.list_pending().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_list_can_be_scoped_to_a_table() {
        let queue = memory_queue();
        queue
            .enqueue("customers", SyncAction::Create, payload(json!({"name": "A"})), None)
            .await
            .unwrap();
        queue
            .enqueue("products", SyncAction::Create, payload(json!({"name": "Clay"})), None)
            .await
            .unwrap();
        let customers = queue.list_pending_for_table("customers").unwrap();
        assert_eq!(customers.len(), 1);
        assert_eq!(customers[0].table_name, "customers");
    }

    #[tokio::test]
    async fn mark_synced_leaves_conflict_records_in_conflict() {
        let queue = memory_queue();
        let id = queue
            .enqueue("products", SyncAction::Update, payload(json!({"name": "Glaze"})), Some(6))
            .await
            .unwrap();
        assert!(queue.mark_conflict(&id).unwrap());

        queue.mark_synced(&id, 60).await.unwrap();
        let counts = queue.status_counts().unwrap();
        assert_eq!((counts.conflict, counts.synced), (1, 0));
        assert_eq!(queue.resolve_server_id(&id).unwrap(), Some(6));
    }

    #[tokio::test]
    async fn purge_with_an_age_beyond_the_calendar_removes_nothing() {
        let queue = memory_queue();
        let id = queue
            .enqueue("invoices", SyncAction::Create, payload(json!({"customer_id": 2})), None)
            .await
            .unwrap();
        queue.mark_synced(&id, 40).await.unwrap();

        let ten_million_years = std::time::Duration::from_secs(10_000_000 * 365 * 86_400);
        assert_eq!(queue.purge_synced(ten_million_years).unwrap(), 0);
        assert_eq!(queue.status_counts().unwrap().synced, 1);
    }

    #[test]
    fn memory_backend_has_no_scheduler() {
        let queue = memory_queue();
        assert!(!queue.has_unflushed_changes());
        assert!(queue.flush_error().is_none());
    }
}
