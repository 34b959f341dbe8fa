//! Process-scoped holder for the queue, built once during startup and
//! passed explicitly to the network client and sync collaborator.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::OfflineConfig;
use crate::location::{
    open_memory, open_store, open_with_blob, OpenedStore, StorageLocation, StorageResolver,
};
use crate::queue::PendingQueue;
use crate::snapshot::BlobStore;
use crate::time::Clock;
use crate::{AppError, AppResult};

pub struct OfflineContext {
    queue: PendingQueue,
    location: StorageLocation,
    degraded: Option<AppError>,
}

impl OfflineContext {
    /// Resolve the durable location for `config.host` and open it.
    ///
    /// If the durable store cannot be opened the queue runs on a memory-only
    /// store and [`degraded`](Self::degraded) reports why. The durable file is
    /// left untouched in that case. Only fails when even that store cannot open.
    pub fn open(config: &OfflineConfig) -> AppResult<Self> {
        Self::open_with_clock(config, None)
    }

    pub fn open_with_clock(
        config: &OfflineConfig,
        clock: Option<Arc<dyn Clock>>,
    ) -> AppResult<Self> {
        let opened = StorageResolver::from_config(config)
            .resolve()
            .and_then(|location| {
                open_store(&location)
                    .map_err(|err| err.with_context("location", location.to_string()))
            });
        Self::from_result(opened, config, clock)
    }

    /// Open an explicit location, bypassing host resolution.
    pub fn open_at(location: &StorageLocation, config: &OfflineConfig) -> AppResult<Self> {
        Self::from_result(open_store(location), config, None)
    }

    /// Relational backend over host-supplied blob primitives, for hosts that
    /// keep the snapshot behind an IPC boundary.
    pub fn open_with_blob(blob: Arc<dyn BlobStore>, config: &OfflineConfig) -> AppResult<Self> {
        let location = StorageLocation::HostBlob {
            describe: blob.describe(),
        };
        Self::from_result(open_with_blob(blob, location), config, None)
    }

    fn from_result(
        opened: AppResult<OpenedStore>,
        config: &OfflineConfig,
        clock: Option<Arc<dyn Clock>>,
    ) -> AppResult<Self> {
        let (opened, degraded) = match opened {
            Ok(opened) => (opened, None),
            Err(err) => {
                error!(
                    target: "studio_offline",
                    event = "store_init_fallback",
                    code = err.code(),
                    error = %err
                );
                let store = open_memory()
                    .map_err(|memory_err| err.clone().with_cause(memory_err))?;
                let fallback = OpenedStore {
                    store,
                    blob: None,
                    location: StorageLocation::Memory,
                };
                (fallback, Some(err))
            }
        };

        let location = opened.location.clone();
        info!(
            target: "studio_offline",
            event = "offline_context_ready",
            location = %location,
            degraded = degraded.is_some()
        );
        let mut queue = PendingQueue::from_opened(opened, config);
        if let Some(clock) = clock {
            queue = queue.with_clock(clock);
        }
        Ok(Self {
            queue,
            location,
            degraded,
        })
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Why the durable store could not be used, if it could not.
    pub fn degraded(&self) -> Option<&AppError> {
        self.degraded.as_ref()
    }

    pub async fn shutdown(&self) -> AppResult<()> {
        self.queue.shutdown().await
    }
}
