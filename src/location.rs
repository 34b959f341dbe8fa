//! Storage Location Resolver: picks the backend and its durable location
//! for the hosting environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::config::OfflineConfig;
use crate::snapshot::{BlobStore, FileBlobStore};
use crate::store::object_store::DEFAULT_DATABASE_NAME;
use crate::store::{LocalStore, ObjectStore, SqliteStore};
use crate::{AppError, AppResult};

pub const APP_IDENTIFIER: &str = "com.studio.offline";
pub const SNAPSHOT_FILE_NAME: &str = "offline-queue.snapshot";
pub const OBJECT_STORE_DIR_NAME: &str = "object-store";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum HostEnvironment {
    /// Desktop shell with a writable app data directory.
    Desktop,
    /// Storage-sandboxed web host with a per-origin object store.
    Browser,
}

impl fmt::Display for HostEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HostEnvironment::Desktop => "desktop",
            HostEnvironment::Browser => "browser",
        })
    }
}

impl FromStr for HostEnvironment {
    type Err = AppError;

    fn from_str(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(HostEnvironment::Desktop),
            "browser" | "web" => Ok(HostEnvironment::Browser),
            other => Err(AppError::new("LOCATION/UNKNOWN_HOST", "Unknown host environment")
                .with_context("value", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// Relational image written to a single file.
    SnapshotFile { path: PathBuf },
    /// Record-per-object store under `root/database`.
    ObjectStore { root: PathBuf, database: String },
    /// Relational image kept by the host behind its own blob primitives.
    HostBlob { describe: String },
    /// Nothing durable; used when the durable store cannot be opened.
    Memory,
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::SnapshotFile { path } => write!(f, "file:{}", path.display()),
            StorageLocation::ObjectStore { root, database } => {
                write!(f, "objects:{}/{}", root.display(), database)
            }
            StorageLocation::HostBlob { describe } => write!(f, "host:{describe}"),
            StorageLocation::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageResolver {
    host: HostEnvironment,
    data_dir: Option<PathBuf>,
}

impl StorageResolver {
    pub fn new(host: HostEnvironment, data_dir: Option<PathBuf>) -> Self {
        Self { host, data_dir }
    }

    pub fn from_config(config: &OfflineConfig) -> Self {
        Self::new(config.host, config.data_dir.clone())
    }

    pub fn host(&self) -> HostEnvironment {
        self.host
    }

    /// Explicit data dir if configured, else the platform data dir.
    pub fn base_dir(&self) -> AppResult<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|base| base.join(APP_IDENTIFIER))
            .or_else(|| std::env::current_dir().ok())
            .ok_or_else(|| {
                AppError::new(
                    "LOCATION/NO_DATA_DIR",
                    "Failed to resolve application data directory",
                )
            })
    }

    pub fn resolve(&self) -> AppResult<StorageLocation> {
        let base = self.base_dir()?;
        Ok(match self.host {
            HostEnvironment::Desktop => StorageLocation::SnapshotFile {
                path: base.join(SNAPSHOT_FILE_NAME),
            },
            HostEnvironment::Browser => StorageLocation::ObjectStore {
                root: base.join(OBJECT_STORE_DIR_NAME),
                database: DEFAULT_DATABASE_NAME.to_string(),
            },
        })
    }
}

/// A backend ready for the queue, plus where its snapshot goes when the
/// backend needs explicit flushing.
pub struct OpenedStore {
    pub store: Arc<dyn LocalStore>,
    pub blob: Option<Arc<dyn BlobStore>>,
    pub location: StorageLocation,
}

impl fmt::Debug for OpenedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedStore")
            .field("location", &self.location)
            .field("flush_mode", &self.store.flush_mode())
            .finish()
    }
}

/// Build and initialise the backend for `location`, loading any existing
/// durable state.
pub fn open_store(location: &StorageLocation) -> AppResult<OpenedStore> {
    match location {
        StorageLocation::SnapshotFile { path } => {
            let blob: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(path.clone()));
            open_with_blob(blob, location.clone())
        }
        StorageLocation::ObjectStore { root, database } => {
            let store = ObjectStore::new(root, database);
            store.init()?;
            Ok(OpenedStore {
                store: Arc::new(store),
                blob: None,
                location: location.clone(),
            })
        }
        StorageLocation::HostBlob { .. } => Err(AppError::new(
            "STORE/INIT_FAILED",
            "Host blob locations need the host's blob store",
        )
        .with_context("location", location.to_string())),
        StorageLocation::Memory => Ok(OpenedStore {
            store: open_memory()?,
            blob: None,
            location: StorageLocation::Memory,
        }),
    }
}

/// Relational backend over host-supplied blob primitives.
pub fn open_with_blob(
    blob: Arc<dyn BlobStore>,
    location: StorageLocation,
) -> AppResult<OpenedStore> {
    let store = SqliteStore::open_in_memory()?;
    store.init()?;
    if let Some(bytes) = blob.read()? {
        store.import_snapshot(&bytes).map_err(|err| {
            AppError::new("STORE/INIT_FAILED", "Unable to load durable snapshot")
                .with_context("location", blob.describe())
                .with_cause(err)
        })?;
        tracing::info!(
            target: "studio_offline",
            event = "snapshot_loaded",
            location = %blob.describe(),
            bytes = bytes.len()
        );
    }
    Ok(OpenedStore {
        store: Arc::new(store),
        blob: Some(blob),
        location,
    })
}

pub fn open_memory() -> AppResult<Arc<dyn LocalStore>> {
    let store = SqliteStore::open_in_memory()?;
    store.init()?;
    Ok(Arc::new(store))
}
