#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use studio_offline_lib::snapshot::BlobStore;
use studio_offline_lib::{AppError, AppResult, HostEnvironment, OfflineConfig, Payload};

pub fn config_for(host: HostEnvironment, dir: &Path) -> OfflineConfig {
    OfflineConfig {
        host,
        data_dir: Some(dir.to_path_buf()),
        debounce: Duration::from_millis(10),
        flush_retry_backoff: Duration::from_millis(1),
        ..OfflineConfig::default()
    }
}

pub fn desktop_config(dir: &Path) -> OfflineConfig {
    config_for(HostEnvironment::Desktop, dir)
}

pub fn browser_config(dir: &Path) -> OfflineConfig {
    config_for(HostEnvironment::Browser, dir)
}

pub const HOSTS: [HostEnvironment; 2] = [HostEnvironment::Desktop, HostEnvironment::Browser];

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be a JSON object")
}

pub fn fixed_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
}

/// Blob primitives kept in memory, standing in for a host IPC bridge.
#[derive(Default)]
pub struct MemoryBlob {
    pub bytes: Mutex<Option<Vec<u8>>>,
    pub fail_writes: Mutex<bool>,
    pub writes: Mutex<usize>,
}

impl MemoryBlob {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail_writes.lock().unwrap() = failing;
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

impl BlobStore for MemoryBlob {
    fn read(&self) -> AppResult<Option<Vec<u8>>> {
        Ok(self.bytes.lock().unwrap().clone())
    }

    fn write(&self, bytes: &[u8]) -> AppResult<()> {
        if *self.fail_writes.lock().unwrap() {
            return Err(AppError::new("IO/PermissionDenied", "blob is read-only"));
        }
        *self.bytes.lock().unwrap() = Some(bytes.to_vec());
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory-blob".into()
    }
}
