use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::location::HostEnvironment;

const DEFAULT_DEBOUNCE_MS: u64 = 100;
const MIN_DEBOUNCE_MS: u64 = 10;
const MAX_DEBOUNCE_MS: u64 = 10_000;
const DEFAULT_RETENTION_HOURS: u64 = 24;
const MAX_RETENTION_HOURS: u64 = 24 * 365;
const DEFAULT_FLUSH_ATTEMPTS: u32 = 3;
const HARD_MAX_FLUSH_ATTEMPTS: u32 = 10;
const DEFAULT_FLUSH_BACKOFF_MS: u64 = 50;

/// Knobs for the offline queue. The core takes this by value; only
/// bootstrapping code calls [`OfflineConfig::load`].
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineConfig {
    pub host: HostEnvironment,
    /// Overrides the platform data directory.
    pub data_dir: Option<PathBuf>,
    pub debounce: Duration,
    /// Default age after which synced records are purged.
    pub retention: Duration,
    pub flush_retry_attempts: u32,
    pub flush_retry_backoff: Duration,
    /// Flush immediately after `mark_synced` instead of debouncing.
    pub strict_mark_synced: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            host: HostEnvironment::Desktop,
            data_dir: None,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            retention: Duration::from_secs(DEFAULT_RETENTION_HOURS * 3600),
            flush_retry_attempts: DEFAULT_FLUSH_ATTEMPTS,
            flush_retry_backoff: Duration::from_millis(DEFAULT_FLUSH_BACKOFF_MS),
            strict_mark_synced: false,
        }
    }
}

impl OfflineConfig {
    /// Defaults overlaid with `STUDIO_OFFLINE_*` environment variables.
    /// Unparseable values are ignored; out-of-range values are clamped.
    pub fn load() -> Self {
        let defaults = Self::default();

        let host = env::var("STUDIO_OFFLINE_HOST")
            .ok()
            .and_then(|value| value.parse::<HostEnvironment>().ok())
            .unwrap_or(defaults.host);

        let data_dir = env::var_os("STUDIO_OFFLINE_DATA_DIR")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let debounce = env_u64("STUDIO_OFFLINE_DEBOUNCE_MS")
            .map(|ms| Duration::from_millis(ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS)))
            .unwrap_or(defaults.debounce);

        let retention = env_u64("STUDIO_OFFLINE_RETENTION_HOURS")
            .filter(|hours| *hours > 0)
            .map(|hours| Duration::from_secs(hours.min(MAX_RETENTION_HOURS) * 3600))
            .unwrap_or(defaults.retention);

        let flush_retry_attempts = env_u64("STUDIO_OFFLINE_FLUSH_ATTEMPTS")
            .filter(|attempts| *attempts > 0)
            .map(|attempts| attempts.min(u64::from(HARD_MAX_FLUSH_ATTEMPTS)) as u32)
            .unwrap_or(defaults.flush_retry_attempts);

        let strict_mark_synced = env::var("STUDIO_OFFLINE_STRICT_MARK_SYNCED")
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.strict_mark_synced);

        Self {
            host,
            data_dir,
            debounce,
            retention,
            flush_retry_attempts,
            strict_mark_synced,
            ..defaults
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse::<u64>().ok())
}
