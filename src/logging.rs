use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::AppResult;

pub const LOG_ENV: &str = "STUDIO_OFFLINE_LOG";
pub const LOG_JSON_ENV: &str = "STUDIO_OFFLINE_LOG_JSON";
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "studio-offline.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn json_requested() -> bool {
    std::env::var(LOG_JSON_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true"))
        .unwrap_or(false)
}

/// Install the stderr subscriber. Later calls (or an already installed
/// subscriber) are a no-op.
pub fn init_logging() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339());
    let _ = if json_requested() {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Install stderr plus a daily-rolling JSON file sink under `<data_dir>/logs`.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init_file_logging(data_dir: &Path) -> AppResult<WorkerGuard> {
    let dir = data_dir.join(LOG_DIR_NAME);
    std::fs::create_dir_all(&dir)
        .map_err(|err| crate::AppError::from(err).with_context("path", dir.display().to_string()))?;

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(writer);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_logging();
        init_logging();
        let tmp = tempfile::tempdir().unwrap();
        let _guard = init_file_logging(tmp.path()).unwrap();
        assert!(tmp.path().join(LOG_DIR_NAME).is_dir());
    }
}
