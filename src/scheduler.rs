//! Persistence Scheduler: decides when in-memory state reaches durable storage.
//!
//! `schedule` (re)arms a debounce timer so a burst of mutations costs one
//! export; `flush_now` cancels the timer and writes before returning. Flushes
//! never overlap: each one runs under `write_gate` and exports the state as
//! of the moment it acquires the gate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::OfflineConfig;
use crate::{AppError, AppResult};

/// Export the store and write it out. Runs on a blocking thread.
pub type FlushFn = Arc<dyn Fn() -> AppResult<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct FlushPolicy {
    pub debounce: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl From<&OfflineConfig> for FlushPolicy {
    fn from(config: &OfflineConfig) -> Self {
        Self {
            debounce: config.debounce,
            retry_attempts: config.flush_retry_attempts.max(1),
            retry_backoff: config.flush_retry_backoff,
        }
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::from(&OfflineConfig::default())
    }
}

struct Inner {
    flush: FlushFn,
    policy: FlushPolicy,
    timer: Mutex<Option<JoinHandle<()>>>,
    write_gate: Mutex<()>,
    dirty: AtomicBool,
    consecutive_failures: AtomicU64,
    last_error: Mutex<Option<AppError>>,
}

impl Inner {
    fn cancel_timer(&self) {
        let pending = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = pending {
            handle.abort();
        }
    }

    fn run_flush(&self, trigger: &'static str) -> AppResult<()> {
        let _gate = self.write_gate.lock().unwrap_or_else(|e| e.into_inner());
        self.flush_locked(trigger)
    }

    /// Waits out any flush already holding the gate, so its outcome is seen.
    fn flush_if_dirty(&self, trigger: &'static str) -> AppResult<()> {
        let _gate = self.write_gate.lock().unwrap_or_else(|e| e.into_inner());
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.flush_locked(trigger)
    }

    /// Blocking flush with retries. Leaves the scheduler dirty on failure.
    /// Caller holds `write_gate`.
    fn flush_locked(&self, trigger: &'static str) -> AppResult<()> {
        let attempts = self.policy.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.dirty.store(false, Ordering::SeqCst);
            match (self.flush)() {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
                    tracing::debug!(
                        target: "studio_offline",
                        event = "flush_completed",
                        trigger,
                        attempt
                    );
                    return Ok(());
                }
                Err(err) => {
                    self.dirty.store(true, Ordering::SeqCst);
                    if attempt < attempts {
                        tracing::warn!(
                            target: "studio_offline",
                            event = "flush_retry",
                            trigger,
                            attempt,
                            error = %err
                        );
                        std::thread::sleep(self.policy.retry_backoff * attempt);
                        attempt += 1;
                        continue;
                    }
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::error!(
                        target: "studio_offline",
                        event = "flush_failed",
                        trigger,
                        attempts,
                        consecutive_failures = failures,
                        error = %err
                    );
                    *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.clone());
                    return Err(err);
                }
            }
        }
    }
}

pub struct PersistenceScheduler {
    inner: Arc<Inner>,
}

impl PersistenceScheduler {
    pub fn new(flush: FlushFn, policy: FlushPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                flush,
                policy,
                timer: Mutex::new(None),
                write_gate: Mutex::new(()),
                dirty: AtomicBool::new(false),
                consecutive_failures: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Record a mutation and (re)start the debounce timer.
    ///
    /// Outside a tokio runtime there is no timer to arm, so the flush runs inline.
    pub fn schedule(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        let Ok(handle) = Handle::try_current() else {
            let _ = self.inner.run_flush("inline");
            return;
        };

        let inner = Arc::clone(&self.inner);
        let delay = self.inner.policy.debounce;
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let worker = Arc::clone(&inner);
            // Failures are logged and kept in `last_error`; the next flush retries.
            let _ = tokio::task::spawn_blocking(move || worker.run_flush("debounced")).await;
        });

        let previous = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancel any pending timer and flush before returning.
    pub async fn flush_now(&self) -> AppResult<()> {
        self.inner.cancel_timer();
        self.on_blocking_pool(|inner| inner.run_flush("immediate")).await
    }

    /// Cancel the timer and write out anything not yet flushed. A debounced
    /// flush already in progress is waited for; if it failed, shutdown retries
    /// and reports the failure.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.inner.cancel_timer();
        self.on_blocking_pool(|inner| inner.flush_if_dirty("shutdown")).await
    }

    async fn on_blocking_pool<F>(&self, job: F) -> AppResult<()>
    where
        F: FnOnce(&Inner) -> AppResult<()> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || job(&*inner))
            .await
            .map_err(|err| {
                AppError::new("SCHEDULER/TASK", "Flush task panicked")
                    .with_context("error", err.to_string())
            })?
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<AppError> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for PersistenceScheduler {
    fn drop(&mut self) {
        self.inner.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn policy(debounce_ms: u64) -> FlushPolicy {
        FlushPolicy {
            debounce: Duration::from_millis(debounce_ms),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn counting() -> (Arc<AtomicUsize>, FlushFn) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flush: FlushFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (calls, flush)
    }

    #[tokio::test]
    async fn burst_of_mutations_coalesces_into_one_flush() {
        let (calls, flush) = counting();
        let scheduler = PersistenceScheduler::new(flush, policy(30));
        for _ in 0..5 {
            scheduler.schedule();
        }
        assert!(scheduler.is_dirty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_dirty());
    }

    #[tokio::test]
    async fn flush_now_pre_empts_the_timer() {
        let (calls, flush) = counting();
        let scheduler = PersistenceScheduler::new(flush, policy(40));
        scheduler.schedule();
        scheduler.flush_now().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flush: FlushFn = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::new("IO/Other", "disk busy"))
            } else {
                Ok(())
            }
        });
        let scheduler = PersistenceScheduler::new(flush, policy(10));
        scheduler.flush_now().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(scheduler.last_error().is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_and_stay_dirty() {
        let flush: FlushFn = Arc::new(|| Err(AppError::new("IO/PermissionDenied", "read-only")));
        let scheduler = PersistenceScheduler::new(flush, policy(10));
        let err = scheduler.flush_now().await.unwrap_err();
        assert_eq!(err.code(), "IO/PermissionDenied");
        assert!(scheduler.is_dirty());
        assert_eq!(
            scheduler.last_error().map(|e| e.code().to_string()),
            Some("IO/PermissionDenied".to_string())
        );
    }

    #[tokio::test]
    async fn shutdown_flushes_only_when_dirty() {
        let (calls, flush) = counting();
        let scheduler = PersistenceScheduler::new(flush, policy(5_000));
        scheduler.shutdown().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        scheduler.schedule();
        scheduler.shutdown().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_a_debounced_flush_in_progress() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flush: FlushFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            Err(AppError::new("IO/Other", "disk gone"))
        });
        let scheduler = PersistenceScheduler::new(
            flush,
            FlushPolicy {
                debounce: Duration::from_millis(10),
                retry_attempts: 1,
                retry_backoff: Duration::from_millis(1),
            },
        );
        scheduler.schedule();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = scheduler.shutdown().await.unwrap_err();
        assert_eq!(err.code(), "IO/Other");
        assert!(scheduler.is_dirty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_after_a_successful_flush_in_progress_does_not_rewrite() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flush: FlushFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            Ok(())
        });
        let scheduler = PersistenceScheduler::new(flush, policy(10));
        scheduler.schedule();
        tokio::time::sleep(Duration::from_millis(60)).await;

        scheduler.shutdown().await.unwrap();
        assert!(!scheduler.is_dirty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_without_runtime_flushes_inline() {
        let (calls, flush) = counting();
        let scheduler = PersistenceScheduler::new(flush, policy(5_000));
        scheduler.schedule();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_dirty());
    }
}
