//! Exponential-backoff reconnection controller (spec §4.5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::status::{ConnectionStatus, StatusManager};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// 0 = unbounded.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 0,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Delay for the `retry_count`-th attempt (0-indexed), per spec §4.5 step 2.
pub fn compute_delay(config: &ReconnectConfig, retry_count: u32) -> Duration {
    let raw = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(retry_count as i32);
    let capped = raw.min(config.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}

/// Drives reconnect attempts for a single transport. Generic over the
/// async connect function so it has no dependency on C2/C3 directly.
pub struct ReconnectController {
    config: ReconnectConfig,
    status: Arc<StatusManager>,
    retry_count: AtomicU32,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig, status: Arc<StatusManager>) -> Self {
        Self {
            config,
            status,
            retry_count: AtomicU32::new(0),
            timer: Mutex::new(None),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Whether another attempt should be scheduled at all, given the
    /// current retry count (spec §4.5 step 1).
    pub fn should_retry(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let retries = self.retry_count.load(Ordering::SeqCst);
        self.config.max_retries == 0 || retries < self.config.max_retries
    }

    /// Arm the reconnect timer, invoking `connect` when it fires. At most
    /// one timer is armed at a time — arming again cancels the previous one.
    pub fn schedule<F, Fut>(self: &Arc<Self>, connect: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        if !self.should_retry() {
            let _ = self.status.set(ConnectionStatus::Disconnected, None);
            return;
        }

        let delay = compute_delay(&self.config, self.retry_count.load(Ordering::SeqCst));
        let _ = self.status.set(ConnectionStatus::Reconnecting, None);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retry_count.fetch_add(1, Ordering::SeqCst);
            let _ = this.status.set(ConnectionStatus::Connecting, None);
            match connect().await {
                Ok(()) => {
                    this.retry_count.store(0, Ordering::SeqCst);
                    let _ = this.status.set(ConnectionStatus::Connected, None);
                }
                Err(e) => {
                    let _ = this.status.set(ConnectionStatus::Disconnected, Some(e));
                }
            }
        });
        *self.timer.lock() = Some(handle);
    }

    /// Cancel any armed timer without connecting. Safe to call repeatedly.
    pub fn cancel(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn delay_table_matches_spec() {
        let cfg = ReconnectConfig {
            enabled: true,
            max_retries: 0,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        };
        let expected = [100, 200, 400, 800, 1000];
        for (i, exp) in expected.iter().enumerate() {
            assert_eq!(compute_delay(&cfg, i as u32), ms(*exp));
        }
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let status = Arc::new(StatusManager::new());
        let controller = Arc::new(ReconnectController::new(
            ReconnectConfig {
                enabled: true,
                max_retries: 3,
                ..ReconnectConfig::default()
            },
            status,
        ));
        assert!(controller.should_retry());
        controller.retry_count.store(3, Ordering::SeqCst);
        assert!(!controller.should_retry());
    }

    #[test]
    fn disabled_never_retries() {
        let status = Arc::new(StatusManager::new());
        let controller = ReconnectController::new(
            ReconnectConfig { enabled: false, ..ReconnectConfig::default() },
            status,
        );
        assert!(!controller.should_retry());
    }

    #[tokio::test]
    async fn exhausting_max_retries_leaves_status_disconnected() {
        let status = Arc::new(StatusManager::new());
        let controller = Arc::new(ReconnectController::new(
            ReconnectConfig {
                enabled: true,
                max_retries: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                backoff_multiplier: 1.0,
            },
            status.clone(),
        ));
        controller.retry_count.store(3, Ordering::SeqCst);
        controller.schedule(|| async { Ok(()) });
        assert_eq!(status.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn cancel_aborts_pending_timer() {
        let status = Arc::new(StatusManager::new());
        let controller = Arc::new(ReconnectController::new(
            ReconnectConfig {
                enabled: true,
                max_retries: 0,
                initial_delay_ms: 50,
                max_delay_ms: 50,
                backoff_multiplier: 1.0,
            },
            status.clone(),
        ));
        controller.schedule(|| async { Ok(()) });
        controller.cancel();
        tokio::time::sleep(ms(100)).await;
        // Timer was cancelled before it could fire and flip status.
        assert_eq!(status.status(), ConnectionStatus::Reconnecting);
    }
}
