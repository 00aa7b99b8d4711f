use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Daemon-wide stop flag plus a count of background loops that have wound
/// down.
///
/// The HTTP server and the session janitor both wait on the same signal;
/// each loop holds a [`ShutdownGuard`] so the daemon can tell when they are
/// finished.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    stop: Arc<watch::Sender<bool>>,
    drained: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        let (drained, _) = watch::channel(0);
        Self {
            stop: Arc::new(stop),
            drained: Arc::new(drained),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.stop.borrow()
    }

    /// Flip the stop flag. Later calls only log.
    pub fn trigger(&self) {
        if self.stop.send_if_modified(|stopped| !std::mem::replace(stopped, true)) {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolve once shutdown has been triggered, including before the call.
    pub async fn wait(&self) {
        let mut rx = self.stop.subscribe();
        // The sender lives in `self`, so this cannot see a closed channel.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    fn confirm_drained(&self) {
        self.drained.send_modify(|count| *count += 1);
    }

    /// Wait until `expected` guards have been dropped, or `timeout` passes.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drained.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|count| *count >= expected)).await {
            Ok(Ok(count)) => {
                info!(count = *count, "background loops drained");
                DrainResult::Complete(*count)
            }
            Ok(Err(_)) | Err(_) => {
                let confirmed = *self.drained.borrow();
                warn!(confirmed, expected, "drain timed out");
                DrainResult::Timeout {
                    confirmed,
                    expected,
                }
            }
        };
        result
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// Counts as drained when dropped.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}
