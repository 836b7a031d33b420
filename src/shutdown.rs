//! Signal-triggered graceful drain: stop accepting, close live connections
//! (resolving their pending waiters with `Shutdown`), stop the watchdog
//! (component J). Grounded on the teacher's
//! `with_graceful_shutdown(async { tokio::signal::ctrl_c().await.ok(); ... })`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

use crate::registry::Registry;

const GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ShutdownCoordinator {
    notify: Arc<Notify>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }

    /// Resolves once `trigger` has been called. Cloneable and awaitable
    /// from every long-running task (listener accept loop, watchdog, each
    /// connection's event loop).
    pub async fn triggered(&self) {
        self.notify.notified().await;
    }

    pub fn trigger(&self) {
        self.notify.notify_waiters();
    }
}

/// Waits for ctrl-c, then fires the coordinator and hard-closes every live
/// connection after a grace period.
pub async fn wait_for_signal_and_drain(shutdown: ShutdownCoordinator, registry: Registry) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining");
    shutdown.trigger();

    tokio::time::sleep(GRACE_PERIOD).await;
    let remaining = registry.all_handles();
    if !remaining.is_empty() {
        info!(count = remaining.len(), "hard-closing sessions past grace period");
        for handle in remaining {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_pending_waiters() {
        let shutdown = ShutdownCoordinator::new();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move {
            waiter.triggered().await;
        });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should resolve promptly")
            .unwrap();
    }
}
