//! Shutdown coordination for the gateway's background tasks.
//!
//! One `CancellationToken` is the broadcast-once shutdown signal; every
//! long-running loop selects on it at each iteration boundary. Per-peer
//! sessions hang off child tokens so a single peer can be cancelled on its
//! own.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    /// Handles to the long-lived tasks
    task_handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Token cancelled with the root, or on its own
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Spawn a task whose completion `shutdown` waits for.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.task_handles.lock().push((name, handle));
    }

    /// Cancel everything and wait up to `grace` for registered tasks.
    /// Returns false if some task had to be abandoned.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel_token.cancel();

        let handles: Vec<_> = self.task_handles.lock().drain(..).collect();
        let names: Vec<&'static str> = handles.iter().map(|(name, _)| *name).collect();
        let aborts: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();

        let wait_all = async {
            for (name, handle) in handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        tracing::warn!("Task {} ended abnormally: {}", name, e);
                    }
                }
            }
        };

        match tokio::time::timeout(grace, wait_all).await {
            Ok(()) => {
                tracing::debug!("✓ {} background task(s) shut down", names.len());
                true
            }
            Err(_) => {
                tracing::warn!(
                    "⏱️  Shutdown timeout: aborting remaining tasks ({:?})",
                    names
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for ctrl+c (or SIGTERM on unix).
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            tracing::error!("Failed to listen for shutdown signal: {}", e);
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("SIGTERM handler unavailable: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_waits_for_cooperative_tasks() {
        let manager = ShutdownManager::new();
        let finished = Arc::new(AtomicBool::new(false));

        let token = manager.token();
        let flag = finished.clone();
        manager.spawn("loop", async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        assert!(manager.shutdown(Duration::from_secs(1)).await);
        assert!(finished.load(Ordering::SeqCst));
        assert!(manager.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_tasks() {
        let manager = ShutdownManager::new();
        manager.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert!(!manager.shutdown(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_child_tokens_follow_root() {
        let manager = ShutdownManager::new();
        let child = manager.child_token();
        let sibling = manager.child_token();
        child.cancel();
        assert!(!sibling.is_cancelled());
        manager.shutdown(Duration::from_millis(10)).await;
        assert!(sibling.is_cancelled());
    }
}
