//! Task supervision for a running node.
//!
//! Shard loops, the cache sweep, the watchdog and the bus consumer are all
//! started through [`ShutdownCoordinator::spawn`]. Each gets a child of the
//! root token; [`ShutdownCoordinator::drain`] cancels the root and joins them.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Supervised {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Owns the root cancellation token and every supervised join handle.
#[derive(Default)]
pub struct ShutdownCoordinator {
    root: CancellationToken,
    running: Mutex<Vec<Supervised>>,
}

impl ShutdownCoordinator {
    /// Coordinator with no tasks and an uncancelled root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The root token itself; cancelling it stops everything.
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Token cancelled with the root, or on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Start `task` with its own child token. The future must return once
    /// that token is cancelled.
    pub fn spawn<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.child_token()));
        debug!(task = name, "supervised task started");
        self.running.lock().push(Supervised { name, handle });
    }

    /// Tasks spawned and not yet drained.
    pub fn task_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Cancel the root without waiting.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Whether the root has been cancelled.
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel the root and join every supervised task, giving up after
    /// `timeout`. Tasks still running at that point are left detached.
    pub async fn drain(&self, timeout: Duration) {
        let running = std::mem::take(&mut *self.running.lock());
        self.shutdown();
        info!(tasks = running.len(), ?timeout, "draining supervised tasks");

        let joins = running.into_iter().map(|Supervised { name, handle }| async move {
            match handle.await {
                Ok(()) => debug!(task = name, "supervised task stopped"),
                Err(e) => warn!(task = name, error = %e, "supervised task ended abnormally"),
            }
        });
        if tokio::time::timeout(timeout, join_all(joins)).await.is_err() {
            warn!(?timeout, "drain deadline passed with tasks still running");
        }
    }
}
