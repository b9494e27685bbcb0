//! Named groups of spawned tasks, cancellable together.
//!
//! The teacher spawns bare `tokio::spawn` loops per worker with no shared
//! handle or group identity. Here every long-running loop (accept workers,
//! per-connection processing, dispatch workers) is spawned through a
//! [`WorkerGroup`] instead, so a single `cancel()` call reaches every task in
//! that group via a linked [`CancellationToken`], and `join` can wait for
//! them to actually exit.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A named collection of spawned tasks sharing one cancellation token.
///
/// Group names follow the operational naming contract: `tcp/{port}` for
/// accept workers, `tcp/{port}/process` for per-connection processing tasks,
/// `packet-dispatch` for channel-dispatcher workers.
pub struct WorkerGroup {
    name: String,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Creates an empty group linked to `parent` (typically a listener- or
    /// runtime-wide shutdown token).
    pub fn new(name: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            name: name.into(),
            token: parent.child_token(),
            handles: Vec::new(),
        }
    }

    /// The group's name, as used in worker-group naming.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This group's cancellation token. Workers should `select!` against
    /// `.cancelled()` at every suspension point.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawns `task`, passing it this group's token, and tracks the handle.
    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.token()));
        self.handles.push(handle);
    }

    /// Tracks a task spawned outside the group (typically because the
    /// spawning code needed the raw `JoinHandle` itself, as `BufferPool`'s
    /// periodic trim worker does) so `shutdown` still awaits it.
    pub fn adopt(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Number of tasks spawned into this group, including ones that may have
    /// already finished.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancels the group's token. Already-running workers observe this at
    /// their next suspension point and exit; does not itself wait for them.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels the group and awaits every spawned task. Panicked tasks are
    /// logged and otherwise ignored — a worker never propagates a panic to
    /// the caller of `Deactivate`.
    pub async fn shutdown(mut self) {
        self.cancel();
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!(group = %self.name, error = %err, "worker task panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn cancel_signals_every_spawned_task() {
        let parent = CancellationToken::new();
        let mut group = WorkerGroup::new("tcp/7777", &parent);
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            group.spawn(move |token| async move {
                token.cancelled().await;
                seen.fetch_add(1, Ordering::Relaxed);
            });
        }

        group.shutdown().await;
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn child_group_is_independent_of_siblings() {
        let parent = CancellationToken::new();
        let mut a = WorkerGroup::new("tcp/1", &parent);
        let b = WorkerGroup::new("tcp/2", &parent);

        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        a.spawn(move |token| async move {
            token.cancelled().await;
            done2.fetch_add(1, Ordering::Relaxed);
        });

        a.shutdown().await;
        assert_eq!(done.load(Ordering::Relaxed), 1);
        assert!(!b.token().is_cancelled());
    }
}
