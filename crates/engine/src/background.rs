//! Tracker for detached work (state writes, webhook calls) that must outlive
//! the request that spawned it.

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Owns every fire-and-forget task so the process can drain them on shutdown.
/// Outcomes are only observable through logs and metrics.
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a detached task. Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.tasks.lock();
        // Reap finished tasks so the set does not grow without bound
        while let Some(result) = set.try_join_next() {
            if let Err(e) = result {
                warn!(error = %e, "Background task panicked or was cancelled");
            }
        }
        set.spawn(task);
        metrics::counter!("background.spawned", "task" => name).increment(1);
        debug!(task = name, pending = set.len(), "Background task spawned");
    }

    /// Number of tasks spawned and not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait for every tracked task, including tasks spawned while draining.
    pub async fn drain(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.tasks.lock());
            if set.is_empty() {
                return;
            }
            while let Some(result) = set.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Background task panicked or was cancelled");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_waits_for_all_tasks() {
        let tasks = Arc::new(BackgroundTasks::new());
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..5u64 {
            let done = done.clone();
            tasks.spawn("test", async move {
                tokio::time::sleep(Duration::from_millis(5 * i)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_drain_includes_nested_spawns() {
        let tasks = Arc::new(BackgroundTasks::new());
        let done = Arc::new(AtomicUsize::new(0));

        let inner_tasks = tasks.clone();
        let inner_done = done.clone();
        tasks.spawn("outer", async move {
            let done = inner_done.clone();
            inner_tasks.spawn("inner", async move {
                done.fetch_add(1, Ordering::SeqCst);
            });
            inner_done.fetch_add(1, Ordering::SeqCst);
        });

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_poison_tracker() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("boom", async { panic!("boom") });
        tasks.drain().await;
        tasks.spawn("ok", async {});
        tasks.drain().await;
        assert_eq!(tasks.pending(), 0);
    }
}
