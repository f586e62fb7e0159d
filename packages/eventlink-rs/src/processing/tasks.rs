//! Background task tracking.
//!
//! Every task spawned by a [`TokioProcessingService`](super::TokioProcessingService)
//! is recorded twice: in the owning service's [`TaskTracker`] and in one
//! process-wide set shared by all services. Both entries are removed by a
//! guard that lives inside the task, so a task that finishes, fails, panics or
//! is aborted always cleans up after itself.
//!
//! The process-wide set is created on first use and lives for the whole
//! process. It is only ever drained by tasks finishing; it is never torn down.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::warn;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL_TASKS: LazyLock<Mutex<HashSet<u64>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Number of tracked background tasks across every service in the process.
pub fn global_task_count() -> usize {
    lock(&GLOBAL_TASKS).len()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("task set lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Where a tracked task is in its life.
enum Slot {
    /// Id reserved, task not yet handed to the runtime.
    Reserved,
    /// Aborted before its handle was known; aborted as soon as it is.
    Cancelled,
    Running(AbortHandle),
}

/// The set of live background tasks owned by one service.
#[derive(Default)]
pub(crate) struct TaskTracker {
    tasks: Mutex<HashMap<u64, Slot>>,
    notify: Notify,
}

impl TaskTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` on `handle` and track it until it is gone.
    pub(crate) fn spawn<F>(self: &Arc<Self>, handle: &Handle, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Reserve the slot first; the task may finish before spawn returns.
        let guard = self.reserve();
        let id = guard.id;

        let join = handle.spawn(async move {
            let _guard = guard;
            fut.await;
        });

        self.attach(id, join.abort_handle());
    }

    fn reserve(self: &Arc<Self>) -> TaskGuard {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        lock(&self.tasks).insert(id, Slot::Reserved);
        lock(&GLOBAL_TASKS).insert(id);
        TaskGuard {
            tracker: self.clone(),
            id,
        }
    }

    fn attach(&self, id: u64, handle: AbortHandle) {
        let cancelled = {
            let mut tasks = lock(&self.tasks);
            match tasks.get_mut(&id) {
                Some(slot) if matches!(slot, Slot::Reserved) => {
                    *slot = Slot::Running(handle);
                    None
                }
                Some(_) => Some(handle),
                None => None,
            }
        };
        if let Some(handle) = cancelled {
            handle.abort();
        }
    }

    /// Number of live tasks.
    pub(crate) fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Abort every live task. Returns how many were signalled.
    ///
    /// A task still being spawned is marked and aborted once its handle is
    /// attached.
    pub(crate) fn abort_all(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        for slot in tasks.values_mut() {
            match slot {
                Slot::Running(handle) => handle.abort(),
                Slot::Reserved => *slot = Slot::Cancelled,
                Slot::Cancelled => {}
            }
        }
        tasks.len()
    }

    /// Wait until no task is live.
    ///
    /// Tasks spawned while waiting are waited for as well.
    pub(crate) async fn wait_zero(&self) {
        loop {
            // Register for notification BEFORE checking the count
            let notified = self.notify.notified();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self, id: u64) {
        let mut tasks = lock(&self.tasks);
        tasks.remove(&id);
        lock(&GLOBAL_TASKS).remove(&id);
        if tasks.is_empty() {
            self.notify.notify_waiters();
        }
    }
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("live", &self.len())
            .finish()
    }
}

/// Removes a task's entries when the task's future is dropped.
struct TaskGuard {
    tracker: Arc<TaskTracker>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_are_removed_on_completion() {
        let tracker = Arc::new(TaskTracker::new());
        let handle = Handle::current();

        for _ in 0..5 {
            tracker.spawn(&handle, async {
                tokio::time::sleep(Duration::from_millis(5)).await;
            });
        }
        assert_eq!(tracker.len(), 5);

        tracker.wait_zero().await;
        assert_eq!(tracker.len(), 0);
    }

    #[tokio::test]
    async fn test_aborted_tasks_clean_up() {
        let tracker = Arc::new(TaskTracker::new());
        tracker.spawn(&Handle::current(), std::future::pending::<()>());

        assert_eq!(tracker.abort_all(), 1);
        tokio::time::timeout(Duration::from_secs(1), tracker.wait_zero())
            .await
            .expect("aborted task should release its slot");
    }

    #[tokio::test]
    async fn test_abort_reaches_task_spawned_concurrently() {
        let tracker = Arc::new(TaskTracker::new());
        let guard = tracker.reserve();
        let id = guard.id;

        // Abort lands between reservation and attaching the handle.
        assert_eq!(tracker.abort_all(), 1);

        let join = Handle::current().spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        tracker.attach(id, join.abort_handle());

        tokio::time::timeout(Duration::from_secs(1), tracker.wait_zero())
            .await
            .expect("task cancelled while spawning should be aborted");
        assert!(join.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_zero_returns_immediately_when_idle() {
        let tracker = TaskTracker::new();
        tracker.wait_zero().await;
    }
}
