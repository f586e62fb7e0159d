//! Thread-pool processing.
//!
//! A fixed number of named OS threads share one channel of tasks. Each task
//! gets a fresh current-thread Tokio runtime, so the callbacks it drives can
//! await, sleep and offload exactly as they would under
//! [`TokioProcessingService`](super::TokioProcessingService).
//!
//! The pool must be shut down. [`WorkerPoolProcessingService::shutdown`]
//! closes the channel, lets the workers finish everything already queued, and
//! joins them; dropping the pool does the same.

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use super::{fresh_runtime, log_outcome, ProcessingService, Task};
use crate::error::EventLinkError;

const SERVICE: &str = "worker_pool";

/// Default thread name prefix.
pub const DEFAULT_POOL_NAME: &str = "eventlink-worker";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("worker pool lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Processing service backed by a pool of OS threads.
pub struct WorkerPoolProcessingService {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPoolProcessingService {
    /// Start `workers` threads (at least one).
    pub fn new(workers: usize) -> Result<Self, EventLinkError> {
        Self::with_name(DEFAULT_POOL_NAME, workers)
    }

    /// Start `workers` threads named `{name}-{index}`.
    pub fn with_name(name: impl Into<String>, workers: usize) -> Result<Self, EventLinkError> {
        let name = name.into();
        let size = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || work(receiver));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Closing the channel stops the threads already started.
                    drop(sender);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(EventLinkError::RuntimeUnavailable(e));
                }
            }
        }

        debug!(pool = %name, workers = size, "worker pool started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            size,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        lock(&self.sender).is_none()
    }

    /// Stop accepting tasks, finish the queued ones, and join the workers.
    ///
    /// Blocks the calling thread. Safe to call more than once.
    pub fn shutdown(&self) {
        let sender = lock(&self.sender).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let current = thread::current().id();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            // A task that drops the last pool handle runs on a worker; it
            // cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "worker thread panicked");
            }
        }
        debug!(pool = %self.name, "worker pool shut down");
    }
}

fn work(receiver: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let next = lock(&receiver).recv();
        let Ok(task) = next else {
            return;
        };
        match fresh_runtime() {
            Ok(runtime) => log_outcome(SERVICE, runtime.block_on(task.run())),
            Err(e) => error!(error = %e, "dropping task: no runtime"),
        }
    }
}

impl ProcessingService for WorkerPoolProcessingService {
    fn submit(&self, task: Task) -> Result<(), EventLinkError> {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(EventLinkError::ServiceShutdown);
        };
        sender
            .send(task)
            .map_err(|_| EventLinkError::ServiceShutdown)
    }
}

impl Drop for WorkerPoolProcessingService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPoolProcessingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolProcessingService")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_tasks_run_on_named_workers() {
        let pool = WorkerPoolProcessingService::with_name("unit", 2).unwrap();
        let names = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..4 {
            let names = names.clone();
            pool.submit(Task::future(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                let name = thread::current().name().map(str::to_string);
                names.lock().unwrap().push(name);
                Ok(())
            }))
            .unwrap();
        }
        pool.shutdown();

        let names = names.lock().unwrap();
        assert_eq!(names.len(), 4);
        assert!(names
            .iter()
            .all(|n| n.as_deref().is_some_and(|n| n.starts_with("unit-"))));
    }

    #[test]
    fn test_shutdown_drains_pending_work() {
        let pool = WorkerPoolProcessingService::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = counter.clone();
            pool.submit(Task::blocking(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPoolProcessingService::new(1).unwrap();
        pool.shutdown();
        pool.shutdown();

        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.submit(Task::blocking(|| Ok(()))),
            Err(EventLinkError::ServiceShutdown)
        ));
    }

    #[test]
    fn test_failing_task_keeps_worker_alive() {
        let pool = WorkerPoolProcessingService::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(Task::blocking(|| Err(anyhow::anyhow!("broken"))))
            .unwrap();
        pool.submit(Task::blocking(|| panic!("worse"))).unwrap();
        let after = counter.clone();
        pool.submit(Task::blocking(move || {
            after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_workers_means_one() {
        let pool = WorkerPoolProcessingService::new(0).unwrap();
        assert_eq!(pool.size(), 1);
    }
}
