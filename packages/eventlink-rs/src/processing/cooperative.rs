//! Tokio-backed processing: the cooperative strategy.
//!
//! # Scheduling
//!
//! ```text
//! submit(task)
//!   ├─ enforce_submission_order ─► FIFO queue ─► single drain loop
//!   └─ otherwise
//!        ├─ Task::Async    ─► runtime? spawn tracked task : block_on temporary runtime
//!        └─ Task::Blocking ─► force_async? spawn_blocking as tracked task : run inline
//! ```
//!
//! "Runtime?" means [`Handle::try_current`]: a caller inside a Tokio runtime
//! gets background tasks, a caller outside one has the work driven to
//! completion before `submit` returns.
//!
//! # Submission Order
//!
//! With `enforce_submission_order`, every task goes through one queue guarded
//! by one lock, together with a `draining` flag. The submission that finds the
//! service idle starts the drain loop; every other submission only enqueues.
//! The loop pops and awaits one task at a time until the queue is empty, so
//! tasks complete in exactly the order `submit` accepted them, no matter how
//! many threads submit concurrently.
//!
//! # Failures
//!
//! A failed or panicking task is logged at `error!` and never stops the
//! service or the drain loop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::tasks::TaskTracker;
use super::{fresh_runtime, log_outcome, run_blocking, ProcessingService, Task};
use crate::error::EventLinkError;

const SERVICE: &str = "tokio";

#[derive(Default)]
struct OrderState {
    queue: VecDeque<Task>,
    draining: bool,
    // Bumped by `cancel_tasks`; a drain loop from an older generation stops.
    generation: u64,
}

struct TokioInner {
    force_async: bool,
    enforce_submission_order: bool,
    tasks: Arc<TaskTracker>,
    order: Mutex<OrderState>,
}

impl TokioInner {
    fn order(&self) -> MutexGuard<'_, OrderState> {
        match self.order.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("submission queue lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Run one task to completion on the current runtime.
    async fn execute(&self, task: Task) {
        let result = match task {
            Task::Blocking(f) if self.force_async => {
                tokio::task::spawn_blocking(move || run_blocking(f))
                    .await
                    .unwrap_or_else(|e| {
                        Err(anyhow::anyhow!("blocking task did not complete: {e}"))
                    })
            }
            task => task.run().await,
        };
        log_outcome(SERVICE, result);
    }

    async fn drain(self: Arc<Self>, generation: u64) {
        loop {
            let next = {
                let mut order = self.order();
                if order.generation != generation {
                    return;
                }
                match order.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        order.draining = false;
                        return;
                    }
                }
            };
            self.execute(next).await;
        }
    }
}

/// Processing service running tasks on Tokio.
///
/// Cheap to clone; clones share the tracked task set and the submission
/// queue.
#[derive(Clone)]
pub struct TokioProcessingService {
    inner: Arc<TokioInner>,
}

impl Default for TokioProcessingService {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioProcessingService {
    /// A service that runs blocking tasks inline and does not order tasks.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Configure a service.
    pub fn builder() -> TokioServiceBuilder {
        TokioServiceBuilder::default()
    }

    /// Returns true if blocking tasks are moved onto the blocking pool.
    pub fn force_async(&self) -> bool {
        self.inner.force_async
    }

    /// Returns true if tasks run strictly in submission order.
    pub fn enforce_submission_order(&self) -> bool {
        self.inner.enforce_submission_order
    }

    /// Number of this service's background tasks still running.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Wait until every background task of this service has finished.
    ///
    /// Tasks submitted while waiting are waited for too.
    pub async fn wait_for_tasks(&self) {
        self.inner.tasks.wait_zero().await;
    }

    /// Abort every background task of this service.
    ///
    /// Returns how many tasks were signalled. Tasks still queued for ordered
    /// execution are dropped along with the drain loop. A drain loop caught
    /// inside a blocking task finishes that task and then stops without
    /// taking another, so later submissions keep their order.
    pub fn cancel_tasks(&self) -> usize {
        if self.inner.enforce_submission_order {
            let mut order = self.inner.order();
            order.queue.clear();
            order.draining = false;
            order.generation = order.generation.wrapping_add(1);
        }
        let cancelled = self.inner.tasks.abort_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled background tasks");
        }
        cancelled
    }

    fn submit_ordered(&self, task: Task) -> Result<(), EventLinkError> {
        let generation = {
            let mut order = self.inner.order();
            order.queue.push_back(task);
            if std::mem::replace(&mut order.draining, true) {
                return Ok(());
            }
            order.generation
        };

        let inner = self.inner.clone();
        match Handle::try_current() {
            Ok(handle) => {
                self.inner.tasks.spawn(&handle, inner.drain(generation));
                Ok(())
            }
            Err(_) => match fresh_runtime() {
                Ok(runtime) => {
                    runtime.block_on(inner.drain(generation));
                    Ok(())
                }
                Err(e) => {
                    // Leave the queued tasks for the next submission to drain.
                    let mut order = self.inner.order();
                    if order.generation == generation {
                        order.draining = false;
                    }
                    Err(e)
                }
            },
        }
    }

    fn submit_unordered(&self, task: Task) -> Result<(), EventLinkError> {
        if let Task::Blocking(f) = task {
            if !self.inner.force_async {
                log_outcome(SERVICE, run_blocking(f));
                return Ok(());
            }
            return self.spawn_or_block(Task::Blocking(f));
        }
        self.spawn_or_block(task)
    }

    fn spawn_or_block(&self, task: Task) -> Result<(), EventLinkError> {
        let inner = self.inner.clone();
        match Handle::try_current() {
            Ok(handle) => {
                self.inner
                    .tasks
                    .spawn(&handle, async move { inner.execute(task).await });
            }
            Err(_) => {
                fresh_runtime()?.block_on(async move { inner.execute(task).await });
            }
        }
        Ok(())
    }
}

impl ProcessingService for TokioProcessingService {
    fn submit(&self, task: Task) -> Result<(), EventLinkError> {
        if self.inner.enforce_submission_order {
            self.submit_ordered(task)
        } else {
            self.submit_unordered(task)
        }
    }
}

impl fmt::Debug for TokioProcessingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioProcessingService")
            .field("force_async", &self.inner.force_async)
            .field(
                "enforce_submission_order",
                &self.inner.enforce_submission_order,
            )
            .field("tasks", &self.inner.tasks)
            .finish()
    }
}

/// Builder for [`TokioProcessingService`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioServiceBuilder {
    force_async: bool,
    enforce_submission_order: bool,
}

impl TokioServiceBuilder {
    /// Move blocking tasks onto Tokio's blocking pool instead of running them
    /// in the submitting thread.
    pub fn force_async(mut self, force_async: bool) -> Self {
        self.force_async = force_async;
        self
    }

    /// Run tasks one at a time, in submission order.
    pub fn enforce_submission_order(mut self, enforce: bool) -> Self {
        self.enforce_submission_order = enforce;
        self
    }

    /// Build the service.
    pub fn build(self) -> TokioProcessingService {
        TokioProcessingService {
            inner: Arc::new(TokioInner {
                force_async: self.force_async,
                enforce_submission_order: self.enforce_submission_order,
                tasks: Arc::new(TaskTracker::new()),
                order: Mutex::new(OrderState::default()),
            }),
        }
    }
}
