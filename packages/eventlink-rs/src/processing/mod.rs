//! Processing services: where submitted work actually runs.
//!
//! The emitter never executes subscribers itself. It packages an emission as
//! a [`Task`] and hands it to a [`ProcessingService`], which decides how and
//! where the task runs:
//!
//! | Service                            | Runs tasks on                                  |
//! |------------------------------------|------------------------------------------------|
//! | [`TokioProcessingService`]         | the current Tokio runtime, or a temporary one  |
//! | [`WorkerPoolProcessingService`]    | a fixed set of named OS threads                |
//! | [`QueueProcessingService`]         | whatever worker drains the external queue      |
//! | [`BackgroundTaskProcessingService`]| a host-owned [`BackgroundTasks`] collection    |
//!
//! # Contract
//!
//! `submit` is fire-and-forget. It returns an error only when the backend
//! cannot accept the task at all; the task's own failure is the backend's to
//! log. Each accepted task runs at most once.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{panic_message, EventLinkError};

mod background;
mod cooperative;
mod pool;
mod queue;
mod tasks;

pub use background::{BackgroundTaskProcessingService, BackgroundTasks};
pub use cooperative::{TokioProcessingService, TokioServiceBuilder};
pub use pool::WorkerPoolProcessingService;
pub use queue::{ChannelQueue, JobEnvelope, QueueProcessingService, QueueWorker, TaskQueue};
pub use tasks::global_task_count;

type BlockingFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A unit of submitted work. Arguments are captured by the task itself.
pub enum Task {
    /// Synchronous work; may block the thread it runs on.
    Blocking(BlockingFn),
    /// Asynchronous work.
    Async(BoxFuture<'static, anyhow::Result<()>>),
}

impl Task {
    /// Wrap a synchronous closure.
    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Task::Blocking(Box::new(f))
    }

    /// Wrap a future.
    pub fn future<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Task::Async(fut.boxed())
    }

    /// Returns true for [`Task::Async`].
    pub fn is_async(&self) -> bool {
        matches!(self, Task::Async(_))
    }

    /// Run the task to completion in the current context.
    ///
    /// A panic inside the task is returned as an error.
    pub async fn run(self) -> anyhow::Result<()> {
        match self {
            Task::Blocking(f) => run_blocking(f),
            Task::Async(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic_info) => Err(anyhow::anyhow!(
                    "task panicked: {}",
                    panic_message(panic_info.as_ref())
                )),
            },
        }
    }
}

/// Call a blocking task, converting a panic into an error.
pub(crate) fn run_blocking(f: BlockingFn) -> anyhow::Result<()> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic_info) => Err(anyhow::anyhow!(
            "task panicked: {}",
            panic_message(panic_info.as_ref())
        )),
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Blocking(_) => f.write_str("Task::Blocking"),
            Task::Async(_) => f.write_str("Task::Async"),
        }
    }
}

/// Strategy that executes submitted tasks.
pub trait ProcessingService: Send + Sync {
    /// Accept a task for execution.
    ///
    /// Errors only when the backend cannot take the task.
    fn submit(&self, task: Task) -> Result<(), EventLinkError>;
}

/// Log the outcome of a finished task.
pub(crate) fn log_outcome(service: &'static str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        tracing::error!(service, error = %e, "submitted task failed");
    }
}

/// Build a single-threaded runtime for driving one piece of work.
pub(crate) fn fresh_runtime() -> Result<tokio::runtime::Runtime, EventLinkError> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
