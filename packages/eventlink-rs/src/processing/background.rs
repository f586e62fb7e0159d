//! Host-owned background task processing.
//!
//! Web frameworks commonly let a request handler register work that runs
//! after the response has been sent. [`BackgroundTasks`] is that collection:
//! the host creates one per request, hands it to a
//! [`BackgroundTaskProcessingService`], and awaits [`BackgroundTasks::run`]
//! once its own response is out.
//!
//! ```ignore
//! async fn handle(request: Request) -> Response {
//!     let tasks = BackgroundTasks::new();
//!     let emitter = EventEmitter::new(
//!         linker.clone(),
//!         Arc::new(BackgroundTaskProcessingService::new(tasks.clone())),
//!     );
//!     emitter.emit("RequestHandled", EventArgs::new())?;
//!
//!     let response = render(request);
//!     tokio::spawn(async move { tasks.run().await });
//!     response
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use super::{log_outcome, ProcessingService, Task};
use crate::error::EventLinkError;

const SERVICE: &str = "background";

/// Tasks collected for execution after the host's own work is done.
///
/// Clones share the same collection.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    pending: Arc<Mutex<VecDeque<Task>>>,
}

impl BackgroundTasks {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Task>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("background task lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Queue a task.
    pub fn add(&self, task: Task) {
        self.pending().push_back(task);
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Run queued tasks in the order they were added, including tasks added
    /// while running, until none are left.
    ///
    /// Returns the number of tasks run.
    pub async fn run(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.pending().pop_front();
            let Some(task) = next else {
                return ran;
            };
            log_outcome(SERVICE, task.run().await);
            ran += 1;
        }
    }
}

impl fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("pending", &self.len())
            .finish()
    }
}

/// Processing service that only queues tasks on a [`BackgroundTasks`]
/// collection; the host decides when they run.
#[derive(Debug, Clone)]
pub struct BackgroundTaskProcessingService {
    tasks: BackgroundTasks,
}

impl BackgroundTaskProcessingService {
    /// Queue submissions on `tasks`.
    pub fn new(tasks: BackgroundTasks) -> Self {
        Self { tasks }
    }

    /// The collection submissions are queued on.
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }
}

impl ProcessingService for BackgroundTaskProcessingService {
    fn submit(&self, task: Task) -> Result<(), EventLinkError> {
        self.tasks.add(task);
        Ok(())
    }
}
