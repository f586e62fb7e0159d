//! Testing utilities for eventlink subscribers and emitters.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! eventlink = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use eventlink::testing::{CallLog, EventLatch, ManualService};
//!
//! let log = CallLog::new();
//! let latch = EventLatch::new(2);
//! let service = ManualService::new();
//! let emitter = EventEmitter::new(linker.clone(), Arc::new(service.clone()));
//!
//! let ping = ["Ping".into()];
//! linker.subscribe(&ping, log.subscriber("first").on_success(latch.success_callback()))?;
//! linker.subscribe(&ping, log.subscriber("second").on_success(latch.success_callback()))?;
//!
//! emitter.emit("Ping", EventArgs::new())?;
//! assert!(log.is_empty());          // nothing ran yet
//!
//! service.run_all().await;
//! latch.await_zero().await;
//! assert_eq!(log.len(), 2);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::callable::{Callable, EventCallback, SuccessCallback};
use crate::core::{payload, EventArgs};
use crate::error::EventLinkError;
use crate::processing::{ProcessingService, Task};
use crate::subscriber::SubscribeOptions;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// CallLog
// =============================================================================

/// One recorded callback invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Label given when the recording callback was created.
    pub label: String,
    /// Number of positional arguments received.
    pub arity: usize,
    /// Keyword argument names received, sorted.
    pub kwargs: Vec<String>,
    /// When the callback ran.
    pub at: DateTime<Utc>,
}

/// Shared log of callback invocations.
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl CallLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// An event callback that records itself under `label` and returns the
    /// label as its value.
    pub fn recorder(&self, label: impl Into<String>) -> EventCallback {
        let calls = self.calls.clone();
        let label = label.into();
        Callable::sync(move |args: EventArgs| {
            lock(&calls).push(RecordedCall {
                label: label.clone(),
                arity: args.len(),
                kwargs: args.kwarg_names().map(str::to_string).collect(),
                at: Utc::now(),
            });
            Ok(Some(payload(label.clone())))
        })
    }

    /// Subscribe options around [`CallLog::recorder`].
    pub fn subscriber(&self, label: impl Into<String>) -> SubscribeOptions {
        SubscribeOptions::new(self.recorder(label))
    }

    /// All recorded calls in the order they happened.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Labels of all recorded calls in the order they happened.
    pub fn labels(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.label.clone()).collect()
    }

    /// How many times `label` was recorded.
    pub fn count(&self, label: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.label == label).count()
    }

    /// Total number of recorded calls.
    pub fn len(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget all recorded calls.
    pub fn clear(&self) {
        lock(&self.calls).clear();
    }
}

// =============================================================================
// EventLatch
// =============================================================================

#[derive(Debug)]
struct LatchState {
    remaining: AtomicUsize,
    notify: Notify,
}

/// Countdown latch for waiting on callbacks without sleeping.
///
/// Clones share the same count.
///
/// # Timeout Safety
///
/// For tests that might hang, use `tokio::time::timeout`:
///
/// ```ignore
/// timeout(Duration::from_secs(5), latch.await_zero())
///     .await
///     .expect("latch timed out");
/// ```
#[derive(Debug, Clone)]
pub struct EventLatch {
    state: Arc<LatchState>,
}

impl EventLatch {
    /// Create a new latch expecting `expected` calls.
    pub fn new(expected: usize) -> Self {
        Self {
            state: Arc::new(LatchState {
                remaining: AtomicUsize::new(expected),
                notify: Notify::new(),
            }),
        }
    }

    /// Decrement the remaining count.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.state.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("EventLatch decremented below zero - more calls than expected");
        }
        if prev == 1 {
            self.state.notify.notify_waiters();
        }
    }

    /// A success callback that decrements this latch.
    pub fn success_callback(&self) -> SuccessCallback {
        let latch = self.clone();
        Callable::sync(move |_| {
            latch.dec();
            Ok(())
        })
    }

    /// Wait for the count to reach zero.
    pub async fn await_zero(&self) {
        loop {
            // Register for notification BEFORE checking count
            let notified = self.state.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Current remaining count.
    pub fn remaining(&self) -> usize {
        self.state.remaining.load(Ordering::Acquire)
    }

    /// Returns true once the count has reached zero.
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

// =============================================================================
// ManualService
// =============================================================================

/// Processing service that holds tasks until the test runs them.
///
/// Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct ManualService {
    queue: Arc<Mutex<VecDeque<Task>>>,
    rejecting: Arc<std::sync::atomic::AtomicBool>,
}

impl ManualService {
    /// Create an accepting service with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `submit` fail with [`EventLinkError::ServiceShutdown`].
    pub fn reject_submissions(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Number of tasks waiting.
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Run the oldest waiting task. Returns false if none was waiting.
    pub async fn run_next(&self) -> anyhow::Result<bool> {
        let next = lock(&self.queue).pop_front();
        match next {
            Some(task) => task.run().await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Run waiting tasks in submission order until none are left.
    ///
    /// Returns every task's result.
    pub async fn run_all(&self) -> Vec<anyhow::Result<()>> {
        let mut results = Vec::new();
        loop {
            let next = lock(&self.queue).pop_front();
            let Some(task) = next else {
                return results;
            };
            results.push(task.run().await);
        }
    }
}

impl ProcessingService for ManualService {
    fn submit(&self, task: Task) -> Result<(), EventLinkError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(EventLinkError::ServiceShutdown);
        }
        lock(&self.queue).push_back(task);
        Ok(())
    }
}
