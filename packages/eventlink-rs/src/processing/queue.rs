//! External-queue processing.
//!
//! Closures cannot travel through a queue, so the service splits a task in
//! two:
//!
//! ```text
//! submit(task)
//!   ├─► job table keyed by Uuid           (the body stays in this process)
//!   └─► TaskQueue::enqueue(JSON envelope) (only the job id travels)
//!
//! worker receives envelope ─► claim(envelope) ─► Some(task) ─► run
//!                                             └► None (already claimed)
//! ```
//!
//! Claiming removes the job from the table, so a job delivered twice by the
//! transport still runs at most once. Jobs are not persisted: a job whose
//! envelope outlives the process is simply unknown to the next one.
//!
//! # Example
//!
//! ```ignore
//! let (queue, receiver) = ChannelQueue::channel();
//! let service = QueueProcessingService::new(queue, "emails");
//! tokio::spawn(QueueWorker::new(service.clone(), receiver).run());
//!
//! let emitter = EventEmitter::new(linker, Arc::new(service));
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{log_outcome, ProcessingService, Task};
use crate::error::EventLinkError;

const SERVICE: &str = "queue";

/// Transport for serialized job envelopes.
///
/// `enqueue` must not block for long: it is called from `submit`, which
/// returns as soon as the transport has accepted the job.
pub trait TaskQueue: Send + Sync + 'static {
    /// Hand a serialized [`JobEnvelope`] to the transport.
    fn enqueue(&self, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// What travels through the queue for one submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Key of the task body in the submitting service's job table.
    pub id: Uuid,
    /// Name of the queue the job was submitted to.
    pub queue: String,
    /// When `submit` accepted the job.
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    fn new(queue: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            enqueued_at: Utc::now(),
        }
    }
}

// =============================================================================
// Queue Processing Service
// =============================================================================

struct QueueInner<Q> {
    queue: Q,
    name: String,
    // Task is Send but not Sync; the mutex makes the table shareable.
    jobs: DashMap<Uuid, Mutex<Task>>,
}

/// Processing service that hands tasks to an external queue.
pub struct QueueProcessingService<Q: TaskQueue> {
    inner: Arc<QueueInner<Q>>,
}

impl<Q: TaskQueue> Clone for QueueProcessingService<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Q: TaskQueue> QueueProcessingService<Q> {
    /// Submit to `queue` under the queue name `name`.
    pub fn new(queue: Q, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue,
                name: name.into(),
                jobs: DashMap::new(),
            }),
        }
    }

    /// The queue name stamped on every envelope.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of submitted jobs not yet claimed.
    pub fn pending_jobs(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Take the task for a received envelope.
    ///
    /// Returns `Ok(None)` if the job was already claimed or was submitted by a
    /// different process. Fails if `payload` is not an envelope.
    pub fn claim(&self, payload: &serde_json::Value) -> Result<Option<Task>, EventLinkError> {
        let envelope: JobEnvelope = serde_json::from_value(payload.clone()).map_err(|e| {
            EventLinkError::QueueUnavailable {
                queue: self.inner.name.clone(),
                message: format!("malformed job envelope: {e}"),
            }
        })?;

        if envelope.queue != self.inner.name {
            warn!(
                queue = %self.inner.name,
                envelope_queue = %envelope.queue,
                job_id = %envelope.id,
                "envelope belongs to another queue"
            );
            return Ok(None);
        }
        Ok(self
            .inner
            .jobs
            .remove(&envelope.id)
            .map(|(_, slot)| slot.into_inner().unwrap_or_else(PoisonError::into_inner)))
    }
}

impl<Q: TaskQueue> ProcessingService for QueueProcessingService<Q> {
    fn submit(&self, task: Task) -> Result<(), EventLinkError> {
        let envelope = JobEnvelope::new(&self.inner.name);
        let unavailable = |message: String| EventLinkError::QueueUnavailable {
            queue: self.inner.name.clone(),
            message,
        };

        let payload = serde_json::to_value(&envelope).map_err(|e| unavailable(e.to_string()))?;

        // Park the body before the transport can deliver the envelope.
        self.inner.jobs.insert(envelope.id, Mutex::new(task));
        if let Err(e) = self.inner.queue.enqueue(payload) {
            self.inner.jobs.remove(&envelope.id);
            return Err(unavailable(e.to_string()));
        }

        debug!(queue = %self.inner.name, job_id = %envelope.id, "job enqueued");
        Ok(())
    }
}

impl<Q: TaskQueue> fmt::Debug for QueueProcessingService<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProcessingService")
            .field("name", &self.inner.name)
            .field("pending_jobs", &self.inner.jobs.len())
            .finish()
    }
}

// =============================================================================
// In-process channel backend
// =============================================================================

/// A [`TaskQueue`] over an unbounded Tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<serde_json::Value>,
}

impl ChannelQueue {
    /// Create the queue and the receiving end for a [`QueueWorker`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TaskQueue for ChannelQueue {
    fn enqueue(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        self.sender
            .send(payload)
            .map_err(|_| anyhow::anyhow!("queue worker has stopped"))
    }
}

/// Drains a [`ChannelQueue`] and runs the claimed tasks.
pub struct QueueWorker<Q: TaskQueue> {
    service: QueueProcessingService<Q>,
    receiver: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl<Q: TaskQueue> QueueWorker<Q> {
    /// Create a worker for `service`'s jobs.
    pub fn new(
        service: QueueProcessingService<Q>,
        receiver: mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> Self {
        Self { service, receiver }
    }

    /// Run jobs until the channel closes or the task running this is aborted.
    pub async fn run(mut self) {
        while let Some(payload) = self.receiver.recv().await {
            process(&self.service, &payload).await;
        }
    }

    /// Run jobs until the channel is momentarily empty.
    ///
    /// Returns the number of envelopes handled.
    pub async fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(payload) = self.receiver.try_recv() {
            process(&self.service, &payload).await;
            handled += 1;
        }
        handled
    }
}

async fn process<Q: TaskQueue>(service: &QueueProcessingService<Q>, payload: &serde_json::Value) {
    match service.claim(payload) {
        Ok(Some(task)) => log_outcome(SERVICE, task.run().await),
        Ok(None) => debug!(queue = %service.name(), "job already claimed"),
        Err(e) => warn!(error = %e, "skipping undecodable job"),
    }
}

impl<Q: TaskQueue> fmt::Debug for QueueWorker<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueWorker")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records envelopes instead of delivering them.
    #[derive(Default)]
    struct RecordingQueue {
        sent: Mutex<Vec<serde_json::Value>>,
        offline: bool,
    }

    impl TaskQueue for Arc<RecordingQueue> {
        fn enqueue(&self, payload: serde_json::Value) -> anyhow::Result<()> {
            if self.offline {
                anyhow::bail!("connection refused");
            }
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Task::blocking(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_submit_sends_envelope_and_parks_task() {
        let queue = Arc::new(RecordingQueue::default());
        let service = QueueProcessingService::new(queue.clone(), "mail");

        service.submit(Task::blocking(|| Ok(()))).unwrap();

        let sent = queue.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let envelope: JobEnvelope = serde_json::from_value(sent[0].clone()).unwrap();
        assert_eq!(envelope.queue, "mail");
        assert_eq!(service.pending_jobs(), 1);
    }

    #[test]
    fn test_unavailable_queue_fails_submit_and_forgets_task() {
        let queue = Arc::new(RecordingQueue {
            offline: true,
            ..Default::default()
        });
        let service = QueueProcessingService::new(queue, "mail");

        let err = service.submit(Task::blocking(|| Ok(()))).unwrap_err();
        assert!(matches!(
            err,
            EventLinkError::QueueUnavailable { ref queue, .. } if queue == "mail"
        ));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(service.pending_jobs(), 0);
    }

    #[test]
    fn test_claim_is_at_most_once() {
        let queue = Arc::new(RecordingQueue::default());
        let service = QueueProcessingService::new(queue.clone(), "mail");
        service.submit(Task::blocking(|| Ok(()))).unwrap();

        let payload = queue.sent.lock().unwrap()[0].clone();
        assert!(service.claim(&payload).unwrap().is_some());
        assert!(service.claim(&payload).unwrap().is_none());
    }

    #[test]
    fn test_claim_rejects_garbage_and_foreign_envelopes() {
        let service = QueueProcessingService::new(Arc::new(RecordingQueue::default()), "mail");

        assert!(service.claim(&serde_json::json!({"nope": 1})).is_err());

        let foreign = serde_json::to_value(JobEnvelope::new("other")).unwrap();
        assert!(service.claim(&foreign).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_worker_runs_jobs() {
        let (queue, receiver) = ChannelQueue::channel();
        let service = QueueProcessingService::new(queue, "local");
        let mut worker = QueueWorker::new(service.clone(), receiver);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            service.submit(counting(&counter)).unwrap();
        }
        assert_eq!(worker.run_pending().await, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(service.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_stopped_worker_makes_queue_unavailable() {
        let (queue, receiver) = ChannelQueue::channel();
        drop(receiver);
        let service = QueueProcessingService::new(queue, "local");

        assert!(matches!(
            service.submit(Task::blocking(|| Ok(()))),
            Err(EventLinkError::QueueUnavailable { .. })
        ));
    }
}
