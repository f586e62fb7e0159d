//! Event emission.
//!
//! # Emission Protocol
//!
//! ```text
//! emit*(event, args)
//!   1. resolve the event name                  (fails on "")
//!   2. select subscribers of name + ANY_EVENT  (one-shot subscribers popped
//!                                               in the same critical section)
//!   3. nobody selected? ─► debug trace, return Ok
//!   4. record/error events: prepend the value to the positional args
//!   5. EventEmission ─► Task ─► ProcessingService::submit
//! ```
//!
//! Step 2 happens synchronously inside `emit*`, before any callback runs, so a
//! one-shot subscriber is detached even if its callback has not executed yet.
//! If `submit` then fails, popped one-shot subscribers are not restored.
//!
//! # Fan-out
//!
//! An [`EventEmission`] drives all of its subscribers concurrently. One
//! subscriber's failure never cancels or delays its siblings; the first fatal
//! error is reported only after every subscriber has finished.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, trace};

use crate::core::{payload, short_type_name, Event, EventArgs, EventKey, Payload, ANY_EVENT};
use crate::error::EventLinkError;
use crate::linker::EventLinker;
use crate::processing::{ProcessingService, Task};
use crate::subscriber::EventSubscriber;

/// Emits events from one namespace into one processing service.
///
/// # Example
///
/// ```ignore
/// let linker = EventLinker::new();
/// let emitter = EventEmitter::new(linker.clone(), Arc::new(TokioProcessingService::new()));
///
/// linker.subscribe(&["Ping".into()], SubscribeOptions::new(Callable::sync(|_| Ok(None))))?;
/// emitter.emit("Ping", EventArgs::new().arg(1_u32))?;
/// ```
#[derive(Clone)]
pub struct EventEmitter {
    linker: EventLinker,
    service: Arc<dyn ProcessingService>,
    debug: bool,
}

impl EventEmitter {
    /// Emit into `linker`'s namespace through `service`.
    pub fn new(linker: EventLinker, service: Arc<dyn ProcessingService>) -> Self {
        let debug = linker.config().debug();
        Self {
            linker,
            service,
            debug,
        }
    }

    /// Trace every emission at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// The namespace this emitter reads.
    pub fn linker(&self) -> &EventLinker {
        &self.linker
    }

    /// Emit a string event.
    ///
    /// The name `"..."` is the any-event sentinel itself; emitting it reaches
    /// only subscribers of the sentinel.
    pub fn emit(&self, event: &str, args: EventArgs) -> Result<(), EventLinkError> {
        let name = EventKey::name(event).resolve()?;
        self.dispatch(name, args)
    }

    /// Emit the any-event sentinel directly.
    pub fn emit_any(&self, args: EventArgs) -> Result<(), EventLinkError> {
        self.dispatch(ANY_EVENT.to_string(), args)
    }

    /// Emit a structured record. Subscribers receive it as argument 0.
    pub fn emit_event<E: Event>(&self, event: E, args: EventArgs) -> Result<(), EventLinkError> {
        let name = E::event_name().into_owned();
        self.dispatch_with(name, args, || payload(event))
    }

    /// Emit an error value. Subscribers receive it as argument 0.
    pub fn emit_error<E>(&self, error: E, args: EventArgs) -> Result<(), EventLinkError>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let name = short_type_name::<E>().to_string();
        self.dispatch_with(name, args, || payload(error))
    }

    fn dispatch(&self, name: String, args: EventArgs) -> Result<(), EventLinkError> {
        match self.prepare(&name) {
            Some(subscribers) => self.hand_off(name, subscribers, args),
            None => Ok(()),
        }
    }

    fn dispatch_with<F>(
        &self,
        name: String,
        args: EventArgs,
        value: F,
    ) -> Result<(), EventLinkError>
    where
        F: FnOnce() -> Payload,
    {
        match self.prepare(&name) {
            Some(subscribers) => self.hand_off(name, subscribers, args.prepend(value())),
            None => Ok(()),
        }
    }

    /// Select the subscribers for `name`, popping one-shot ones.
    fn prepare(&self, name: &str) -> Option<Vec<Arc<EventSubscriber>>> {
        let names = [name.to_string(), ANY_EVENT.to_string()];
        let subscribers: Vec<_> = self.linker.select(&names, true).into_iter().collect();
        if subscribers.is_empty() {
            debug!(
                namespace = %self.linker.config().namespace(),
                event = %name,
                "no subscribers for event"
            );
            return None;
        }
        Some(subscribers)
    }

    fn hand_off(
        &self,
        name: String,
        subscribers: Vec<Arc<EventSubscriber>>,
        args: EventArgs,
    ) -> Result<(), EventLinkError> {
        if self.debug {
            debug!(
                namespace = %self.linker.config().namespace(),
                event = %name,
                subscribers = subscribers.len(),
                args = ?args,
                "emitting event"
            );
        }
        let emission = EventEmission::new(name, subscribers, args, self.debug);
        self.service.submit(emission.into_task())
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("linker", &self.linker)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Event Emission
// =============================================================================

/// One occurrence of an event with its frozen subscriber snapshot.
///
/// Single use: running it consumes it. Holds no reference to the namespace,
/// so subscribing or unsubscribing after emission does not change who runs.
pub struct EventEmission {
    event: String,
    subscribers: Vec<Arc<EventSubscriber>>,
    args: EventArgs,
    debug: bool,
}

impl EventEmission {
    fn new(
        event: String,
        subscribers: Vec<Arc<EventSubscriber>>,
        args: EventArgs,
        debug: bool,
    ) -> Self {
        debug_assert!(!subscribers.is_empty(), "emission without subscribers");
        Self {
            event,
            subscribers,
            args,
            debug,
        }
    }

    /// The resolved event name.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// The subscribers this emission will run.
    pub fn subscribers(&self) -> &[Arc<EventSubscriber>] {
        &self.subscribers
    }

    /// The arguments every subscriber receives.
    pub fn args(&self) -> &EventArgs {
        &self.args
    }

    /// Run every subscriber concurrently and wait for all of them.
    ///
    /// Returns the first [`EventLinkError::CallbackFailed`] in subscriber
    /// order, after all subscribers have finished.
    pub async fn run(self) -> Result<(), EventLinkError> {
        let Self {
            event,
            subscribers,
            args,
            debug,
        } = self;

        let results = join_all(
            subscribers
                .iter()
                .map(|subscriber| subscriber.execute(args.clone())),
        )
        .await;

        let mut first = None;
        for (subscriber, result) in subscribers.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(
                    event = %event,
                    subscriber = %subscriber.id(),
                    error = %e,
                    "subscriber callback chain failed"
                );
                first.get_or_insert(e);
            }
        }
        if debug {
            trace!(event = %event, subscribers = subscribers.len(), "emission finished");
        }
        first.map_or(Ok(()), Err)
    }

    /// Package the emission as an asynchronous [`Task`].
    pub fn into_task(self) -> Task {
        Task::future(async move { self.run().await.map_err(anyhow::Error::from) })
    }
}

impl fmt::Debug for EventEmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmission")
            .field("event", &self.event)
            .field("subscribers", &self.subscribers.len())
            .field("args", &self.args)
            .field("debug", &self.debug)
            .finish()
    }
}
