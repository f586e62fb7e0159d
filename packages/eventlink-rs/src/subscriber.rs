//! Event subscribers and their execution contract.
//!
//! An [`EventSubscriber`] owns an event callback plus optional success and
//! failure callbacks. Executing it is always a two-step affair:
//!
//! ```text
//! execute(args)
//!   └─► event_callback(args)
//!         ├─ Ok(value) ─► success_callback(value)   (if set)
//!         └─ Err(e)    ─► failure_callback(e)       (if set, else logged)
//! ```
//!
//! # Fail Loud
//!
//! Errors from the event callback are handled: they are routed to the failure
//! callback or logged. Errors from the success or failure callback are *not*:
//! they leave `execute` as [`EventLinkError::CallbackFailed`] so that bugs in
//! error-handling code surface in the processing service instead of vanishing.
//!
//! Panics are treated the same way as errors at each step.

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::error;
use uuid::Uuid;

use crate::callable::{CallableWrapper, EventCallback, FailureCallback, SuccessCallback};
use crate::core::{EventArgs, Payload};
use crate::error::{panic_message, CallbackStage, EventLinkError};
use crate::subscription::{Subscription, Unsubscribable};

/// Identity of a subscriber.
///
/// Two subscribers with identical callbacks are still distinct subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Create a new random subscriber ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Subscribe Options
// =============================================================================

/// Everything a subscriber is built from, apart from its teardown.
///
/// # Example
///
/// ```ignore
/// let options = SubscribeOptions::new(Callable::sync(|args: EventArgs| {
///         Ok(Some(payload(args.len())))
///     }))
///     .on_success(Callable::sync(|value: Option<Payload>| Ok(())))
///     .on_failure(Callable::sync(|error: anyhow::Error| Ok(())))
///     .once(true);
/// ```
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub(crate) event_callback: EventCallback,
    pub(crate) success_callback: Option<SuccessCallback>,
    pub(crate) failure_callback: Option<FailureCallback>,
    pub(crate) force_async: bool,
    pub(crate) once: bool,
}

impl SubscribeOptions {
    /// Options for a subscriber running `event_callback`.
    pub fn new(event_callback: EventCallback) -> Self {
        Self {
            event_callback,
            success_callback: None,
            failure_callback: None,
            force_async: false,
            once: false,
        }
    }

    /// Set the success callback.
    pub fn on_success(mut self, callback: SuccessCallback) -> Self {
        self.success_callback = Some(callback);
        self
    }

    /// Set the failure callback.
    pub fn on_failure(mut self, callback: FailureCallback) -> Self {
        self.failure_callback = Some(callback);
        self
    }

    /// Offload synchronous callbacks onto a blocking thread.
    pub fn force_async(mut self, force_async: bool) -> Self {
        self.force_async = force_async;
        self
    }

    /// Detach the subscriber the moment it is selected for delivery.
    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }
}

// =============================================================================
// Event Subscriber
// =============================================================================

/// A registered callback chain.
///
/// Callbacks are fixed at construction. Equality and hashing use the
/// subscriber's identity only.
pub struct EventSubscriber {
    id: SubscriberId,
    event_callback: CallableWrapper<EventArgs, Option<Payload>>,
    success_callback: Option<CallableWrapper<Option<Payload>, ()>>,
    failure_callback: Option<CallableWrapper<anyhow::Error, ()>>,
    once: bool,
    force_async: bool,
    subscription: Subscription,
}

impl EventSubscriber {
    /// Build a subscriber whose `unsubscribe` runs `teardown`.
    pub fn new<F>(options: SubscribeOptions, teardown: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let force_async = options.force_async;
        Self {
            id: SubscriberId::new(),
            event_callback: CallableWrapper::new(options.event_callback, force_async),
            success_callback: options
                .success_callback
                .map(|cb| CallableWrapper::new(cb, force_async)),
            failure_callback: options
                .failure_callback
                .map(|cb| CallableWrapper::new(cb, force_async)),
            once: options.once,
            force_async,
            subscription: Subscription::new(teardown),
        }
    }

    /// The subscriber's identity.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Returns true if the subscriber is detached on first delivery.
    pub fn is_once(&self) -> bool {
        self.once
    }

    /// Returns true if synchronous callbacks run on a blocking thread.
    pub fn force_async(&self) -> bool {
        self.force_async
    }

    /// Returns true if a success callback is set.
    pub fn has_success_callback(&self) -> bool {
        self.success_callback.is_some()
    }

    /// Returns true if a failure callback is set.
    pub fn has_failure_callback(&self) -> bool {
        self.failure_callback.is_some()
    }

    /// When the subscriber was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.subscription.timestamp()
    }

    /// Run the callback chain for one emission.
    ///
    /// Returns `Ok(())` when the event callback failed but the failure was
    /// handled (or logged). Returns [`EventLinkError::CallbackFailed`] when the
    /// success or failure callback itself failed.
    pub async fn execute(&self, args: EventArgs) -> Result<(), EventLinkError> {
        let outcome = guarded("event", self.event_callback.call(args)).await;

        match outcome {
            Ok(value) => {
                if let Some(success) = &self.success_callback {
                    guarded("success", success.call(value))
                        .await
                        .map_err(|e| EventLinkError::callback(CallbackStage::Success, e))?;
                }
            }
            Err(err) => match &self.failure_callback {
                Some(failure) => {
                    guarded("failure", failure.call(err))
                        .await
                        .map_err(|e| EventLinkError::callback(CallbackStage::Failure, e))?;
                }
                None => {
                    error!(subscriber = %self.id, error = %err, "event callback failed");
                }
            },
        }
        Ok(())
    }
}

/// Await a callback, converting a panic into an error.
async fn guarded<O, Fut>(stage: &'static str, fut: Fut) -> Result<O>
where
    Fut: Future<Output = Result<O>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic_info) => Err(anyhow!(
            "{} callback panicked: {}",
            stage,
            panic_message(panic_info.as_ref())
        )),
    }
}

impl Unsubscribable for EventSubscriber {
    fn unsubscribe(&self) -> bool {
        self.subscription.unsubscribe()
    }
}

impl PartialEq for EventSubscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventSubscriber {}

impl Hash for EventSubscriber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscriber")
            .field("id", &self.id)
            .field("event_callback", &self.event_callback)
            .field("has_success_callback", &self.has_success_callback())
            .field("has_failure_callback", &self.has_failure_callback())
            .field("once", &self.once)
            .field("force_async", &self.force_async)
            .field("timestamp", &self.timestamp())
            .finish()
    }
}
