//! Structured error types for eventlink.
//!
//! `EventLinkError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Every variant belongs to exactly one [`ErrorCategory`],
//! which tells the caller how the failure surfaces:
//!
//! | Category     | Raised by                         | When                              |
//! |--------------|-----------------------------------|-----------------------------------|
//! | `Validation` | `subscribe`, `emit`, config build | Synchronously, before any effect  |
//! | `Capacity`   | `subscribe`                       | Before any mutation of a registry |
//! | `Callback`   | `EventSubscriber::execute`        | Inside a submitted unit of work   |
//! | `Backend`    | `ProcessingService::submit`       | When the backend cannot accept    |
//!
//! # The Callback Boundary Rule
//!
//! > **User callbacks speak `anyhow`; the bus speaks `EventLinkError`.**
//!
//! - Event callbacks return `anyhow::Result<_>`, and their errors are handed
//!   to the subscriber's failure callback as-is.
//! - Only when a success or failure callback itself fails does the error leave
//!   the subscriber, wrapped in [`EventLinkError::CallbackFailed`].
//!
//! # Example
//!
//! ```ignore
//! use eventlink::{EventLinkError, ErrorCategory};
//!
//! match linker.subscribe(&["Ping".into()], options) {
//!     Ok(subscriber) => println!("subscribed {}", subscriber.id()),
//!     Err(EventLinkError::CapacityExceeded { event, limit }) => {
//!         eprintln!("{event} already has {limit} subscribers");
//!     }
//!     Err(e) if e.category() == ErrorCategory::Validation => eprintln!("bad input: {e}"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::fmt;

use thiserror::Error;

// =============================================================================
// Error Category
// =============================================================================

/// Coarse classification of an [`EventLinkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Null, empty or ill-typed arguments. Never swallowed.
    Validation,
    /// A namespace's per-event subscriber limit would be exceeded.
    Capacity,
    /// A success or failure callback failed while handling an emission.
    Callback,
    /// The processing backend refused or could not accept work.
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation_error"),
            ErrorCategory::Capacity => write!(f, "capacity_error"),
            ErrorCategory::Callback => write!(f, "callback_error"),
            ErrorCategory::Backend => write!(f, "backend_error"),
        }
    }
}

/// The subscriber callback that produced a [`EventLinkError::CallbackFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackStage {
    /// The success callback, invoked with the event callback's return value.
    Success,
    /// The failure callback, invoked with the event callback's error.
    Failure,
}

impl fmt::Display for CallbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackStage::Success => write!(f, "success"),
            CallbackStage::Failure => write!(f, "failure"),
        }
    }
}

// =============================================================================
// EventLink Error
// =============================================================================

/// Structured error type for eventlink operations.
///
/// Each variant includes enough context to explain what went wrong without
/// downcasting.
#[derive(Debug, Error)]
pub enum EventLinkError {
    /// `subscribe`/`unsubscribe` was called without any event.
    #[error("at least one event must be provided")]
    NoEvents,

    /// A string event resolved to the empty string.
    #[error("event name cannot be empty")]
    EmptyEventName,

    /// A namespace was configured with `max_subscribers = 0`.
    #[error("max_subscribers must be at least 1 when set, got {value}")]
    InvalidMaxSubscribers {
        /// The rejected limit.
        value: usize,
    },

    /// A subscription context was finished without an event callback.
    #[error("subscription context finished without an event callback")]
    MissingEventCallback,

    /// Subscribing would push an event past the namespace limit.
    #[error("event {event} already has the maximum of {limit} subscribers")]
    CapacityExceeded {
        /// The event that is full.
        event: String,
        /// The namespace's per-event limit.
        limit: usize,
    },

    /// A success or failure callback returned an error or panicked.
    ///
    /// These are deliberately not isolated: they escape `execute` so bugs in
    /// error-handling code are never hidden.
    #[error("{stage} callback failed: {source}")]
    CallbackFailed {
        /// Which callback failed.
        stage: CallbackStage,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Work was submitted to a processing service that has been shut down.
    #[error("processing service has been shut down")]
    ServiceShutdown,

    /// An external queue refused a job.
    #[error("queue {queue} is unavailable: {message}")]
    QueueUnavailable {
        /// The queue name.
        queue: String,
        /// The transport's description of the problem.
        message: String,
    },

    /// A runtime could not be created to drive submitted work.
    #[error("failed to start a runtime for submitted work: {0}")]
    RuntimeUnavailable(#[from] std::io::Error),
}

impl EventLinkError {
    /// Return the category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EventLinkError::NoEvents
            | EventLinkError::EmptyEventName
            | EventLinkError::InvalidMaxSubscribers { .. }
            | EventLinkError::MissingEventCallback => ErrorCategory::Validation,
            EventLinkError::CapacityExceeded { .. } => ErrorCategory::Capacity,
            EventLinkError::CallbackFailed { .. } => ErrorCategory::Callback,
            EventLinkError::ServiceShutdown
            | EventLinkError::QueueUnavailable { .. }
            | EventLinkError::RuntimeUnavailable(_) => ErrorCategory::Backend,
        }
    }

    /// Returns true for usage errors raised synchronously by the caller's call.
    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    pub(crate) fn callback(stage: CallbackStage, source: anyhow::Error) -> Self {
        EventLinkError::CallbackFailed { stage, source }
    }
}

/// Convert a caught panic payload into a readable message.
pub(crate) fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_display() {
        let err = EventLinkError::CapacityExceeded {
            event: "Ping".into(),
            limit: 2,
        };
        assert!(err.to_string().contains("Ping"));
        assert!(err.to_string().contains("maximum of 2"));
    }

    #[test]
    fn test_callback_failed_display_names_stage() {
        let err = EventLinkError::callback(CallbackStage::Failure, anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "failure callback failed: boom");
    }

    #[test]
    fn test_categories() {
        assert_eq!(EventLinkError::NoEvents.category(), ErrorCategory::Validation);
        assert_eq!(
            EventLinkError::EmptyEventName.category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            EventLinkError::CapacityExceeded {
                event: "e".into(),
                limit: 1
            }
            .category(),
            ErrorCategory::Capacity
        );
        assert_eq!(
            EventLinkError::callback(CallbackStage::Success, anyhow::anyhow!("x")).category(),
            ErrorCategory::Callback
        );
        assert_eq!(
            EventLinkError::ServiceShutdown.category(),
            ErrorCategory::Backend
        );
        assert!(EventLinkError::MissingEventCallback.is_validation());
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = EventLinkError::InvalidMaxSubscribers { value: 0 }.into();

        match err.downcast_ref::<EventLinkError>() {
            Some(EventLinkError::InvalidMaxSubscribers { value }) => assert_eq!(*value, 0),
            other => panic!("expected InvalidMaxSubscribers, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
