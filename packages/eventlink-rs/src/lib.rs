//! # Eventlink
//!
//! An in-process event bus where linkers register, emitters resolve, and
//! processing services execute.
//!
//! ## Core Concepts
//!
//! Eventlink separates **who listens** from **how work runs**:
//! - [`EventLinker`] = the registry of one namespace (events ↔ subscribers)
//! - [`EventEmitter`] = resolves an emission to its subscribers
//! - [`ProcessingService`](processing::ProcessingService) = runs the resulting task
//!
//! The key principle: **emit never executes callbacks**. It selects the
//! subscribers, freezes them together with the arguments, and submits one
//! task. What happens next belongs to the processing service.
//!
//! ## Architecture
//!
//! ```text
//! Producer
//!     │
//!     ▼ emit("Ping", args)
//! EventEmitter
//!     │
//!     ▼ select(["Ping", "..."], pop_once)
//! EventLinker ── MultiBidict<event, subscriber>
//!     │
//!     ▼ EventEmission { subscribers, args }
//! ProcessingService.submit(task)
//!     │
//!     ├─► Tokio        (current runtime or a temporary one)
//!     ├─► WorkerPool   (named OS threads)
//!     ├─► Queue        (external queue + QueueWorker)
//!     └─► Background   (host runs BackgroundTasks)
//!             │
//!             ▼
//!     EventSubscriber.execute()
//!         event callback ─► success(value) | failure(error)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Namespaces are isolated** - Each linker has its own registry and config
//! 2. **Registry is consistent** - Every forward link has its inverse
//! 3. **One-shot is at-most-once** - Once-subscribers are unlinked before submission
//! 4. **Snapshots are frozen** - Changes after emit do not affect that emission
//! 5. **Event callback failures are isolated** - One subscriber never stops its siblings
//!
//! ## Example
//!
//! ```ignore
//! use eventlink::processing::TokioProcessingService;
//! use eventlink::{Callable, Event, EventArgs, EventEmitter, EventKey, EventLinker};
//! use std::sync::Arc;
//!
//! // 1. Define a record event
//! #[derive(Debug, Clone)]
//! struct UserCreated {
//!     name: String,
//! }
//! impl Event for UserCreated {}
//!
//! // 2. Subscribe in a namespace
//! let linker = EventLinker::builder().namespace("users").build()?;
//! linker
//!     .on(&[EventKey::of::<UserCreated>()])
//!     .event(Callable::sync(|args: EventArgs| {
//!         let user = args.get::<UserCreated>(0).map(|u| u.name.clone());
//!         tracing::info!(?user, "welcome");
//!         Ok(None)
//!     }))
//!     .subscribe()?;
//!
//! // 3. Emit through a processing service
//! let service = TokioProcessingService::new();
//! let emitter = EventEmitter::new(linker, Arc::new(service.clone()));
//! emitter.emit_event(UserCreated { name: "ada".into() }, EventArgs::new())?;
//!
//! service.wait_for_tasks().await;
//! ```
//!
//! ## What This Is Not
//!
//! Eventlink is **not**:
//! - A message broker or cross-process bus
//! - An event store (nothing is persisted or replayed)
//! - A scheduler with priorities or retries

// Core modules
mod callable;
mod core;
mod emitter;
mod error;
mod linker;
mod registry;
mod settings;
mod subscriber;
mod subscription;

// Processing services (where tasks run)
pub mod processing;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core types
pub use crate::core::{payload, short_type_name, Event, EventArgs, EventKey, Payload, ANY_EVENT};

// Re-export callable types
pub use callable::{
    Callable, CallableWrapper, EventCallback, FailureCallback, Handler, SuccessCallback,
};

// Re-export error types
pub use crate::error::{CallbackStage, ErrorCategory, EventLinkError};

// Re-export registry types
pub use registry::{MultiBidict, Unlinked};

// Re-export subscription types
pub use subscription::{Subscription, Unsubscribable};

// Re-export subscriber types
pub use subscriber::{EventSubscriber, SubscribeOptions, SubscriberId};

// Re-export linker types (primary entry point)
pub use linker::{
    EventLinker, EventLinkerBuilder, LinkerConfig, SubscriptionContext, DEFAULT_NAMESPACE,
};

// Re-export emitter types
pub use emitter::{EventEmission, EventEmitter};

// Re-export processing types
pub use processing::{ProcessingService, Task};

// Re-export configuration
pub use settings::{Settings, DEFAULT_QUEUE_NAME};

// Re-export commonly used external types
pub use async_trait::async_trait;
