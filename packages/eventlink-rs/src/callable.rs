//! Uniform async invocation over sync and async callables.
//!
//! Subscribers never care whether a callback blocks or awaits. A callback is
//! one of a closed set of [`Callable`] variants, resolved once when it is
//! wrapped, and [`CallableWrapper::call`] runs any of them through a single
//! `async` contract:
//!
//! | Variant   | `force_async = false`      | `force_async = true`               |
//! |-----------|----------------------------|------------------------------------|
//! | `Sync`    | runs in the calling task   | runs on `tokio::task::spawn_blocking` |
//! | `Async`   | awaited directly           | awaited directly                   |
//! | `Handler` | awaited directly           | awaited directly                   |
//!
//! Generator-shaped callables (streams) have no variant, so they cannot be
//! wrapped at all; streaming belongs to a separate contract.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::core::{EventArgs, Payload};

/// A trait-object callable, for callbacks that carry their own state.
///
/// # Example
///
/// ```ignore
/// struct AuditTrail {
///     sink: Arc<Mutex<Vec<String>>>,
/// }
///
/// #[async_trait]
/// impl Handler<EventArgs, Option<Payload>> for AuditTrail {
///     async fn call(&self, args: EventArgs) -> Result<Option<Payload>> {
///         self.sink.lock().unwrap().push(format!("{} args", args.len()));
///         Ok(None)
///     }
/// }
///
/// let callback = Callable::handler(AuditTrail { sink });
/// ```
#[async_trait]
pub trait Handler<I, O>: Send + Sync + 'static {
    /// Invoke the handler.
    async fn call(&self, input: I) -> Result<O>;
}

type SyncFn<I, O> = Arc<dyn Fn(I) -> Result<O> + Send + Sync>;
type AsyncFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;

/// The closed set of callable shapes.
pub enum Callable<I, O> {
    /// A plain function or closure that runs to completion when called.
    Sync(SyncFn<I, O>),
    /// A closure returning a future.
    Async(AsyncFn<I, O>),
    /// A stateful trait object.
    Handler(Arc<dyn Handler<I, O>>),
}

impl<I, O> Callable<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Wrap a synchronous function or closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(I) -> Result<O> + Send + Sync + 'static,
    {
        Callable::Sync(Arc::new(f))
    }

    /// Wrap a closure returning a future.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Callable::Async(Arc::new(move |input| f(input).boxed()))
    }

    /// Wrap a [`Handler`] implementation.
    pub fn handler<H: Handler<I, O>>(handler: H) -> Self {
        Callable::Handler(Arc::new(handler))
    }

    /// Returns true if calling this never blocks the caller.
    pub fn is_async(&self) -> bool {
        !matches!(self, Callable::Sync(_))
    }
}

impl<I, O> Clone for Callable<I, O> {
    fn clone(&self) -> Self {
        match self {
            Callable::Sync(f) => Callable::Sync(f.clone()),
            Callable::Async(f) => Callable::Async(f.clone()),
            Callable::Handler(h) => Callable::Handler(h.clone()),
        }
    }
}

impl<I, O> fmt::Debug for Callable<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Callable::Sync(_) => "Sync",
            Callable::Async(_) => "Async",
            Callable::Handler(_) => "Handler",
        };
        f.debug_tuple("Callable").field(&kind).finish()
    }
}

/// Event callback: receives the emission's arguments, may return a value.
pub type EventCallback = Callable<EventArgs, Option<Payload>>;

/// Success callback: receives the event callback's return value, if any.
pub type SuccessCallback = Callable<Option<Payload>, ()>;

/// Failure callback: receives the event callback's error.
pub type FailureCallback = Callable<anyhow::Error, ()>;

// =============================================================================
// Callable Wrapper
// =============================================================================

/// A [`Callable`] bound to its execution policy.
///
/// Immutable once built; cheap to clone.
pub struct CallableWrapper<I, O> {
    callable: Callable<I, O>,
    force_async: bool,
}

impl<I, O> CallableWrapper<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Bind a callable to an execution policy.
    ///
    /// `force_async` only changes how `Sync` callables run.
    pub fn new(callable: Callable<I, O>, force_async: bool) -> Self {
        Self {
            callable,
            force_async,
        }
    }

    /// Returns true if synchronous work is offloaded to a blocking thread.
    pub fn force_async(&self) -> bool {
        self.force_async
    }

    /// Returns true if the wrapped callable is natively asynchronous.
    pub fn is_async(&self) -> bool {
        self.callable.is_async()
    }

    /// Invoke the callable.
    ///
    /// Offloading requires a Tokio runtime; every processing service provides
    /// one before it drives a subscriber.
    pub async fn call(&self, input: I) -> Result<O> {
        match &self.callable {
            Callable::Sync(f) if self.force_async => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(input))
                    .await
                    .map_err(|e| anyhow!("offloaded callable did not complete: {e}"))?
            }
            Callable::Sync(f) => f(input),
            Callable::Async(f) => f(input).await,
            Callable::Handler(h) => h.call(input).await,
        }
    }
}

impl<I, O> Clone for CallableWrapper<I, O> {
    fn clone(&self) -> Self {
        Self {
            callable: self.callable.clone(),
            force_async: self.force_async,
        }
    }
}

impl<I, O> fmt::Debug for CallableWrapper<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableWrapper")
            .field("callable", &self.callable)
            .field("force_async", &self.force_async)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Doubler;

    #[async_trait]
    impl Handler<u32, u32> for Doubler {
        async fn call(&self, input: u32) -> Result<u32> {
            Ok(input * 2)
        }
    }

    #[tokio::test]
    async fn test_sync_runs_in_calling_thread() {
        let caller = thread::current().id();
        let wrapper = CallableWrapper::new(
            Callable::sync(move |_: ()| Ok(thread::current().id() == caller)),
            false,
        );

        assert!(wrapper.call(()).await.unwrap());
        assert!(!wrapper.is_async());
    }

    #[tokio::test]
    async fn test_force_async_offloads_sync_work() {
        let caller = thread::current().id();
        let wrapper = CallableWrapper::new(
            Callable::sync(move |_: ()| Ok(thread::current().id() != caller)),
            true,
        );

        assert!(wrapper.call(()).await.unwrap());
        assert!(wrapper.force_async());
    }

    #[tokio::test]
    async fn test_async_closure_is_awaited() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let wrapper = CallableWrapper::new(
            Callable::future(move |n: usize| {
                let counter = counter.clone();
                async move {
                    tokio::task::yield_now().await;
                    counter.fetch_add(n, Ordering::SeqCst);
                    Ok(())
                }
            }),
            true,
        );

        wrapper.call(3).await.unwrap();
        wrapper.call(4).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert!(wrapper.is_async());
    }

    #[tokio::test]
    async fn test_handler_variant() {
        let wrapper = CallableWrapper::new(Callable::handler(Doubler), false);
        assert_eq!(wrapper.call(21).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let wrapper: CallableWrapper<(), ()> =
            CallableWrapper::new(Callable::sync(|_| Err(anyhow!("nope"))), true);
        let err = wrapper.call(()).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn test_debug_names_variant() {
        let callable: Callable<(), ()> = Callable::sync(|_| Ok(()));
        assert_eq!(format!("{:?}", callable), "Callable(\"Sync\")");
    }
}
