//! Namespaced subscriber registry.
//!
//! An [`EventLinker`] is one namespace: a [`MultiBidict`] from event names to
//! subscribers, a lock, and a fixed [`LinkerConfig`]. Handles are cheap to
//! clone and all clones share the same namespace. Distinct linkers never share
//! subscribers, which is how tests and unrelated buses stay isolated.
//!
//! ```text
//! EventLinker (Clone)
//!     │
//!     └─► Arc<LinkerInner>
//!             ├─ config: LinkerConfig            (fixed at build time)
//!             └─ registry: Mutex<MultiBidict<String, Arc<EventSubscriber>>>
//! ```
//!
//! # Locking
//!
//! Every mutation and every multi-step read takes the namespace lock exactly
//! once. Nothing inside the lock awaits or runs user callbacks, so the lock is
//! a plain `std::sync::Mutex`.
//!
//! # Subscriber Teardown
//!
//! Each subscriber's teardown holds only `Weak` references to the namespace and
//! to itself. Dropping every linker handle frees the namespace even while
//! subscribers are still referenced elsewhere; their `unsubscribe` then
//! reports `false`.
//!
//! # Example
//!
//! ```ignore
//! let linker = EventLinker::builder()
//!     .namespace("billing")
//!     .max_subscribers(2)
//!     .build()?;
//!
//! let subscriber = linker
//!     .on(&["Ping".into()])
//!     .event(Callable::sync(|_args| Ok(None)))
//!     .subscribe()?;
//!
//! assert!(linker.are_linked(&"Ping".into(), &subscriber)?);
//! subscriber.unsubscribe();
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::callable::{EventCallback, FailureCallback, SuccessCallback};
use crate::core::{resolve_all, EventKey};
use crate::error::EventLinkError;
use crate::registry::MultiBidict;
use crate::subscriber::{EventSubscriber, SubscribeOptions};

type Registry = MultiBidict<String, Arc<EventSubscriber>>;

/// Namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "default";

static GLOBAL: LazyLock<EventLinker> = LazyLock::new(EventLinker::new);

// =============================================================================
// Configuration
// =============================================================================

/// Namespace configuration, fixed when the linker is built.
#[derive(Debug, Clone)]
pub struct LinkerConfig {
    namespace: String,
    max_subscribers: Option<usize>,
    default_success_callback: Option<SuccessCallback>,
    default_failure_callback: Option<FailureCallback>,
    debug: bool,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_subscribers: None,
            default_success_callback: None,
            default_failure_callback: None,
            debug: false,
        }
    }
}

impl LinkerConfig {
    /// Namespace name, used in log fields.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Per-event subscriber limit; `None` means unlimited.
    pub fn max_subscribers(&self) -> Option<usize> {
        self.max_subscribers
    }

    /// Success callback given to subscribers that set none.
    pub fn default_success_callback(&self) -> Option<&SuccessCallback> {
        self.default_success_callback.as_ref()
    }

    /// Failure callback given to subscribers that set none.
    pub fn default_failure_callback(&self) -> Option<&FailureCallback> {
        self.default_failure_callback.as_ref()
    }

    /// Returns true if registry mutations are logged.
    pub fn debug(&self) -> bool {
        self.debug
    }
}

/// Builder for an [`EventLinker`] namespace.
#[derive(Debug, Default)]
pub struct EventLinkerBuilder {
    config: LinkerConfig,
}

impl EventLinkerBuilder {
    /// Name the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Limit the number of subscribers per event. Must be at least 1.
    pub fn max_subscribers(mut self, limit: usize) -> Self {
        self.config.max_subscribers = Some(limit);
        self
    }

    /// Set the success callback used when a subscriber provides none.
    pub fn default_success_callback(mut self, callback: SuccessCallback) -> Self {
        self.config.default_success_callback = Some(callback);
        self
    }

    /// Set the failure callback used when a subscriber provides none.
    pub fn default_failure_callback(mut self, callback: FailureCallback) -> Self {
        self.config.default_failure_callback = Some(callback);
        self
    }

    /// Log registry mutations at debug level.
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Validate the configuration and create the namespace.
    pub fn build(self) -> Result<EventLinker, EventLinkError> {
        if let Some(0) = self.config.max_subscribers {
            return Err(EventLinkError::InvalidMaxSubscribers { value: 0 });
        }
        Ok(EventLinker::with_config(self.config))
    }
}

// =============================================================================
// Event Linker
// =============================================================================

struct LinkerInner {
    config: LinkerConfig,
    registry: Mutex<Registry>,
}

impl LinkerInner {
    /// Lock the registry, recovering from poisoning.
    ///
    /// Registry operations never run user code, so a poisoned lock only means
    /// another thread panicked elsewhere while holding it; the maps are intact.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    namespace = %self.config.namespace,
                    "registry lock was poisoned, recovering"
                );
                poisoned.into_inner()
            }
        }
    }

    fn detach(&self, subscriber: &Arc<EventSubscriber>) -> bool {
        let removed = self.registry().remove_value(subscriber);
        if self.config.debug && !removed.is_empty() {
            debug!(
                namespace = %self.config.namespace,
                subscriber = %subscriber.id(),
                events = ?removed,
                "subscriber removed"
            );
        }
        !removed.is_empty()
    }
}

/// Handle to one subscriber namespace.
#[derive(Clone)]
pub struct EventLinker {
    inner: Arc<LinkerInner>,
}

impl Default for EventLinker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLinker {
    /// Create an unlimited namespace with default configuration.
    pub fn new() -> Self {
        Self::with_config(LinkerConfig::default())
    }

    /// Start configuring a namespace.
    pub fn builder() -> EventLinkerBuilder {
        EventLinkerBuilder::default()
    }

    fn with_config(config: LinkerConfig) -> Self {
        Self {
            inner: Arc::new(LinkerInner {
                config,
                registry: Mutex::new(MultiBidict::new()),
            }),
        }
    }

    /// The process-wide default namespace.
    ///
    /// Created on first use and never torn down.
    pub fn global() -> &'static EventLinker {
        &GLOBAL
    }

    /// The namespace configuration.
    pub fn config(&self) -> &LinkerConfig {
        &self.inner.config
    }

    /// Returns true if both handles refer to the same namespace.
    pub fn same_namespace(&self, other: &EventLinker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // -------------------------------------------------------------------------
    // Subscribe / Unsubscribe
    // -------------------------------------------------------------------------

    /// Register a subscriber under every event in `events`.
    ///
    /// Fails without touching the registry when `events` is empty, when an
    /// event name does not resolve, or when any target event is already at
    /// the namespace's subscriber limit.
    pub fn subscribe(
        &self,
        events: &[EventKey],
        mut options: SubscribeOptions,
    ) -> Result<Arc<EventSubscriber>, EventLinkError> {
        let names = resolve_all(events)?;
        let config = &self.inner.config;

        if options.success_callback.is_none() {
            options.success_callback = config.default_success_callback.clone();
        }
        if options.failure_callback.is_none() {
            options.failure_callback = config.default_failure_callback.clone();
        }

        let mut registry = self.inner.registry();

        if let Some(limit) = config.max_subscribers {
            if let Some(full) = names
                .iter()
                .find(|name| registry.value_count_from_key(name) >= limit)
            {
                return Err(EventLinkError::CapacityExceeded {
                    event: full.clone(),
                    limit,
                });
            }
        }

        let namespace: Weak<LinkerInner> = Arc::downgrade(&self.inner);
        let subscriber = Arc::new_cyclic(|this: &Weak<EventSubscriber>| {
            let this = this.clone();
            EventSubscriber::new(options, move || {
                match (namespace.upgrade(), this.upgrade()) {
                    (Some(inner), Some(subscriber)) => inner.detach(&subscriber),
                    _ => false,
                }
            })
        });

        registry.insert_many(names.iter().cloned(), subscriber.clone());
        drop(registry);

        if config.debug {
            debug!(
                namespace = %config.namespace,
                subscriber = %subscriber.id(),
                events = ?names,
                once = subscriber.is_once(),
                "subscriber registered"
            );
        }
        Ok(subscriber)
    }

    /// Detach `subscriber` from the given events only.
    ///
    /// Returns true if at least one link was removed.
    pub fn unsubscribe(
        &self,
        events: &[EventKey],
        subscriber: &Arc<EventSubscriber>,
    ) -> Result<bool, EventLinkError> {
        let names = resolve_all(events)?;
        let mut registry = self.inner.registry();
        let mut removed = false;
        for name in &names {
            if registry.are_associated(name, subscriber) {
                registry.remove(name, subscriber);
                removed = true;
            }
        }
        drop(registry);

        if removed && self.inner.config.debug {
            debug!(
                namespace = %self.inner.config.namespace,
                subscriber = %subscriber.id(),
                events = ?names,
                "subscriber unlinked"
            );
        }
        Ok(removed)
    }

    /// Detach `subscriber` from every event.
    pub fn remove_subscriber(&self, subscriber: &Arc<EventSubscriber>) -> bool {
        self.inner.detach(subscriber)
    }

    /// Remove an event and all of its links.
    pub fn remove_event(&self, event: &EventKey) -> Result<bool, EventLinkError> {
        let name = event.resolve()?;
        let removed = self.inner.registry().remove_key(&name);
        if self.inner.config.debug && !removed.is_empty() {
            debug!(
                namespace = %self.inner.config.namespace,
                event = %name,
                subscribers = removed.len(),
                "event removed"
            );
        }
        Ok(!removed.is_empty())
    }

    /// Remove every event and subscriber in the namespace.
    pub fn remove_all(&self) -> bool {
        let mut registry = self.inner.registry();
        let had_links = !registry.is_empty();
        registry.clear();
        drop(registry);

        if had_links && self.inner.config.debug {
            debug!(namespace = %self.inner.config.namespace, "namespace cleared");
        }
        had_links
    }

    // -------------------------------------------------------------------------
    // Progressive subscription
    // -------------------------------------------------------------------------

    /// Start building a subscriber for `events`.
    pub fn on(&self, events: &[EventKey]) -> SubscriptionContext {
        SubscriptionContext::new(self.clone(), events, false)
    }

    /// Start building a one-shot subscriber for `events`.
    pub fn once(&self, events: &[EventKey]) -> SubscriptionContext {
        SubscriptionContext::new(self.clone(), events, true)
    }

    /// Let `build` fill in the callbacks, then subscribe.
    ///
    /// ```ignore
    /// linker.scoped(&["Ping".into()], false, |ctx| {
    ///     ctx.event(Callable::sync(on_ping)).failure(Callable::sync(report))
    /// })?;
    /// ```
    pub fn scoped<F>(
        &self,
        events: &[EventKey],
        once: bool,
        build: F,
    ) -> Result<Arc<EventSubscriber>, EventLinkError>
    where
        F: FnOnce(SubscriptionContext) -> SubscriptionContext,
    {
        build(SubscriptionContext::new(self.clone(), events, once)).subscribe()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// All event names with at least one subscriber.
    pub fn events(&self) -> Vec<String> {
        self.inner.registry().keys().cloned().collect()
    }

    /// All subscribers linked to at least one event.
    pub fn subscribers(&self) -> Vec<Arc<EventSubscriber>> {
        self.inner.registry().values().cloned().collect()
    }

    /// Number of events.
    pub fn event_count(&self) -> usize {
        self.inner.registry().key_count()
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry().value_count()
    }

    /// Union of the events the given subscribers are linked to.
    pub fn events_from_subscribers(&self, subscribers: &[Arc<EventSubscriber>]) -> HashSet<String> {
        self.inner.registry().keys_from_values(subscribers)
    }

    /// Union of the subscribers linked to any of `events`.
    ///
    /// With `pop_once`, one-shot subscribers in the result are detached from
    /// the namespace in the same critical section that selected them, so two
    /// racing callers can never both receive the same one-shot subscriber.
    pub fn subscribers_from_events(
        &self,
        events: &[EventKey],
        pop_once: bool,
    ) -> Result<HashSet<Arc<EventSubscriber>>, EventLinkError> {
        let names = events
            .iter()
            .map(EventKey::resolve)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.select(&names, pop_once))
    }

    pub(crate) fn select(&self, names: &[String], pop_once: bool) -> HashSet<Arc<EventSubscriber>> {
        let mut registry = self.inner.registry();
        let selected = registry.values_from_keys(names);
        if pop_once {
            for subscriber in selected.iter().filter(|s| s.is_once()) {
                registry.remove_value(subscriber);
            }
        }
        selected
    }

    /// Number of events `subscriber` is linked to.
    pub fn event_count_from_subscriber(&self, subscriber: &Arc<EventSubscriber>) -> usize {
        self.inner.registry().key_count_from_value(subscriber)
    }

    /// Number of subscribers linked to `event`.
    pub fn subscriber_count_from_event(&self, event: &EventKey) -> Result<usize, EventLinkError> {
        let name = event.resolve()?;
        Ok(self.inner.registry().value_count_from_key(&name))
    }

    /// Returns true if `event` has at least one subscriber.
    pub fn contains_event(&self, event: &EventKey) -> Result<bool, EventLinkError> {
        let name = event.resolve()?;
        Ok(self.inner.registry().contains_key(&name))
    }

    /// Returns true if `subscriber` is linked to at least one event.
    pub fn contains_subscriber(&self, subscriber: &Arc<EventSubscriber>) -> bool {
        self.inner.registry().contains_value(subscriber)
    }

    /// Returns true if `subscriber` is linked to `event`.
    pub fn are_linked(
        &self,
        event: &EventKey,
        subscriber: &Arc<EventSubscriber>,
    ) -> Result<bool, EventLinkError> {
        let name = event.resolve()?;
        Ok(self.inner.registry().are_associated(&name, subscriber))
    }
}

impl fmt::Debug for EventLinker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry();
        f.debug_struct("EventLinker")
            .field("namespace", &self.inner.config.namespace)
            .field("max_subscribers", &self.inner.config.max_subscribers)
            .field("events", &registry.key_count())
            .field("subscribers", &registry.value_count())
            .finish()
    }
}

// =============================================================================
// Subscription Context
// =============================================================================

/// Collects callbacks and registers a subscriber in one step.
///
/// Nothing is registered until [`SubscriptionContext::subscribe`]; finishing
/// without an event callback fails with
/// [`EventLinkError::MissingEventCallback`].
#[must_use = "nothing is registered until subscribe() is called"]
pub struct SubscriptionContext {
    linker: EventLinker,
    events: Vec<EventKey>,
    once: bool,
    force_async: bool,
    event_callback: Option<EventCallback>,
    success_callback: Option<SuccessCallback>,
    failure_callback: Option<FailureCallback>,
}

impl SubscriptionContext {
    fn new(linker: EventLinker, events: &[EventKey], once: bool) -> Self {
        Self {
            linker,
            events: events.to_vec(),
            once,
            force_async: false,
            event_callback: None,
            success_callback: None,
            failure_callback: None,
        }
    }

    /// Set the event callback.
    pub fn event(mut self, callback: EventCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// Set the success callback.
    pub fn success(mut self, callback: SuccessCallback) -> Self {
        self.success_callback = Some(callback);
        self
    }

    /// Set the failure callback.
    pub fn failure(mut self, callback: FailureCallback) -> Self {
        self.failure_callback = Some(callback);
        self
    }

    /// Offload synchronous callbacks onto a blocking thread.
    pub fn force_async(mut self, force_async: bool) -> Self {
        self.force_async = force_async;
        self
    }

    /// Register the subscriber.
    pub fn subscribe(self) -> Result<Arc<EventSubscriber>, EventLinkError> {
        let event_callback = self
            .event_callback
            .ok_or(EventLinkError::MissingEventCallback)?;

        let mut options = SubscribeOptions::new(event_callback)
            .force_async(self.force_async)
            .once(self.once);
        options.success_callback = self.success_callback;
        options.failure_callback = self.failure_callback;

        self.linker.subscribe(&self.events, options)
    }
}

impl fmt::Debug for SubscriptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionContext")
            .field("events", &self.events)
            .field("once", &self.once)
            .field("force_async", &self.force_async)
            .field("has_event_callback", &self.event_callback.is_some())
            .finish_non_exhaustive()
    }
}
