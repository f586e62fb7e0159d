//! Subscription lifecycle.
//!
//! A subscription is anything that can be torn down. Teardown is idempotent:
//! the first call does the work and returns `true`, every later call is a
//! no-op returning `false`.

use std::fmt;

use chrono::{DateTime, Utc};

/// Something that can be detached from whatever it is subscribed to.
pub trait Unsubscribable {
    /// Release the subscription.
    ///
    /// Returns `true` only if this call actually performed the cleanup.
    fn unsubscribe(&self) -> bool;
}

type Teardown = Box<dyn Fn() -> bool + Send + Sync>;

/// A teardown callback plus the moment the subscription was created.
///
/// The teardown decides idempotency: it must report `false` once there is
/// nothing left to release.
pub struct Subscription {
    teardown: Teardown,
    timestamp: DateTime<Utc>,
}

impl Subscription {
    /// Create a subscription released by `teardown`.
    pub fn new<F>(teardown: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            teardown: Box::new(teardown),
            timestamp: Utc::now(),
        }
    }

    /// When the subscription was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Unsubscribable for Subscription {
    fn unsubscribe(&self) -> bool {
        (self.teardown)()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}
