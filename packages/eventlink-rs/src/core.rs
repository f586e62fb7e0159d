//! Core vocabulary shared by linkers, emitters and subscribers.
//!
//! # Overview
//!
//! Producers and subscribers exchange exactly four kinds of event:
//! - a literal string (`"Ping"`)
//! - a structured-record type implementing [`Event`]
//! - an error type implementing [`std::error::Error`]
//! - the "any event" sentinel ([`ANY_EVENT`])
//!
//! All of them resolve to a canonical string name through [`EventKey`].
//! Record and error events are named after their type, so subscribing with
//! `EventKey::of::<UserCreated>()` matches every `emit_event(UserCreated { .. })`.
//!
//! # Payloads
//!
//! Arguments travel type-erased as [`Payload`] (`Arc<dyn Any + Send + Sync>`),
//! the same shape the event envelope uses, and are recovered with typed
//! accessors on [`EventArgs`].

use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::EventLinkError;

/// Reserved event name matching every emission.
///
/// Subscribers registered under this name receive every event emitted in
/// their namespace, in addition to the subscribers of the event itself.
pub const ANY_EVENT: &str = "...";

/// Type-erased argument value.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Wrap a value as a [`Payload`].
pub fn payload<T: Any + Send + Sync>(value: T) -> Payload {
    Arc::new(value)
}

/// Short name of a type: the last path segment, without generic parameters.
///
/// `my_app::events::UserCreated` becomes `UserCreated`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// =============================================================================
// Event Trait
// =============================================================================

/// A structured record that can be emitted as an event.
///
/// The event name defaults to the short type name. Override
/// [`Event::event_name`] when two record types share a name across modules.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct UserCreated {
///     user_id: Uuid,
/// }
/// impl Event for UserCreated {}
///
/// linker.subscribe(&[EventKey::of::<UserCreated>()], options)?;
/// emitter.emit_event(UserCreated { user_id }, EventArgs::new())?;
/// ```
pub trait Event: Any + Send + Sync + 'static {
    /// The name subscribers use to refer to this event type.
    fn event_name() -> Cow<'static, str>
    where
        Self: Sized,
    {
        Cow::Borrowed(short_type_name::<Self>())
    }
}

// =============================================================================
// Event Key
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyKind {
    Name(String),
    Record(Cow<'static, str>),
    Error(&'static str),
    Any,
}

/// Something a subscriber can be linked to.
///
/// Build one with [`EventKey::name`], [`EventKey::of`], [`EventKey::error`]
/// or [`EventKey::any`]; strings convert with `.into()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey(KeyKind);

impl EventKey {
    /// A literal string event.
    ///
    /// The reserved name [`ANY_EVENT`] (`"..."`) is not a literal: it yields
    /// the same key as [`EventKey::any`], so subscribing to `"..."` receives
    /// every emission in the namespace.
    pub fn name(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == ANY_EVENT {
            return Self::any();
        }
        Self(KeyKind::Name(name))
    }

    /// A structured-record event type.
    pub fn of<E: Event>() -> Self {
        Self(KeyKind::Record(E::event_name()))
    }

    /// An error event type.
    pub fn error<E: std::error::Error + 'static>() -> Self {
        Self(KeyKind::Error(short_type_name::<E>()))
    }

    /// The sentinel matching every event.
    pub fn any() -> Self {
        Self(KeyKind::Any)
    }

    /// Returns true if this key is the "any event" sentinel.
    pub fn is_any(&self) -> bool {
        matches!(self.0, KeyKind::Any)
    }

    /// Resolve the canonical event name.
    ///
    /// Fails with [`EventLinkError::EmptyEventName`] for empty string events.
    pub fn resolve(&self) -> Result<String, EventLinkError> {
        match &self.0 {
            KeyKind::Name(name) if name.is_empty() => Err(EventLinkError::EmptyEventName),
            KeyKind::Name(name) => Ok(name.clone()),
            KeyKind::Record(name) => Ok(name.to_string()),
            KeyKind::Error(name) => Ok((*name).to_string()),
            KeyKind::Any => Ok(ANY_EVENT.to_string()),
        }
    }
}

impl From<&str> for EventKey {
    fn from(name: &str) -> Self {
        Self::name(name)
    }
}

impl From<String> for EventKey {
    fn from(name: String) -> Self {
        Self::name(name)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            KeyKind::Name(name) => write!(f, "{name:?}"),
            KeyKind::Record(name) => write!(f, "{name}"),
            KeyKind::Error(name) => write!(f, "{name}"),
            KeyKind::Any => write!(f, "{ANY_EVENT}"),
        }
    }
}

/// Resolve a list of keys, rejecting an empty list.
///
/// Duplicate names collapse; the order of first occurrence is kept.
pub(crate) fn resolve_all(events: &[EventKey]) -> Result<Vec<String>, EventLinkError> {
    if events.is_empty() {
        return Err(EventLinkError::NoEvents);
    }
    let mut names: Vec<String> = Vec::with_capacity(events.len());
    for key in events {
        let name = key.resolve()?;
        if !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

// =============================================================================
// Event Arguments
// =============================================================================

/// Positional and keyword arguments carried by an emission.
///
/// Cloning is cheap: values are reference counted.
///
/// # Example
///
/// ```ignore
/// let args = EventArgs::new().arg(42_u32).kwarg("source", "cli".to_string());
///
/// assert_eq!(args.get::<u32>(0), Some(&42));
/// assert_eq!(args.get_kwarg::<String>("source").map(String::as_str), Some("cli"));
/// ```
#[derive(Clone, Default)]
pub struct EventArgs {
    positional: SmallVec<[Payload; 4]>,
    keyword: BTreeMap<String, Payload>,
}

impl EventArgs {
    /// Create an empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.positional.push(Arc::new(value));
        self
    }

    /// Append an already-erased positional argument.
    pub fn arg_payload(mut self, value: Payload) -> Self {
        self.positional.push(value);
        self
    }

    /// Set a keyword argument, replacing any previous value for `name`.
    pub fn kwarg<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: T) -> Self {
        self.keyword.insert(name.into(), Arc::new(value));
        self
    }

    /// Put `value` in front of the positional arguments.
    pub(crate) fn prepend(mut self, value: Payload) -> Self {
        self.positional.insert(0, value);
        self
    }

    /// Typed access to the positional argument at `index`.
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.positional.get(index)?.downcast_ref()
    }

    /// The raw positional argument at `index`.
    pub fn get_payload(&self, index: usize) -> Option<&Payload> {
        self.positional.get(index)
    }

    /// Typed access to the keyword argument `name`.
    pub fn get_kwarg<T: Any>(&self, name: &str) -> Option<&T> {
        self.keyword.get(name)?.downcast_ref()
    }

    /// Number of positional arguments.
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// Returns true if there are neither positional nor keyword arguments.
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Keyword argument names, in sorted order.
    pub fn kwarg_names(&self) -> impl Iterator<Item = &str> {
        self.keyword.keys().map(String::as_str)
    }
}

impl fmt::Debug for EventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventArgs")
            .field("positional", &self.positional.len())
            .field("keyword", &self.keyword.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct UserCreated;
    impl Event for UserCreated {}

    #[derive(Debug, Clone)]
    struct Renamed;
    impl Event for Renamed {
        fn event_name() -> Cow<'static, str> {
            Cow::Borrowed("billing.Renamed")
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("value error")]
    struct ValueError;

    #[test]
    fn test_short_type_name_strips_path_and_generics() {
        assert_eq!(short_type_name::<UserCreated>(), "UserCreated");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
        assert_eq!(short_type_name::<u32>(), "u32");
    }

    #[test]
    fn test_key_resolution() {
        assert_eq!(EventKey::from("Ping").resolve().unwrap(), "Ping");
        assert_eq!(EventKey::of::<UserCreated>().resolve().unwrap(), "UserCreated");
        assert_eq!(EventKey::of::<Renamed>().resolve().unwrap(), "billing.Renamed");
        assert_eq!(EventKey::error::<ValueError>().resolve().unwrap(), "ValueError");
        assert_eq!(EventKey::any().resolve().unwrap(), ANY_EVENT);
    }

    #[test]
    fn test_sentinel_string_is_the_any_key() {
        let key = EventKey::from(ANY_EVENT);
        assert!(key.is_any());
        assert_eq!(key, EventKey::any());
        assert!(!EventKey::from("....").is_any());
    }

    #[test]
    fn test_empty_string_is_rejected() {
        assert!(matches!(
            EventKey::from("").resolve(),
            Err(EventLinkError::EmptyEventName)
        ));
    }

    #[test]
    fn test_resolve_all_requires_events_and_dedups() {
        assert!(matches!(resolve_all(&[]), Err(EventLinkError::NoEvents)));

        let names = resolve_all(&["a".into(), "b".into(), "a".into()]).unwrap();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_resolve_all_fails_on_any_bad_key() {
        let result = resolve_all(&["ok".into(), "".into()]);
        assert!(matches!(result, Err(EventLinkError::EmptyEventName)));
    }

    #[test]
    fn test_args_typed_access() {
        let args = EventArgs::new()
            .arg(7_i32)
            .arg("text")
            .kwarg("flag", true);

        assert_eq!(args.len(), 2);
        assert_eq!(args.get::<i32>(0), Some(&7));
        assert_eq!(args.get::<&str>(1), Some(&"text"));
        assert_eq!(args.get::<i32>(1), None);
        assert_eq!(args.get::<i32>(5), None);
        assert_eq!(args.get_kwarg::<bool>("flag"), Some(&true));
        assert_eq!(args.kwarg_names().collect::<Vec<_>>(), vec!["flag"]);
    }

    #[test]
    fn test_prepend_puts_value_first() {
        let args = EventArgs::new().arg(2_u8).prepend(payload(1_u8));
        assert_eq!(args.get::<u8>(0), Some(&1));
        assert_eq!(args.get::<u8>(1), Some(&2));
    }

    #[test]
    fn test_debug_hides_values() {
        let args = EventArgs::new().arg(1).kwarg("secret", "hunter2");
        let debug = format!("{:?}", args);
        assert!(debug.contains("positional: 1"));
        assert!(debug.contains("secret"));
        assert!(!debug.contains("hunter2"));
    }
}
