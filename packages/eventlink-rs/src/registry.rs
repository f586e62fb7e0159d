//! Bidirectional multi-map backing every linker namespace.
//!
//! [`MultiBidict`] keeps two maps consistent as a unit:
//!
//! ```text
//! forward: key   ─► {values}      ("Ping" ─► {sub_a, sub_b})
//! inverse: value ─► {keys}        (sub_a  ─► {"Ping", "Pong"})
//! ```
//!
//! # Structural Invariant
//!
//! A value appears in `inverse` iff it appears under at least one key in
//! `forward`, and vice versa. No removal path ever leaves an empty set behind:
//! after detaching one side, the opposite side's set is checked and its entry
//! deleted if it became empty.
//!
//! The map is not synchronized. The owning linker serializes every mutation
//! and every multi-step read behind a single lock.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Entries that disappeared entirely as the result of unlinking one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unlinked<K, V> {
    /// The key, if its last value was removed.
    pub key: Option<K>,
    /// The value, if its last key was removed.
    pub value: Option<V>,
}

impl<K, V> Unlinked<K, V> {
    fn none() -> Self {
        Self {
            key: None,
            value: None,
        }
    }
}

/// A many-to-many map with O(1) average lookups in both directions.
#[derive(Debug, Clone)]
pub struct MultiBidict<K, V> {
    forward: HashMap<K, HashSet<V>>,
    inverse: HashMap<V, HashSet<K>>,
}

impl<K, V> Default for MultiBidict<K, V> {
    fn default() -> Self {
        Self {
            forward: HashMap::new(),
            inverse: HashMap::new(),
        }
    }
}

impl<K, V> MultiBidict<K, V>
where
    K: Hash + Eq + Clone,
    V: Hash + Eq + Clone,
{
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Returns true if no pair is linked.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// All keys with at least one value.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.forward.keys()
    }

    /// All values with at least one key.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inverse.keys()
    }

    /// Number of keys.
    pub fn key_count(&self) -> usize {
        self.forward.len()
    }

    /// Number of values.
    pub fn value_count(&self) -> usize {
        self.inverse.len()
    }

    /// Returns true if `key` has at least one value.
    pub fn contains_key(&self, key: &K) -> bool {
        self.forward.contains_key(key)
    }

    /// Returns true if `value` has at least one key.
    pub fn contains_value(&self, value: &V) -> bool {
        self.inverse.contains_key(value)
    }

    /// Returns true if `key` and `value` are linked.
    pub fn are_associated(&self, key: &K, value: &V) -> bool {
        self.forward
            .get(key)
            .map(|values| values.contains(value))
            .unwrap_or(false)
    }

    /// Number of values linked to `key`.
    pub fn value_count_from_key(&self, key: &K) -> usize {
        self.forward.get(key).map(HashSet::len).unwrap_or(0)
    }

    /// Number of keys linked to `value`.
    pub fn key_count_from_value(&self, value: &V) -> usize {
        self.inverse.get(value).map(HashSet::len).unwrap_or(0)
    }

    /// Union of the values linked to any of `keys`.
    pub fn values_from_keys<'a, I>(&self, keys: I) -> HashSet<V>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        keys.into_iter()
            .filter_map(|key| self.forward.get(key))
            .flatten()
            .cloned()
            .collect()
    }

    /// Union of the keys linked to any of `values`.
    pub fn keys_from_values<'a, I>(&self, values: I) -> HashSet<K>
    where
        I: IntoIterator<Item = &'a V>,
        V: 'a,
    {
        values
            .into_iter()
            .filter_map(|value| self.inverse.get(value))
            .flatten()
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Link `key` and `value`. Linking an existing pair is a no-op.
    pub fn insert(&mut self, key: K, value: V) {
        self.forward
            .entry(key.clone())
            .or_default()
            .insert(value.clone());
        self.inverse.entry(value).or_default().insert(key);
    }

    /// Link `value` to every key in `keys`.
    pub fn insert_many<I>(&mut self, keys: I, value: V)
    where
        I: IntoIterator<Item = K>,
    {
        for key in keys {
            self.insert(key, value.clone());
        }
    }

    /// Unlink one pair.
    ///
    /// Reports which side, if any, lost its last link and was deleted.
    pub fn remove(&mut self, key: &K, value: &V) -> Unlinked<K, V> {
        let mut unlinked = Unlinked::none();

        let Some(values) = self.forward.get_mut(key) else {
            return unlinked;
        };
        if !values.remove(value) {
            return unlinked;
        }
        if values.is_empty() {
            self.forward.remove(key);
            unlinked.key = Some(key.clone());
        }

        if let Some(keys) = self.inverse.get_mut(value) {
            keys.remove(key);
            if keys.is_empty() {
                self.inverse.remove(value);
                unlinked.value = Some(value.clone());
            }
        }
        unlinked
    }

    /// Remove `key` and all its links.
    ///
    /// Returns the values that were linked to it.
    pub fn remove_key(&mut self, key: &K) -> HashSet<V> {
        let Some(values) = self.forward.remove(key) else {
            return HashSet::new();
        };
        for value in &values {
            if let Some(keys) = self.inverse.get_mut(value) {
                keys.remove(key);
                if keys.is_empty() {
                    self.inverse.remove(value);
                }
            }
        }
        values
    }

    /// Remove every key in `keys`.
    pub fn remove_keys<'a, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        for key in keys {
            self.remove_key(key);
        }
    }

    /// Remove `value` and all its links.
    ///
    /// Returns the keys that were linked to it.
    pub fn remove_value(&mut self, value: &V) -> HashSet<K> {
        let Some(keys) = self.inverse.remove(value) else {
            return HashSet::new();
        };
        for key in &keys {
            if let Some(values) = self.forward.get_mut(key) {
                values.remove(value);
                if values.is_empty() {
                    self.forward.remove(key);
                }
            }
        }
        keys
    }

    /// Remove every value in `values`.
    pub fn remove_values<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = &'a V>,
        V: 'a,
    {
        for value in values {
            self.remove_value(value);
        }
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.forward.clear();
        self.inverse.clear();
    }

    /// Check the structural invariant. Test-only.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let forward_ok = self.forward.iter().all(|(key, values)| {
            !values.is_empty()
                && values.iter().all(|value| {
                    self.inverse
                        .get(value)
                        .map(|keys| keys.contains(key))
                        .unwrap_or(false)
                })
        });
        let inverse_ok = self.inverse.iter().all(|(value, keys)| {
            !keys.is_empty()
                && keys.iter().all(|key| {
                    self.forward
                        .get(key)
                        .map(|values| values.contains(value))
                        .unwrap_or(false)
                })
        });
        forward_ok && inverse_ok
    }
}
