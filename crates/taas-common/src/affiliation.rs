//! Reference-counted affiliation index.
//!
//! An [`Affiliations`] maps a key to a set of values, counting how many
//! times each `(key, value)` pair was affiliated. A pair exists iff its
//! count is positive. Lookups never create entries.
//!
//! The flow controller keys shared switch state on it:
//!
//! - VLAN → taas_id: one broadcast/multicast mirror rule per VLAN whose
//!   action list has one clause per affiliated tap service.
//! - taas_id → (flow, remote host): the tunnel rule for a taas_id towards a
//!   remote host, and the tunnel port itself, live while any pair names
//!   that host.
//!
//! The index holds no locks; callers serialize mutation per key.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Refcounted key → value-set multimap.
#[derive(Debug, Clone)]
pub struct Affiliations<K, V> {
    entries: HashMap<K, HashMap<V, u32>>,
}

impl<K, V> Affiliations<K, V>
where
    K: Eq + Hash,
    V: Eq + Hash,
{
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Adds one reference to `(key, value)`, creating the pair if absent.
    ///
    /// Returns the new reference count.
    pub fn affiliate(&mut self, key: K, value: V) -> u32 {
        let count = self
            .entries
            .entry(key)
            .or_default()
            .entry(value)
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Drops one reference to `(key, value)`, removing the pair when the
    /// count reaches zero. Absent pairs are ignored.
    ///
    /// Returns the remaining reference count.
    pub fn unaffiliate(&mut self, key: &K, value: &V) -> u32 {
        let Some(values) = self.entries.get_mut(key) else {
            return 0;
        };
        let Some(count) = values.get_mut(value) else {
            return 0;
        };

        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            values.remove(value);
            if values.is_empty() {
                self.entries.remove(key);
            }
        }
        remaining
    }

    /// Returns the current reference count of `(key, value)`.
    pub fn ref_count(&self, key: &K, value: &V) -> u32 {
        self.entries
            .get(key)
            .and_then(|values| values.get(value))
            .copied()
            .unwrap_or(0)
    }

    /// Returns true if any pair, under any key, satisfies `pred`.
    pub fn any_value<F>(&self, mut pred: F) -> bool
    where
        F: FnMut(&V) -> bool,
    {
        self.entries
            .values()
            .flat_map(|values| values.keys())
            .any(|v| pred(v))
    }

    /// Returns true if nothing is affiliated.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Affiliations<K, V>
where
    K: Eq + Hash,
    V: Eq + Hash + Clone,
{
    /// Returns the values affiliated with `key`. Order is unspecified.
    pub fn list(&self, key: &K) -> HashSet<V> {
        self.entries
            .get(key)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl<K, V> Default for Affiliations<K, V>
where
    K: Eq + Hash,
    V: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
