//! Generic keyed event registry with user-defined merging.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Merge semantics for values stored in an [`EventRegistry`].
///
/// `merge` combines the pending value with a newer one for the same key and
/// returns the combined value plus a flag asking for the entry's removal.
/// Removal is how canceling pairs (a transition immediately undone by its
/// inverse) collapse to "no change".
pub trait Merge: Sized {
    fn merge(self, newer: Self) -> (Self, bool);
}

/// A thread-safe map of pending events keyed by `K`.
///
/// Stores merge instead of overwriting, so at most one — net-effect —
/// entry exists per key at any time. Consumers either [`flush`] the whole
/// map or [`process`] entries one by one, removing those handled
/// successfully and leaving failures queued for the next pass.
///
/// [`flush`]: EventRegistry::flush
/// [`process`]: EventRegistry::process
#[derive(Debug)]
pub struct EventRegistry<K, V> {
    events: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for EventRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> EventRegistry<K, V> {
    pub fn new() -> Self {
        EventRegistry {
            events: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> EventRegistry<K, V>
where
    K: Eq + Hash,
    V: Merge,
{
    /// Inserts an event, merging with any pending event for the same key.
    /// A merge that reports removal deletes the entry entirely.
    pub fn store(&self, key: K, value: V) {
        let mut events = self.events.lock().expect("event registry poisoned");

        let Some(pending) = events.remove(&key) else {
            events.insert(key, value);
            return;
        };

        let (merged, remove) = pending.merge(value);
        if !remove {
            events.insert(key, merged);
        }
    }

    /// Puts back an event that failed to process.
    ///
    /// The event predates anything stored meanwhile, so the merge runs with
    /// the restored event as the older side. This keeps init/new chains
    /// consistent when a flush partially fails.
    pub fn restore(&self, key: K, value: V) {
        let mut events = self.events.lock().expect("event registry poisoned");

        let Some(newer) = events.remove(&key) else {
            events.insert(key, value);
            return;
        };

        let (merged, remove) = value.merge(newer);
        if !remove {
            events.insert(key, merged);
        }
    }

    /// Removes and returns all pending events.
    pub fn flush(&self) -> HashMap<K, V> {
        let mut events = self.events.lock().expect("event registry poisoned");
        std::mem::take(&mut events)
    }

    /// Applies `processor` to every pending event, deleting the entries it
    /// handled successfully. Returns the number of processed entries.
    pub fn process<E>(&self, mut processor: impl FnMut(&K, &V) -> Result<(), E>) -> usize {
        let mut events = self.events.lock().expect("event registry poisoned");

        let mut processed = 0;
        events.retain(|key, value| match processor(key, value) {
            Ok(()) => {
                processed += 1;
                false
            }
            Err(_) => true,
        });
        processed
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.events.lock().expect("event registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> EventRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A copy of the current events. Primarily for tests.
    pub fn entries(&self) -> HashMap<K, V> {
        self.events.lock().expect("event registry poisoned").clone()
    }
}
