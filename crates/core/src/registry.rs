//! Ordered callback storage and registration handles
//!
//! Callbacks and rules run in registration order and may register or remove
//! entries while they run, so dispatch always iterates a [`snapshot`]
//! taken under the lock rather than the registry itself.
//!
//! [`snapshot`]: OrderedRegistry::snapshot

use slotmap::{Key, SlotMap};

/// Slot map that remembers insertion order
#[derive(Debug)]
pub struct OrderedRegistry<K: Key, T> {
    entries: SlotMap<K, T>,
    order: Vec<K>,
}

impl<K: Key, T> Default for OrderedRegistry<K, T> {
    fn default() -> Self {
        Self {
            entries: SlotMap::with_key(),
            order: Vec::new(),
        }
    }
}

impl<K: Key, T> OrderedRegistry<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> K {
        let key = self.entries.insert(value);
        self.order.push(key);
        key
    }

    pub fn remove(&mut self, key: K) -> Option<T> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| *k != key);
        Some(value)
    }

    pub fn get(&self, key: K) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in registration order
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(*key).map(|value| (*key, value)))
    }

    /// First key, in registration order, whose entry matches
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<K> {
        self.iter()
            .find(|(_, value)| predicate(value))
            .map(|(key, _)| key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl<K: Key, T: Clone> OrderedRegistry<K, T> {
    /// Clone of every entry in registration order
    pub fn snapshot(&self) -> Vec<T> {
        self.iter().map(|(_, value)| value.clone()).collect()
    }
}

/// Keeps a registration alive; dropping it unregisters
///
/// The release action holds only a weak reference to its owner, so a
/// registration outliving its manager does nothing on drop.
#[must_use = "dropping a registration unregisters it immediately"]
pub struct Registration {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Registration {
    pub(crate) fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Unregister now
    pub fn unregister(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Keep the entry registered for the owner's whole lifetime
    pub fn forget(mut self) {
        self.release = None;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("active", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::new_key_type;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    new_key_type! {
        struct TestKey;
    }

    #[test]
    fn test_iteration_follows_insertion_order() {
        let mut registry: OrderedRegistry<TestKey, &str> = OrderedRegistry::new();
        let a = registry.insert("a");
        registry.insert("b");
        registry.remove(a);
        // Reuses a's slot but must come last
        registry.insert("c");
        registry.insert("d");

        assert_eq!(registry.snapshot(), vec!["b", "c", "d"]);
        assert_eq!(registry.len(), 3);
        assert!(!registry.contains_key(a));
    }

    #[test]
    fn test_find_and_clear() {
        let mut registry: OrderedRegistry<TestKey, u32> = OrderedRegistry::new();
        registry.insert(1);
        let two = registry.insert(2);
        assert_eq!(registry.find(|v| *v == 2), Some(two));
        assert_eq!(registry.find(|v| *v == 3), None);

        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.iter().count(), 0);
    }

    #[test]
    fn test_registration_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let registration = Registration::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(registration);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let counter = count.clone();
        Registration::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unregister();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let counter = count.clone();
        Registration::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .forget();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
