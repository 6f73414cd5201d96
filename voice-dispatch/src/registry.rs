use std::{collections::HashMap, hash::Hash};

/// Map that remembers insertion order.
///
/// Re-inserting an existing key updates the value in place and keeps its
/// original position, so `last` always names the most recently *added* key.
pub struct StreamRegistry<K, V> {
    order: Vec<K>,
    entries: HashMap<K, V>,
}

impl<K, V> StreamRegistry<K, V>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.entries.insert(key, value);
        if previous.is_none() {
            self.order.push(key);
        }
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// The most recently inserted entry.
    pub fn last(&self) -> Option<(K, &V)> {
        let key = *self.order.last()?;
        self.entries.get(&key).map(|v| (key, v))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.order.clone()
    }
}

impl<K, V> Default for StreamRegistry<K, V>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_and_last() {
        let mut registry = StreamRegistry::new();
        registry.insert(3, "c");
        registry.insert(1, "a");
        registry.insert(2, "b");
        assert_eq!(registry.keys(), vec![3, 1, 2]);
        assert_eq!(registry.last(), Some((2, &"b")));

        registry.remove(&2);
        assert_eq!(registry.last(), Some((1, &"a")));
    }

    #[test]
    fn test_update_keeps_position() {
        let mut registry = StreamRegistry::new();
        registry.insert(1, "a");
        registry.insert(2, "b");
        assert_eq!(registry.insert(1, "a2"), Some("a"));
        assert_eq!(registry.keys(), vec![1, 2]);
        assert_eq!(registry.get_mut(&1).copied(), Some("a2"));
        assert_eq!(registry.last(), Some((2, &"b")));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut registry: StreamRegistry<u32, &str> = StreamRegistry::new();
        assert!(registry.remove(&9).is_none());
        assert!(registry.keys().is_empty());
        assert!(registry.last().is_none());
    }
}
