use std::time::SystemTime;

/// A small least-recently-used cache that remembers when each entry was
/// filled. Whether a cached value is still trustworthy is the caller's call
/// (the backend compares the fill time against the slot file's mtime), so
/// `get` hands the timestamp back alongside the value.
pub struct LruCache<K, V> {
    cap: usize,
    /// Most recently used at the back.
    entries: Vec<(K, V, SystemTime)>,
}

impl<K: Eq, V: Clone> LruCache<K, V> {
    pub fn new(cap: usize) -> Self {
        Self { cap, entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks a key up, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<(V, SystemTime)> {
        let pos = self.entries.iter().position(|(k, ..)| k == key)?;
        let entry = self.entries.remove(pos);
        let res = (entry.1.clone(), entry.2);
        self.entries.push(entry);
        Some(res)
    }

    /// Inserts or replaces a value, stamped with the current time.
    pub fn put(&mut self, key: K, value: V) {
        if let Some(pos) = self.entries.iter().position(|(k, ..)| k == &key) {
            self.entries.remove(pos);
        }
        self.entries.push((key, value, SystemTime::now()));
        while self.entries.len() > self.cap {
            self.entries.remove(0);
        }
    }

    pub fn remove(&mut self, key: &K) {
        if let Some(pos) = self.entries.iter().position(|(k, ..)| k == key) {
            self.entries.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.put(1, "a");
        cache.put(2, "b");
        assert!(cache.get(&1).is_some()); // 2 is now the oldest
        cache.put(3, "c");

        assert!(cache.get(&2).is_none());
        assert_eq!(cache.get(&1).map(|(v, _)| v), Some("a"));
        assert_eq!(cache.get(&3).map(|(v, _)| v), Some("c"));
    }

    #[test]
    fn replace_updates_in_place() {
        let mut cache = LruCache::new(2);
        cache.put(1, "a");
        cache.put(1, "b");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1).map(|(v, _)| v), Some("b"));
    }
}
