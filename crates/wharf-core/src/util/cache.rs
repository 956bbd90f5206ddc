use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Map with per-entry expiry. Expired entries are evicted lazily on access.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash, V> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn insert_at(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(key, (now, value));
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &K, now: Instant) -> Option<&V> {
        let expired = match self.entries.get(key) {
            Some((stored, _)) => now.duration_since(*stored) >= self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|(_, value)| value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn purge_expired_at(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, (stored, _)| now.duration_since(*stored) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = TtlCache::new(Duration::from_secs(5));
        let start = Instant::now();
        cache.insert_at("catalog", 7, start);
        assert_eq!(cache.get_at(&"catalog", start), Some(&7));
        assert_eq!(
            cache.get_at(&"catalog", start + Duration::from_secs(4)),
            Some(&7)
        );
        assert_eq!(cache.get_at(&"catalog", start + Duration::from_secs(5)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_refreshes_expiry() {
        let mut cache = TtlCache::new(Duration::from_secs(5));
        let start = Instant::now();
        cache.insert_at("k", 1, start);
        cache.insert_at("k", 2, start + Duration::from_secs(4));
        assert_eq!(cache.get_at(&"k", start + Duration::from_secs(8)), Some(&2));
    }

    #[test]
    fn purge_drops_only_expired() {
        let mut cache = TtlCache::new(Duration::from_secs(10));
        let start = Instant::now();
        cache.insert_at("old", 1, start);
        cache.insert_at("new", 2, start + Duration::from_secs(8));
        cache.purge_expired_at(start + Duration::from_secs(12));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at(&"new", start + Duration::from_secs(12)), Some(&2));
    }
}
