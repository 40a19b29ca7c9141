//! # Inbound De-duplication
//!
//! Time-bounded LRU of envelope ids. An id seen within the TTL window is
//! reported as a duplicate; the oldest ids are evicted past capacity.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    ttl: Duration,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        DedupCache {
            capacity: capacity.max(1),
            ttl,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Records `id`. Returns true the first time it is seen within the TTL.
    pub fn insert(&mut self, id: &str) -> bool {
        let now = Instant::now();
        self.evict_expired(now);

        if self.seen.contains_key(id) {
            return false;
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((old, at)) => {
                    if self.seen.get(&old) == Some(&at) {
                        self.seen.remove(&old);
                    }
                }
                None => break,
            }
        }

        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) < self.ttl {
                break;
            }
            if self.seen.get(id) == Some(at) {
                self.seen.remove(id);
            }
            self.order.pop_front();
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        DedupCache::new(1000, Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_ttl() {
        let mut cache = DedupCache::default();
        assert!(cache.insert("m1"));
        assert!(!cache.insert("m1"));
        assert!(cache.insert("m2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_ttl() {
        let mut cache = DedupCache::new(10, Duration::from_secs(300));
        assert!(cache.insert("m1"));
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.insert("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let mut cache = DedupCache::new(2, Duration::from_secs(300));
        cache.insert("m1");
        cache.insert("m2");
        cache.insert("m3");
        assert_eq!(cache.len(), 2);
        assert!(cache.insert("m1"));
        assert!(!cache.insert("m3"));
    }
}
