//! In-memory response cache, keyed by `<canonical-host>$<request-target>`.
//!
//! Entries carry their body size and an absolute expiry. The cache is
//! bounded by total byte size; crossing the limit evicts from the tail of
//! the recency list, never by expiry order. An expired entry is removed the
//! moment a lookup touches it and reported as a miss.

use crate::lists::{LinkedList, NodeId};
use crate::prelude::*;
use std::time::Instant;

struct Entry {
    descriptor: Arc<Descriptor>,
    size: usize,
    expires: Instant,
    node: NodeId,
}

/// Size-bounded LRU of rendered responses.
///
/// All operations take `&mut self`; callers serialize access behind the
/// server's cache lock.
pub struct ResponseCache {
    map: HashMap<String, Entry>,
    // Most recently used at the head; node values are the map keys.
    order: LinkedList<String>,
    total_size: usize,
    size_limit: usize,
}

impl ResponseCache {
    /// Creates a cache bounded to `size_limit` bytes of body data.
    ///
    /// A limit of `0` disables eviction; entries then only leave through
    /// expiry or [`remove`](Self::remove).
    #[must_use]
    pub fn new(size_limit: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: LinkedList::new(),
            total_size: 0,
            size_limit,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sum of entry sizes currently held.
    #[inline]
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Looks `key` up, promoting a live hit to most-recently-used.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<Arc<Descriptor>> {
        let expired = {
            let entry = self.map.get(key)?;
            entry.expires <= Instant::now()
        };
        if expired {
            self.remove(key);
            return None;
        }
        let entry = self.map.get(key).expect("checked above");
        let node = entry.node;
        let descriptor = Arc::clone(&entry.descriptor);
        self.order.move_to_front(node);
        Some(descriptor)
    }

    /// Inserts or updates `key`, then evicts from the tail while over
    /// budget.
    pub fn put(&mut self, key: String, descriptor: Arc<Descriptor>, size: usize, expires: Instant) {
        match self.map.get_mut(&key) {
            Some(entry) => {
                self.total_size = self.total_size - entry.size + size;
                entry.descriptor = descriptor;
                entry.size = size;
                entry.expires = expires;
                let node = entry.node;
                self.order.move_to_front(node);
            }
            None => {
                let node = self.order.push_front(key.clone());
                self.map.insert(
                    key,
                    Entry {
                        descriptor,
                        size,
                        expires,
                        node,
                    },
                );
                self.total_size += size;
            }
        }
        while self.size_limit > 0 && self.total_size > self.size_limit {
            let Some(tail) = self.order.pop_back() else {
                break;
            };
            if let Some(entry) = self.map.remove(&tail) {
                self.total_size -= entry.size;
                debug!("evicted {tail:?} from response cache");
            }
        }
    }

    /// Removes `key`, returning its descriptor.
    pub fn remove(&mut self, key: &str) -> Option<Arc<Descriptor>> {
        let entry = self.map.remove(key)?;
        self.order.remove(entry.node);
        self.total_size -= entry.size;
        Some(entry.descriptor)
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.map.clear();
        self.order = LinkedList::new();
        self.total_size = 0;
    }
}

impl Debug for ResponseCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.map.len())
            .field("total_size", &self.total_size)
            .field("size_limit", &self.size_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn descriptor(body: &'static str) -> Arc<Descriptor> {
        Arc::new(Descriptor::new(200).with_text(body).entity_tag("t"))
    }

    fn live() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn hit_and_miss() {
        let mut cache = ResponseCache::new(1024);
        assert!(cache.get("a$/x").is_none());
        cache.put("a$/x".into(), descriptor("hello"), 5, live());
        let hit = cache.get("a$/x").expect("live hit");
        assert_eq!(hit.status, 200);
        assert_eq!(cache.total_size(), 5);
    }

    #[test]
    fn repeated_get_returns_same_descriptor() {
        let mut cache = ResponseCache::new(1024);
        cache.put("k".into(), descriptor("body"), 4, live());
        let first = cache.get("k").unwrap();
        let second = cache.get("k").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn eviction_under_pressure() {
        // Limit 1000; inserting 600 + 300 + 200 overflows and the tail (the
        // first insert) must go.
        let mut cache = ResponseCache::new(1000);
        cache.put("A".into(), descriptor("a"), 600, live());
        cache.put("B".into(), descriptor("b"), 300, live());
        cache.put("C".into(), descriptor("c"), 200, live());
        assert!(cache.get("A").is_none());
        assert_eq!(cache.total_size(), 500);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("B").is_some());
        assert!(cache.get("C").is_some());
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = ResponseCache::new(1000);
        cache.put("A".into(), descriptor("a"), 400, live());
        cache.put("B".into(), descriptor("b"), 400, live());
        // Touch A so B becomes the tail.
        assert!(cache.get("A").is_some());
        cache.put("C".into(), descriptor("c"), 400, live());
        assert!(cache.get("B").is_none());
        assert!(cache.get("A").is_some());
        assert!(cache.get("C").is_some());
    }

    #[test]
    fn expired_hit_is_removed() {
        let mut cache = ResponseCache::new(1000);
        let expired = Instant::now()
            .checked_sub(Duration::from_millis(1))
            .expect("monotonic clock long past start");
        cache.put("K".into(), descriptor("k"), 100, expired);
        assert_eq!(cache.total_size(), 100);
        assert!(cache.get("K").is_none());
        assert_eq!(cache.total_size(), 0);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn absent_get_leaves_size_unchanged() {
        let mut cache = ResponseCache::new(1000);
        cache.put("K".into(), descriptor("k"), 100, live());
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.total_size(), 100);
    }

    #[test]
    fn update_adjusts_total_size() {
        let mut cache = ResponseCache::new(1000);
        cache.put("K".into(), descriptor("old"), 300, live());
        cache.put("K".into(), descriptor("new"), 120, live());
        assert_eq!(cache.total_size(), 120);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_ignores_expiry_order() {
        let mut cache = ResponseCache::new(500);
        // A expires last but is least recently used, so it is evicted first.
        cache.put(
            "A".into(),
            descriptor("a"),
            300,
            Instant::now() + Duration::from_secs(3600),
        );
        cache.put("B".into(), descriptor("b"), 150, live());
        cache.put("C".into(), descriptor("c"), 150, live());
        assert!(cache.get("A").is_none());
        assert_eq!(cache.total_size(), 300);
    }

    #[test]
    fn zero_limit_never_evicts() {
        let mut cache = ResponseCache::new(0);
        cache.put("A".into(), descriptor("a"), 1 << 20, live());
        cache.put("B".into(), descriptor("b"), 1 << 20, live());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("A").is_some());
    }
}
