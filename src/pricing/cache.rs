//! Short-lived memoization of price lookups.
//!
//! Fixed-capacity map with least-recently-inserted eviction. Current prices
//! expire after a TTL; historical prices are immutable and never expire.
//! Reads take a read lock; writes are serialized behind the write lock. A
//! miss never blocks other keys.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct TtlCache<K, V> {
    capacity: usize,
    /// None = entries never expire.
    ttl: Option<Duration>,
    inner: RwLock<CacheInner<K, V>>,
}

struct CacheInner<K, V> {
    map: HashMap<K, Entry<V>>,
    /// Insertion order, oldest first; drives eviction on overflow.
    order: VecDeque<K>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: RwLock::new(CacheInner {
                map: HashMap::with_capacity(capacity.max(1)),
                order: VecDeque::with_capacity(capacity.max(1)),
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.read();
        let entry = inner.map.get(key)?;
        if let Some(ttl) = self.ttl {
            if entry.inserted_at.elapsed() >= ttl {
                return None;
            }
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.write();
        if !inner.map.contains_key(&key) {
            while inner.map.len() >= self.capacity {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        inner.map.remove(&oldest);
                    }
                    None => break,
                }
            }
            inner.order.push_back(key.clone());
        }
        inner.map.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries; a periodic background task calls this so the
    /// map does not accumulate dead weight between lookups.
    pub fn purge_expired(&self) {
        let Some(ttl) = self.ttl else { return };
        let mut inner = self.inner.write();
        let now = Instant::now();
        inner
            .map
            .retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
        let map = &inner.map;
        let retained: VecDeque<K> = inner
            .order
            .iter()
            .filter(|k| map.contains_key(k))
            .cloned()
            .collect();
        inner.order = retained;
    }
}
