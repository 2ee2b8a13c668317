// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A process wide TTL cache keyed by request correlation ids.
//!
//! Two instances bridge the inbound and outbound legs of a proxied request:
//! one maps request-id to the tracing span context extracted on the inbound
//! side, the other maps request-id to the routing value the caller supplied.
//! Values are cloned out on read so readers never observe later mutation.

use ahash::RandomState;
use std::hash::Hash;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use tinyufo::TinyUfo;

#[derive(Debug, Clone)]
struct Node<T: Clone> {
    value: T,
    expire_on: Option<Instant>,
}

impl<T: Clone> Node<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        let expire_on = match ttl {
            Some(t) => Instant::now().checked_add(t),
            None => None,
        };
        Node { value, expire_on }
    }

    fn is_expired(&self) -> bool {
        match self.expire_on.as_ref() {
            Some(t) => t <= &Instant::now(),
            None => false,
        }
    }
}

/// An in-memory cache with TTL eviction on read, bounded by an S3-FIFO store.
pub struct TtlCache<K: Hash, T: Clone> {
    store: TinyUfo<u64, Node<T>>,
    default_ttl: Duration,
    hasher: RandomState,
    _key_type: PhantomData<K>,
}

impl<K: Hash, T: Clone + Send + Sync + 'static> TtlCache<K, T> {
    /// Create a new [TtlCache] with the given capacity and the TTL applied by
    /// [Self::put()].
    pub fn new(size: usize, default_ttl: Duration) -> Self {
        TtlCache {
            store: TinyUfo::new(size, size),
            default_ttl,
            hasher: RandomState::new(),
            _key_type: PhantomData,
        }
    }

    /// Fetch the key and return a copy of the value if it is present and not
    /// yet expired.
    pub fn get(&self, key: &K) -> Option<T> {
        let hashed_key = self.hasher.hash_one(key);

        self.store
            .get(&hashed_key)
            .and_then(|n| (!n.is_expired()).then(|| n.value))
    }

    /// Insert a key and value pair with the cache's default TTL.
    pub fn put(&self, key: &K, value: T) {
        self.put_with_ttl(key, value, Some(self.default_ttl))
    }

    /// Insert a key and value pair with an explicit TTL, `None` meaning the
    /// entry never expires by time (it can still be evicted by capacity).
    ///
    /// An item with a TTL of zero will not be inserted.
    pub fn put_with_ttl(&self, key: &K, value: T, ttl: Option<Duration>) {
        if let Some(t) = ttl {
            if t.is_zero() {
                return;
            }
        }
        let hashed_key = self.hasher.hash_one(key);
        let node = Node::new(value, ttl);
        // weight is always 1 for now
        self.store.put(hashed_key, node, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_get_miss() {
        let cache: TtlCache<i32, ()> = TtlCache::new(10, Duration::from_secs(1));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_put_get() {
        let cache: TtlCache<i32, i32> = TtlCache::new(10, Duration::from_secs(10));
        assert_eq!(cache.get(&1), None);
        cache.put(&1, 2);
        assert_eq!(cache.get(&1), Some(2));
    }

    #[test]
    fn test_get_expired() {
        let cache: TtlCache<i32, i32> = TtlCache::new(10, Duration::from_millis(100));
        cache.put(&1, 2);
        assert_eq!(cache.get(&1), Some(2));
        sleep(Duration::from_millis(150));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_no_expire() {
        let cache: TtlCache<i32, i32> = TtlCache::new(10, Duration::from_millis(100));
        cache.put_with_ttl(&1, 2, None);
        sleep(Duration::from_millis(150));
        assert_eq!(cache.get(&1), Some(2));
    }

    #[test]
    fn test_eviction() {
        let cache: TtlCache<i32, i32> = TtlCache::new(2, Duration::from_secs(10));
        cache.put(&1, 2);
        cache.put(&2, 4);
        cache.put(&3, 6);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(4));
        assert_eq!(cache.get(&3), Some(6));
    }
}
