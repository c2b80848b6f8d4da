//! Bounded least-recently-used caches with per-key single-flight loading.
//!
//! Each cache owns a back-end that knows how to fetch a missing entry from
//! the image file.  Loaded values are immutable and shared via `Arc`, so
//! readers may hold them across unrelated cache operations.
//!
//! A miss registers an in-flight marker under the key, performs the load
//! without holding the map lock, then completes the entry and wakes any
//! waiters.  Concurrent requests for the same key block on a condition
//! variable instead of loading twice, so each miss causes at most one
//! physical fetch.  If a load fails, its marker is removed and woken waiters
//! retry the load once themselves; their own failure is returned without
//! further retries.

use crate::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// What a cache uses to materialize missing entries.
pub(crate) trait LruCacheBackend {
    /// Key type; uniquely identifies an entry.
    type Key: Copy + Debug + Eq + Hash + Send + Sync;

    /// Type of the cached objects.
    type Value: Send + Sync;

    /// Additional context a load needs beyond the key.
    type Request;

    /// Fetch and decode the entry for `key`.
    fn load(&self, key: Self::Key, request: &Self::Request) -> Result<Self::Value>;
}

/// State of one cache slot.
enum Slot<V> {
    /// Some reader is currently loading this entry.
    Loading,

    /// Completed entry.
    Ready {
        /// The loaded value, shared with readers.
        value: Arc<V>,

        /// Tick of the most recent access.
        last_used: u64,
    },
}

/// Map and LRU clock, guarded by one mutex.
struct CacheMap<K, V> {
    /// Cache slots.
    map: HashMap<K, Slot<V>>,

    /// Access clock; bumped on every hit and insert.
    tick: u64,
}

/// Least-recently-used cache with single-flight loading.
pub(crate) struct LruCache<B: LruCacheBackend> {
    /// Fetches entries on a miss.
    backend: B,

    /// Slots and clock.
    state: Mutex<CacheMap<B::Key, B::Value>>,

    /// Signalled whenever a load completes (successfully or not).
    loaded: Condvar,

    /// At most this many completed entries are kept.
    limit: usize,
}

impl<B: LruCacheBackend> LruCache<B> {
    /// Create a new cache holding up to `limit` entries.
    pub fn new(backend: B, limit: usize) -> Self {
        LruCache {
            backend,
            state: Mutex::new(CacheMap {
                map: HashMap::new(),
                tick: 0,
            }),
            loaded: Condvar::new(),
            limit: limit.max(1),
        }
    }

    /// Retrieve an entry from the cache, loading it on a miss.
    ///
    /// `request` carries whatever the back-end needs to perform the load; it
    /// is ignored on a hit.
    pub fn get_or_insert(&self, key: B::Key, request: &B::Request) -> Result<Arc<B::Value>> {
        let mut state = self.state.lock();
        loop {
            let s = &mut *state;
            match s.map.get_mut(&key) {
                Some(Slot::Ready { value, last_used }) => {
                    s.tick += 1;
                    *last_used = s.tick;
                    return Ok(Arc::clone(value));
                }

                Some(Slot::Loading) => {
                    // Wait for the in-flight load; the next loop iteration
                    // sees either the completed entry or, if the load
                    // failed, an empty slot to retry with.
                    self.loaded.wait(&mut state);
                }

                None => {
                    s.map.insert(key, Slot::Loading);
                    drop(state);

                    let result = self.backend.load(key, request);

                    let mut state = self.state.lock();
                    return match result {
                        Ok(value) => {
                            let value = Arc::new(value);
                            Self::evict_down_to(&mut state, self.limit - 1);
                            state.tick += 1;
                            let last_used = state.tick;
                            state.map.insert(
                                key,
                                Slot::Ready {
                                    value: Arc::clone(&value),
                                    last_used,
                                },
                            );
                            self.loaded.notify_all();
                            Ok(value)
                        }
                        Err(err) => {
                            state.map.remove(&key);
                            self.loaded.notify_all();
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Evict least-recently-used completed entries until at most `target`
    /// remain.
    ///
    /// In-flight markers are never evicted.  Values still shared with
    /// readers stay alive through their `Arc`s; eviction only drops the
    /// cache's own reference.
    fn evict_down_to(state: &mut CacheMap<B::Key, B::Value>, target: usize) {
        loop {
            let ready = state
                .map
                .values()
                .filter(|slot| matches!(slot, Slot::Ready { .. }))
                .count();
            if ready <= target {
                return;
            }

            let oldest = state
                .map
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready { last_used, .. } => Some((*last_used, *key)),
                    Slot::Loading => None,
                })
                .min_by_key(|(last_used, _)| *last_used);

            // `ready > target >= 0` guarantees at least one candidate.
            if let Some((_, key)) = oldest {
                state.map.remove(&key);
            } else {
                return;
            }
        }
    }
}
