//! Fixed array of independently locked maps keyed by `u64`.
//!
//! A key lives in shard `key % N`. Every operation takes the lock of that
//! one shard only, so traffic on unrelated keys never contends.

use parking_lot::RwLock;
use std::collections::HashMap;

pub struct ShardedMap<V> {
    shards: Vec<RwLock<HashMap<u64, V>>>,
}

impl<V: Clone> ShardedMap<V> {
    /// Create a map with `shards` partitions (at least one).
    pub fn new(shards: usize) -> Self {
        let n = shards.max(1);
        Self {
            shards: (0..n).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: u64) -> &RwLock<HashMap<u64, V>> {
        // `shards` is never empty and the index is always in range.
        &self.shards[(key % self.shards.len() as u64) as usize]
    }

    /// Insert, returning the value previously stored under `key`.
    pub fn insert(&self, key: u64, value: V) -> Option<V> {
        self.shard(key).write().insert(key, value)
    }

    pub fn get(&self, key: u64) -> Option<V> {
        self.shard(key).read().get(&key).cloned()
    }

    pub fn remove(&self, key: u64) -> Option<V> {
        self.shard(key).write().remove(&key)
    }

    /// Remove `key` only if its current value satisfies `pred`.
    pub fn remove_if(&self, key: u64, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut shard = self.shard(key).write();
        match shard.get(&key) {
            Some(v) if pred(v) => shard.remove(&key),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Copy of every value, taken one shard at a time.
    pub fn values(&self) -> Vec<V> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().values().cloned());
        }
        out
    }
}
