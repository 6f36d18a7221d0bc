//! Sharded TTL memo cache for scoring results.
//!
//! Sharded by product id so concurrent alert scans don't contend on one
//! lock. Invalidation is eager on price-history events for the product.

use crate::models::ProductId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const SHARDS: usize = 16;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct ShardedTtlCache<V> {
    shards: Vec<Mutex<HashMap<(ProductId, u32), Entry<V>>>>,
    ttl: Duration,
}

impl<V: Clone> ShardedTtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            ttl,
        }
    }

    fn shard(&self, product_id: &ProductId) -> &Mutex<HashMap<(ProductId, u32), Entry<V>>> {
        let index = (product_id.as_u128() % SHARDS as u128) as usize;
        &self.shards[index]
    }

    pub fn get(&self, product_id: ProductId, lookback_days: u32) -> Option<V> {
        let shard = self.shard(&product_id);
        let mut map = shard.lock();
        match map.get(&(product_id, lookback_days)) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                map.remove(&(product_id, lookback_days));
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, product_id: ProductId, lookback_days: u32, value: V) {
        self.shard(&product_id).lock().insert(
            (product_id, lookback_days),
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry for the product, across all lookbacks.
    pub fn invalidate(&self, product_id: ProductId) {
        self.shard(&product_id)
            .lock()
            .retain(|(pid, _), _| *pid != product_id);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
