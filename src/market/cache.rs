use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::trace;

pub const DEFAULT_SWEEP_PROBABILITY: f64 = 0.02;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    payload: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

#[derive(Debug)]
pub struct FreshnessCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    sweep_probability: f64,
}

impl<K, V> Default for FreshnessCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FreshnessCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_sweep_probability(DEFAULT_SWEEP_PROBABILITY)
    }

    pub fn with_sweep_probability(sweep_probability: f64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            sweep_probability: sweep_probability.clamp(0.0, 1.0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: K, payload: V, ttl: Duration) {
        self.put_at(key, payload, ttl, Instant::now());
    }

    pub fn put_at(&self, key: K, payload: V, ttl: Duration, now: Instant) {
        self.entries.lock().insert(
            key,
            CacheEntry {
                payload,
                stored_at: now,
                ttl,
            },
        );
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        before - entries.len()
    }

    /// Runs a full sweep with the configured probability. Returns the number
    /// of evicted entries (zero when the sweep was skipped).
    pub fn maybe_sweep(&self) -> usize {
        if self.sweep_probability <= 0.0 || !rand::thread_rng().gen_bool(self.sweep_probability) {
            return 0;
        }
        let evicted = self.sweep_at(Instant::now());
        if evicted > 0 {
            trace!(evicted, "swept expired cache entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
