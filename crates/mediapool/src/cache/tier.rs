//! Single cache tier: entry map plus policy bookkeeping under one lock

use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::policy::PolicyState;
use crate::config::TierConfig;

/// One cached value with access metadata.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    pub(crate) value: V,
    pub(crate) size: usize,
    pub(crate) created_at: Instant,
    pub(crate) last_access: Instant,
    pub(crate) access_count: u64,
    pub(crate) compressed: bool,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: V, size: usize, compressed: bool) -> Self {
        let now = Instant::now();
        Self {
            value,
            size,
            created_at: now,
            last_access: now,
            access_count: 0,
            compressed,
        }
    }

    /// Reset counters when the entry changes tier so one hot streak cannot
    /// bounce it between tiers forever.
    pub(crate) fn reset_heat(&mut self) {
        self.access_count = 0;
        self.last_access = Instant::now();
    }
}

/// What an insert displaced: an older entry under the same key, and/or a
/// victim evicted to make room.
pub(crate) struct InsertOutcome<K, V> {
    pub(crate) replaced: Option<CacheEntry<V>>,
    pub(crate) evicted: Option<(K, CacheEntry<V>)>,
}

struct TierState<K, V> {
    entries: FxHashMap<K, CacheEntry<V>>,
    policy: PolicyState<K>,
    bytes: usize,
}

/// One bounded tier. All methods take and release the tier lock internally,
/// so callers never hold two tier locks at once.
pub(crate) struct TierCache<K, V> {
    capacity: usize,
    state: Mutex<TierState<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TierCache<K, V> {
    pub(crate) fn new(config: TierConfig) -> Self {
        Self {
            capacity: config.capacity,
            state: Mutex::new(TierState {
                entries: FxHashMap::default(),
                policy: PolicyState::new(config.policy),
                bytes: 0,
            }),
        }
    }

    /// Look up a key, bumping its heat on hit. Returns the value and its
    /// compressed flag.
    pub(crate) fn get(&self, key: &K) -> Option<(V, bool)> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = Instant::now();
        let result = (entry.value.clone(), entry.compressed);
        state.policy.on_access(key);
        Some(result)
    }

    /// Insert an entry, evicting one victim if the tier is full. Surfaces
    /// both the replaced entry and the evicted victim so the owner can keep
    /// its byte accounting straight.
    pub(crate) fn insert(&self, key: K, entry: CacheEntry<V>) -> InsertOutcome<K, V> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        // Replacing an existing key never needs an eviction.
        let replaced = state.entries.remove(&key);
        if let Some(old) = &replaced {
            state.bytes -= old.size;
            state.policy.on_remove(&key);
        }

        let evicted = if state.entries.len() >= self.capacity {
            state.policy.victim(&state.entries).map(|victim| {
                let old = state
                    .entries
                    .remove(&victim)
                    .expect("victim chosen from live entries");
                state.policy.on_remove(&victim);
                state.bytes -= old.size;
                (victim, old)
            })
        } else {
            None
        };

        state.bytes += entry.size;
        state.policy.on_insert(&key);
        state.entries.insert(key, entry);
        InsertOutcome { replaced, evicted }
    }

    pub(crate) fn remove(&self, key: &K) -> Option<CacheEntry<V>> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(key)?;
        state.bytes -= entry.size;
        state.policy.on_remove(key);
        Some(entry)
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

    pub(crate) fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.policy.clear();
        state.bytes = 0;
        dropped
    }

    /// Remove entries created before `now - ttl`.
    pub(crate) fn purge_older_than(&self, ttl: Duration, now: Instant) -> Vec<(K, CacheEntry<V>)> {
        let mut state = self.state.lock();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.created_at) > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                let entry = state.entries.remove(&key)?;
                state.bytes -= entry.size;
                state.policy.on_remove(&key);
                Some((key, entry))
            })
            .collect()
    }

    /// Remove and return entries hot enough to move one tier up.
    pub(crate) fn take_promotion_candidates(&self, threshold: u64) -> Vec<(K, CacheEntry<V>)> {
        let mut state = self.state.lock();
        let hot: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.access_count >= threshold)
            .map(|(key, _)| key.clone())
            .collect();
        hot.into_iter()
            .filter_map(|key| {
                let entry = state.entries.remove(&key)?;
                state.bytes -= entry.size;
                state.policy.on_remove(&key);
                Some((key, entry))
            })
            .collect()
    }

    /// Remove and return entries cold and idle enough to move one tier down.
    pub(crate) fn take_demotion_candidates(
        &self,
        threshold: u64,
        idle: Duration,
        now: Instant,
    ) -> Vec<(K, CacheEntry<V>)> {
        let mut state = self.state.lock();
        let cold: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.access_count <= threshold && now.duration_since(entry.last_access) > idle
            })
            .map(|(key, _)| key.clone())
            .collect();
        cold.into_iter()
            .filter_map(|key| {
                let entry = state.entries.remove(&key)?;
                state.bytes -= entry.size;
                state.policy.on_remove(&key);
                Some((key, entry))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::policy::EvictionPolicy;

    fn tier(capacity: usize, policy: EvictionPolicy) -> TierCache<String, u32> {
        TierCache::new(TierConfig::new(capacity, policy))
    }

    #[test]
    fn insert_at_capacity_evicts_one() {
        let tier = tier(2, EvictionPolicy::Lru);
        assert!(tier.insert("a".into(), CacheEntry::new(1, 10, false)).evicted.is_none());
        assert!(tier.insert("b".into(), CacheEntry::new(2, 10, false)).evicted.is_none());

        let (victim, entry) = tier
            .insert("c".into(), CacheEntry::new(3, 10, false))
            .evicted
            .unwrap();
        assert_eq!(victim, "a");
        assert_eq!(entry.value, 1);
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.bytes(), 20);
    }

    #[test]
    fn replace_does_not_evict() {
        let tier = tier(1, EvictionPolicy::Lru);
        tier.insert("a".into(), CacheEntry::new(1, 10, false));
        let outcome = tier.insert("a".into(), CacheEntry::new(2, 20, false));
        assert!(outcome.evicted.is_none());
        assert_eq!(outcome.replaced.unwrap().size, 10);
        assert_eq!(tier.get(&"a".into()).unwrap().0, 2);
        assert_eq!(tier.bytes(), 20);
    }

    #[test]
    fn purge_respects_ttl() {
        let tier = tier(4, EvictionPolicy::Fifo);
        tier.insert("a".into(), CacheEntry::new(1, 1, false));

        let later = Instant::now() + Duration::from_secs(10);
        let expired = tier.purge_older_than(Duration::from_secs(5), later);
        assert_eq!(expired.len(), 1);
        assert_eq!(tier.len(), 0);

        tier.insert("b".into(), CacheEntry::new(2, 1, false));
        assert!(tier
            .purge_older_than(Duration::from_secs(5), Instant::now())
            .is_empty());
    }

    #[test]
    fn promotion_candidates_need_heat() {
        let tier = tier(4, EvictionPolicy::Lru);
        tier.insert("hot".into(), CacheEntry::new(1, 1, false));
        tier.insert("cold".into(), CacheEntry::new(2, 1, false));
        for _ in 0..3 {
            tier.get(&"hot".into());
        }

        let promoted = tier.take_promotion_candidates(3);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].0, "hot");
        assert!(tier.contains(&"cold".into()));
    }
}
