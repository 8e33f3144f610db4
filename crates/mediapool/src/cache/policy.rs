//! Eviction policy bookkeeping
//!
//! Each tier owns one policy state updated on insert, access, and removal.
//! Victim selection is O(1) for LRU/LFU/FIFO; Random and TTL scan the entry
//! map, which is acceptable at tier capacities.

use std::collections::VecDeque;
use std::hash::Hash;

use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::cache::tier::CacheEntry;

/// Victim selection strategy for a full tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
    Random,
    Ttl,
}

pub(crate) enum PolicyState<K> {
    /// Front is most recently used; victims come off the back.
    Lru { order: VecDeque<K> },
    /// Frequency buckets with a min-frequency pointer.
    Lfu {
        freqs: FxHashMap<K, u64>,
        buckets: FxHashMap<u64, VecDeque<K>>,
        min_freq: u64,
    },
    /// Insertion order; victims come off the front.
    Fifo { order: VecDeque<K> },
    Random,
    /// Victim is the oldest entry by creation time.
    Ttl,
}

impl<K: Eq + Hash + Clone> PolicyState<K> {
    pub(crate) fn new(policy: EvictionPolicy) -> Self {
        match policy {
            EvictionPolicy::Lru => Self::Lru {
                order: VecDeque::new(),
            },
            EvictionPolicy::Lfu => Self::Lfu {
                freqs: FxHashMap::default(),
                buckets: FxHashMap::default(),
                min_freq: 0,
            },
            EvictionPolicy::Fifo => Self::Fifo {
                order: VecDeque::new(),
            },
            EvictionPolicy::Random => Self::Random,
            EvictionPolicy::Ttl => Self::Ttl,
        }
    }

    pub(crate) fn on_insert(&mut self, key: &K) {
        match self {
            Self::Lru { order } => order.push_front(key.clone()),
            Self::Lfu {
                freqs,
                buckets,
                min_freq,
            } => {
                freqs.insert(key.clone(), 1);
                buckets.entry(1).or_default().push_back(key.clone());
                *min_freq = 1;
            }
            Self::Fifo { order } => order.push_back(key.clone()),
            Self::Random | Self::Ttl => {}
        }
    }

    pub(crate) fn on_access(&mut self, key: &K) {
        match self {
            Self::Lru { order } => {
                if let Some(pos) = order.iter().position(|k| k == key) {
                    let k = order.remove(pos).expect("position just found");
                    order.push_front(k);
                }
            }
            Self::Lfu {
                freqs,
                buckets,
                min_freq,
            } => {
                let Some(freq) = freqs.get_mut(key) else {
                    return;
                };
                let old = *freq;
                *freq += 1;
                if let Some(bucket) = buckets.get_mut(&old) {
                    if let Some(pos) = bucket.iter().position(|k| k == key) {
                        bucket.remove(pos);
                    }
                    if bucket.is_empty() {
                        buckets.remove(&old);
                        if *min_freq == old {
                            *min_freq = old + 1;
                        }
                    }
                }
                buckets.entry(old + 1).or_default().push_back(key.clone());
            }
            Self::Fifo { .. } | Self::Random | Self::Ttl => {}
        }
    }

    pub(crate) fn on_remove(&mut self, key: &K) {
        match self {
            Self::Lru { order } | Self::Fifo { order } => {
                if let Some(pos) = order.iter().position(|k| k == key) {
                    order.remove(pos);
                }
            }
            Self::Lfu { freqs, buckets, .. } => {
                if let Some(freq) = freqs.remove(key) {
                    if let Some(bucket) = buckets.get_mut(&freq) {
                        if let Some(pos) = bucket.iter().position(|k| k == key) {
                            bucket.remove(pos);
                        }
                        if bucket.is_empty() {
                            buckets.remove(&freq);
                        }
                    }
                }
                // min_freq may now point at an empty bucket; victim() rescans.
            }
            Self::Random | Self::Ttl => {}
        }
    }

    /// Pick the key to evict. Does not remove bookkeeping; the caller follows
    /// up with `on_remove`.
    pub(crate) fn victim<V>(&mut self, entries: &FxHashMap<K, CacheEntry<V>>) -> Option<K> {
        match self {
            Self::Lru { order } => order.back().cloned(),
            Self::Lfu {
                buckets, min_freq, ..
            } => {
                if buckets.is_empty() {
                    return None;
                }
                // Walk up from min_freq to the first non-empty bucket.
                let mut freq = *min_freq;
                loop {
                    if let Some(bucket) = buckets.get(&freq) {
                        if let Some(key) = bucket.front() {
                            *min_freq = freq;
                            return Some(key.clone());
                        }
                    }
                    freq += 1;
                    if freq > *min_freq + entries.len() as u64 + 1 {
                        // Bookkeeping lost track; fall back to any key.
                        return entries.keys().next().cloned();
                    }
                }
            }
            Self::Fifo { order } => order.front().cloned(),
            Self::Random => {
                if entries.is_empty() {
                    return None;
                }
                let pick = rand::thread_rng().gen_range(0..entries.len());
                entries.keys().nth(pick).cloned()
            }
            Self::Ttl => entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone()),
        }
    }

    pub(crate) fn clear(&mut self) {
        match self {
            Self::Lru { order } | Self::Fifo { order } => order.clear(),
            Self::Lfu {
                freqs,
                buckets,
                min_freq,
            } => {
                freqs.clear();
                buckets.clear();
                *min_freq = 0;
            }
            Self::Random | Self::Ttl => {}
        }
    }
}
