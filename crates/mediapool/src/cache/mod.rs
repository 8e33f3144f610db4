//! Three-tier media cache with per-tier eviction policies
//!
//! L1 is small and hot, L2 mid-sized, L3 large and cold. Lookups scan
//! L1 then L2 then L3. Evicted victims cascade one tier down instead of
//! being dropped; a maintenance pass promotes hot entries, demotes idle
//! ones, and purges expired entries. Values entering L3 can pass through
//! an optional compression codec.

mod policy;
mod tier;

pub use policy::EvictionPolicy;

use std::fmt::Write as _;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::MemoryResult;
use crate::stats::{format_bytes, CacheStats, CacheStatsSnapshot};

use tier::{CacheEntry, TierCache};

/// Cache levels, hottest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    L1,
    L2,
    L3,
}

impl Tier {
    pub const ALL: [Self; 3] = [Self::L1, Self::L2, Self::L3];

    fn index(self) -> usize {
        match self {
            Self::L1 => 0,
            Self::L2 => 1,
            Self::L3 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
        }
    }
}

type CodecFn<V> = Arc<dyn Fn(&V) -> V + Send + Sync>;

/// Optional transform applied to values entering and leaving the cold tier.
#[derive(Clone)]
pub struct TierCodec<V> {
    pub compress: CodecFn<V>,
    pub decompress: CodecFn<V>,
}

struct CacheInner<K, V> {
    config: CacheConfig,
    tiers: [TierCache<K, V>; 3],
    stats: CacheStats,
    codec: Option<TierCodec<V>>,
    shutdown: AtomicBool,
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

impl<K: Eq + Hash + Clone, V: Clone> CacheInner<K, V> {
    /// Insert at `tier`, cascading evicted victims downward. Tier locks are
    /// taken one at a time in L1 -> L2 -> L3 order. Returns true when the
    /// insert displaced something: an older entry under the same key, or a
    /// victim pushed out of the cache entirely.
    fn insert_cascading(&self, tier: Tier, key: K, entry: CacheEntry<V>) -> bool {
        let mut displaced = false;
        let mut idx = tier.index();
        let mut item = Some((key, entry));
        while let Some((k, e)) = item.take() {
            let e = self.maybe_compress(idx, e);
            let outcome = self.tiers[idx].insert(k, e);
            if let Some(old) = outcome.replaced {
                // Overwritten in place: the old copy's bytes leave the cache.
                self.stats
                    .current_bytes
                    .fetch_sub(old.size, Ordering::Relaxed);
                displaced = true;
            }
            if let Some((victim_key, mut victim)) = outcome.evicted {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                if self.config.demote_on_evict && idx + 1 < 3 {
                    self.stats.demotions.fetch_add(1, Ordering::Relaxed);
                    victim.reset_heat();
                    idx += 1;
                    item = Some((victim_key, victim));
                } else {
                    self.stats
                        .current_bytes
                        .fetch_sub(victim.size, Ordering::Relaxed);
                    displaced = true;
                }
            }
        }
        displaced
    }

    fn maybe_compress(&self, tier_idx: usize, mut entry: CacheEntry<V>) -> CacheEntry<V> {
        if tier_idx == Tier::L3.index() && !entry.compressed {
            if let Some(codec) = &self.codec {
                entry.value = (codec.compress)(&entry.value);
                entry.compressed = true;
            }
        }
        entry
    }

    fn maybe_decompress(&self, value: V, compressed: bool) -> V {
        if compressed {
            if let Some(codec) = &self.codec {
                return (codec.decompress)(&value);
            }
        }
        value
    }

    fn run_maintenance(&self) {
        let now = Instant::now();

        // Expire by TTL first so stale entries never migrate.
        if let Some(ttl) = self.config.ttl {
            for tier in &self.tiers {
                for (_, entry) in tier.purge_older_than(ttl, now) {
                    self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .current_bytes
                        .fetch_sub(entry.size, Ordering::Relaxed);
                }
            }
        }

        // Promote hot entries upward, coldest tier first so an entry climbs
        // one level per pass.
        for (from, to) in [(Tier::L3, Tier::L2), (Tier::L2, Tier::L1)] {
            let hot = self.tiers[from.index()]
                .take_promotion_candidates(self.config.promote_threshold);
            for (key, mut entry) in hot {
                self.stats.promotions.fetch_add(1, Ordering::Relaxed);
                entry.reset_heat();
                entry = self.decompress_entry(entry);
                self.insert_cascading(to, key, entry);
            }
        }

        // Demote idle entries downward, coldest pair first so an entry just
        // demoted into L2 is not rescanned in the same pass.
        for (from, to) in [(Tier::L2, Tier::L3), (Tier::L1, Tier::L2)] {
            let cold = self.tiers[from.index()].take_demotion_candidates(
                self.config.demote_threshold,
                self.config.demote_idle,
                now,
            );
            for (key, mut entry) in cold {
                self.stats.demotions.fetch_add(1, Ordering::Relaxed);
                entry.reset_heat();
                self.insert_cascading(to, key, entry);
            }
        }
    }

    /// Undo L3 compression when an entry moves back to a warm tier.
    fn decompress_entry(&self, mut entry: CacheEntry<V>) -> CacheEntry<V> {
        if entry.compressed {
            if let Some(codec) = &self.codec {
                entry.value = (codec.decompress)(&entry.value);
                entry.compressed = false;
            }
        }
        entry
    }
}

/// Three-tier cache front end.
pub struct CacheManager<K, V> {
    inner: Arc<CacheInner<K, V>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> CacheManager<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> MemoryResult<Self> {
        Self::build(config, None)
    }

    /// Cache whose L3 values pass through `codec`.
    pub fn with_codec(config: CacheConfig, codec: TierCodec<V>) -> MemoryResult<Self> {
        Self::build(config, Some(codec))
    }

    fn build(config: CacheConfig, codec: Option<TierCodec<V>>) -> MemoryResult<Self> {
        config.validate()?;
        info!(
            l1 = config.l1.capacity,
            l2 = config.l2.capacity,
            l3 = config.l3.capacity,
            "cache manager starting"
        );
        let tiers = [
            TierCache::new(config.l1),
            TierCache::new(config.l2),
            TierCache::new(config.l3),
        ];
        let inner = Arc::new(CacheInner {
            config,
            tiers,
            stats: CacheStats::default(),
            codec,
            shutdown: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        });

        let worker = inner.config.maintenance_interval.map(|interval| {
            let shared = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("cache-maintenance".into())
                .spawn(move || {
                    loop {
                        {
                            let mut guard = shared.wakeup_lock.lock();
                            shared.wakeup.wait_for(&mut guard, interval);
                        }
                        if shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        shared.run_maintenance();
                    }
                })
                .expect("spawn cache maintenance worker")
        });

        Ok(Self {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Look up a key across the tiers, hottest first.
    pub fn get(&self, key: &K) -> Option<V> {
        for tier in Tier::ALL {
            if let Some((value, compressed)) = self.inner.tiers[tier.index()].get(key) {
                match tier {
                    Tier::L1 => self.inner.stats.l1_hits.fetch_add(1, Ordering::Relaxed),
                    Tier::L2 => self.inner.stats.l2_hits.fetch_add(1, Ordering::Relaxed),
                    Tier::L3 => self.inner.stats.l3_hits.fetch_add(1, Ordering::Relaxed),
                };
                return Some(self.inner.maybe_decompress(value, compressed));
            }
        }
        self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert into L1. Returns true when the insert displaced an existing
    /// copy of the key or pushed some entry out of the cache.
    pub fn put(&self, key: K, value: V, size: usize) -> bool {
        self.put_in(Tier::L1, key, value, size)
    }

    /// Insert directly into a chosen tier.
    pub fn put_in(&self, tier: Tier, key: K, value: V, size: usize) -> bool {
        // Drop stale copies in the other tiers so a key lives in exactly one.
        let mut displaced = false;
        for other in Tier::ALL {
            if other != tier {
                if let Some(old) = self.inner.tiers[other.index()].remove(&key) {
                    self.inner
                        .stats
                        .current_bytes
                        .fetch_sub(old.size, Ordering::Relaxed);
                    displaced = true;
                }
            }
        }
        self.inner.stats.current_bytes.fetch_add(size, Ordering::Relaxed);
        let cascaded = self
            .inner
            .insert_cascading(tier, key, CacheEntry::new(value, size, false));
        displaced || cascaded
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut removed = false;
        for tier in Tier::ALL {
            if let Some(entry) = self.inner.tiers[tier.index()].remove(key) {
                self.inner
                    .stats
                    .current_bytes
                    .fetch_sub(entry.size, Ordering::Relaxed);
                removed = true;
            }
        }
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        Tier::ALL
            .iter()
            .any(|tier| self.inner.tiers[tier.index()].contains(key))
    }

    /// Entry counts per tier, L1 first.
    pub fn sizes(&self) -> [usize; 3] {
        [
            self.inner.tiers[0].len(),
            self.inner.tiers[1].len(),
            self.inner.tiers[2].len(),
        ]
    }

    pub fn clear(&self) {
        for tier in Tier::ALL {
            let dropped = self.inner.tiers[tier.index()].clear();
            debug!(tier = tier.name(), dropped, "cleared cache tier");
        }
        self.inner.stats.current_bytes.store(0, Ordering::Relaxed);
    }

    /// Load keys into the cold tier ahead of demand. The loader returning
    /// `None` counts as a prefetch miss.
    pub fn prefetch<I>(&self, keys: I, loader: impl Fn(&K) -> Option<(V, usize)>)
    where
        I: IntoIterator<Item = K>,
    {
        for key in keys {
            if self.contains(&key) {
                continue;
            }
            match loader(&key) {
                Some((value, size)) => {
                    self.inner
                        .stats
                        .prefetch_hits
                        .fetch_add(1, Ordering::Relaxed);
                    self.put_in(Tier::L3, key, value, size);
                }
                None => {
                    self.inner
                        .stats
                        .prefetch_misses
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Run one maintenance pass synchronously: TTL purge, promotions,
    /// demotions. The background worker calls this on its own schedule.
    pub fn run_maintenance(&self) {
        self.inner.run_maintenance();
    }

    pub fn statistics(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn report(&self) -> String {
        let stats = self.statistics();
        let sizes = self.sizes();
        let mut out = String::new();
        let _ = writeln!(out, "tiered cache");
        for (tier, len) in Tier::ALL.iter().zip(sizes) {
            let _ = writeln!(
                out,
                "  {}: {} entries ({})",
                tier.name(),
                len,
                format_bytes(self.inner.tiers[tier.index()].bytes()),
            );
        }
        let _ = writeln!(
            out,
            "  hits: {} (L1 {}, L2 {}, L3 {}), misses: {}, hit rate {:.1}%",
            stats.total_hits(),
            stats.l1_hits,
            stats.l2_hits,
            stats.l3_hits,
            stats.misses,
            stats.hit_rate() * 100.0
        );
        let _ = writeln!(
            out,
            "  evictions: {}, promotions: {}, demotions: {}, expirations: {}",
            stats.evictions, stats.promotions, stats.demotions, stats.expirations
        );
        out
    }

    /// Stop the maintenance worker and drop every entry.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.clear();
    }
}

impl<K, V> Drop for CacheManager<K, V> {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;
    use std::time::Duration;

    fn small_config() -> CacheConfig {
        CacheConfig {
            l1: TierConfig::new(2, EvictionPolicy::Lru),
            l2: TierConfig::new(4, EvictionPolicy::Lfu),
            l3: TierConfig::new(8, EvictionPolicy::Fifo),
            ttl: None,
            maintenance_interval: None,
            ..CacheConfig::default()
        }
    }

    fn cache() -> CacheManager<String, Vec<u8>> {
        CacheManager::new(small_config()).unwrap()
    }

    #[test]
    fn eviction_demotes_into_next_tier() {
        let cache = cache();
        cache.put("a".into(), vec![1], 1);
        cache.put("b".into(), vec![2], 1);
        cache.put("c".into(), vec![3], 1);

        // L1 holds 2; "a" was least recent and moved down to L2.
        assert_eq!(cache.sizes(), [2, 1, 0]);
        assert_eq!(cache.get(&"a".into()), Some(vec![1]));
        assert_eq!(cache.statistics().l2_hits, 1);
        assert_eq!(cache.statistics().demotions, 1);
    }

    #[test]
    fn miss_is_counted() {
        let cache = cache();
        assert!(cache.get(&"nope".into()).is_none());
        let stats = cache.statistics();
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate()).abs() < f64::EPSILON);
    }

    #[test]
    fn hit_rate_formula() {
        let cache = cache();
        cache.put("a".into(), vec![1], 1);
        cache.get(&"a".into());
        cache.get(&"a".into());
        cache.get(&"miss".into());
        let stats = cache.statistics();
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn maintenance_promotes_hot_entries() {
        let cache = cache();
        cache.put_in(Tier::L3, "hot".into(), vec![9], 1);
        for _ in 0..3 {
            cache.get(&"hot".into());
        }
        cache.run_maintenance();
        assert_eq!(cache.sizes()[1], 1);
        assert_eq!(cache.statistics().promotions, 1);

        // Another hot streak climbs to L1.
        for _ in 0..3 {
            cache.get(&"hot".into());
        }
        cache.run_maintenance();
        assert_eq!(cache.sizes()[0], 1);
    }

    #[test]
    fn maintenance_demotes_idle_entries() {
        let config = CacheConfig {
            demote_idle: Duration::ZERO,
            ..small_config()
        };
        let cache: CacheManager<String, Vec<u8>> = CacheManager::new(config).unwrap();
        cache.put("cold".into(), vec![1], 1);
        std::thread::sleep(Duration::from_millis(5));
        cache.run_maintenance();
        assert_eq!(cache.sizes(), [0, 1, 0]);
    }

    #[test]
    fn ttl_purges_old_entries() {
        let config = CacheConfig {
            ttl: Some(Duration::from_millis(10)),
            ..small_config()
        };
        let cache: CacheManager<String, Vec<u8>> = CacheManager::new(config).unwrap();
        cache.put("stale".into(), vec![1], 1);
        std::thread::sleep(Duration::from_millis(30));
        cache.run_maintenance();
        assert!(!cache.contains(&"stale".into()));
        assert_eq!(cache.statistics().expirations, 1);
    }

    #[test]
    fn codec_round_trips_cold_values() {
        let codec = TierCodec {
            compress: Arc::new(|v: &Vec<u8>| v.iter().map(|b| b ^ 0xFF).collect()),
            decompress: Arc::new(|v: &Vec<u8>| v.iter().map(|b| b ^ 0xFF).collect()),
        };
        let cache: CacheManager<String, Vec<u8>> =
            CacheManager::with_codec(small_config(), codec).unwrap();
        cache.put_in(Tier::L3, "k".into(), vec![1, 2, 3], 3);
        assert_eq!(cache.get(&"k".into()), Some(vec![1, 2, 3]));
    }

    #[test]
    fn prefetch_loads_into_cold_tier() {
        let cache = cache();
        cache.put("present".into(), vec![0], 1);
        cache.prefetch(
            vec!["present".into(), "new".into(), "missing".into()],
            |key: &String| {
                if key == "new" {
                    Some((vec![7], 1))
                } else {
                    None
                }
            },
        );
        assert_eq!(cache.sizes()[2], 1);
        let stats = cache.statistics();
        assert_eq!(stats.prefetch_hits, 1);
        assert_eq!(stats.prefetch_misses, 1);
    }

    #[test]
    fn remove_and_clear() {
        let cache = cache();
        cache.put("a".into(), vec![1], 4);
        assert!(cache.remove(&"a".into()));
        assert!(!cache.remove(&"a".into()));
        assert_eq!(cache.statistics().current_bytes, 0);

        cache.put("b".into(), vec![2], 4);
        cache.clear();
        assert_eq!(cache.sizes(), [0, 0, 0]);
    }
}
