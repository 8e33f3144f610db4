//! Tiered cache tests
//!
//! Tier scan order, eviction cascade, promotion/demotion maintenance,
//! TTL expiry, policy behavior, and the cold-tier codec.

use mediapool::{CacheConfig, CacheManager, EvictionPolicy, Tier, TierCodec, TierConfig};
use pretty_assertions::assert_eq;
use rstest::*;
use std::sync::Arc;
use std::time::Duration;

fn config() -> CacheConfig {
    CacheConfig {
        l1: TierConfig::new(2, EvictionPolicy::Lru),
        l2: TierConfig::new(4, EvictionPolicy::Lfu),
        l3: TierConfig::new(8, EvictionPolicy::Fifo),
        ttl: None,
        maintenance_interval: None,
        ..CacheConfig::default()
    }
}

#[fixture]
fn cache() -> CacheManager<String, Vec<u8>> {
    CacheManager::new(config()).expect("config is valid")
}

fn gop(n: usize) -> (String, Vec<u8>) {
    (format!("gop-{n}"), vec![n as u8; 16])
}

#[rstest]
fn l1_overflow_lands_in_l2(cache: CacheManager<String, Vec<u8>>) {
    for n in 0..3 {
        let (key, value) = gop(n);
        cache.put(key, value, 16);
    }

    // L1 capacity is 2; the least recently used entry moved to L2.
    assert_eq!(cache.sizes(), [2, 1, 0]);
    assert_eq!(cache.get(&"gop-0".to_string()), Some(vec![0u8; 16]));

    let stats = cache.statistics();
    assert_eq!(stats.l2_hits, 1);
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.demotions, 1);
}

#[rstest]
fn cascade_reaches_l3_and_then_drops(cache: CacheManager<String, Vec<u8>>) {
    // 2 + 4 + 8 entries fill the tiers exactly; one more pushes a victim
    // out of L3 entirely.
    for n in 0..14 {
        let (key, value) = gop(n);
        cache.put(key, value, 16);
    }
    assert_eq!(cache.sizes(), [2, 4, 8]);
    assert_eq!(cache.statistics().current_bytes, 14 * 16);

    cache.put("gop-14".to_string(), vec![0; 16], 16);
    assert_eq!(cache.sizes(), [2, 4, 8]);
    assert_eq!(cache.statistics().current_bytes, 14 * 16);
    assert!(!cache.contains(&"gop-0".to_string()));
}

#[rstest]
fn hit_rate_counts_all_tiers(cache: CacheManager<String, Vec<u8>>) {
    cache.put("a".to_string(), vec![1], 1);
    cache.put_in(Tier::L3, "z".to_string(), vec![9], 1);

    assert!(cache.get(&"a".to_string()).is_some());
    assert!(cache.get(&"z".to_string()).is_some());
    assert!(cache.get(&"missing".to_string()).is_none());

    let stats = cache.statistics();
    assert_eq!(stats.l1_hits, 1);
    assert_eq!(stats.l3_hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
}

#[rstest]
fn hot_entries_climb_one_tier_per_pass(cache: CacheManager<String, Vec<u8>>) {
    cache.put_in(Tier::L3, "hot".to_string(), vec![7], 1);
    for _ in 0..3 {
        cache.get(&"hot".to_string());
    }
    cache.run_maintenance();
    assert_eq!(cache.sizes(), [0, 1, 0]);

    for _ in 0..3 {
        cache.get(&"hot".to_string());
    }
    cache.run_maintenance();
    assert_eq!(cache.sizes(), [1, 0, 0]);
    assert_eq!(cache.statistics().promotions, 2);
}

#[rstest]
fn idle_entries_sink() {
    let cache: CacheManager<String, Vec<u8>> = CacheManager::new(CacheConfig {
        demote_idle: Duration::from_millis(1),
        ..config()
    })
    .unwrap();
    cache.put("idle".to_string(), vec![1], 1);
    std::thread::sleep(Duration::from_millis(10));

    cache.run_maintenance();
    assert_eq!(cache.sizes(), [0, 1, 0]);

    // Heat resets on demotion, so the entry must go idle again before it
    // sinks further.
    std::thread::sleep(Duration::from_millis(10));
    cache.run_maintenance();
    assert_eq!(cache.sizes(), [0, 0, 1]);
}

#[rstest]
fn expired_entries_are_purged() {
    let cache: CacheManager<String, Vec<u8>> = CacheManager::new(CacheConfig {
        ttl: Some(Duration::from_millis(10)),
        ..config()
    })
    .unwrap();
    cache.put("old".to_string(), vec![1], 1);
    std::thread::sleep(Duration::from_millis(30));
    cache.put("new".to_string(), vec![2], 1);

    cache.run_maintenance();
    assert!(!cache.contains(&"old".to_string()));
    assert!(cache.contains(&"new".to_string()));
    assert_eq!(cache.statistics().expirations, 1);
}

#[rstest]
fn lfu_tier_keeps_frequent_entries() {
    let cache: CacheManager<String, Vec<u8>> = CacheManager::new(CacheConfig {
        l1: TierConfig::new(2, EvictionPolicy::Lfu),
        demote_on_evict: false,
        ..config()
    })
    .unwrap();
    cache.put("popular".to_string(), vec![1], 1);
    cache.put("one-hit".to_string(), vec![2], 1);
    for _ in 0..5 {
        cache.get(&"popular".to_string());
    }

    cache.put("newcomer".to_string(), vec![3], 1);
    assert!(cache.contains(&"popular".to_string()));
    assert!(!cache.contains(&"one-hit".to_string()));
}

#[rstest]
fn codec_only_touches_the_cold_tier() {
    let compressions = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count = Arc::clone(&compressions);
    let codec = TierCodec {
        compress: Arc::new(move |v: &Vec<u8>| {
            count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            v.iter().rev().copied().collect()
        }),
        decompress: Arc::new(|v: &Vec<u8>| v.iter().rev().copied().collect()),
    };
    let cache: CacheManager<String, Vec<u8>> =
        CacheManager::with_codec(config(), codec).unwrap();

    cache.put("warm".to_string(), vec![1, 2, 3], 3);
    assert_eq!(compressions.load(std::sync::atomic::Ordering::Relaxed), 0);

    cache.put_in(Tier::L3, "cold".to_string(), vec![4, 5, 6], 3);
    assert_eq!(compressions.load(std::sync::atomic::Ordering::Relaxed), 1);
    // Reads decompress transparently.
    assert_eq!(cache.get(&"cold".to_string()), Some(vec![4, 5, 6]));
}

#[rstest]
fn put_replaces_across_tiers(cache: CacheManager<String, Vec<u8>>) {
    cache.put_in(Tier::L3, "k".to_string(), vec![1], 1);
    cache.put("k".to_string(), vec![2], 1);

    let live: usize = cache.sizes().iter().sum();
    assert_eq!(live, 1);
    assert_eq!(cache.get(&"k".to_string()), Some(vec![2]));
    assert_eq!(cache.statistics().l1_hits, 1);
}

#[rstest]
fn replacing_a_key_keeps_byte_accounting(cache: CacheManager<String, Vec<u8>>) {
    assert!(!cache.put("k".to_string(), vec![1], 10));
    assert!(cache.put("k".to_string(), vec![2], 20));
    assert_eq!(cache.statistics().current_bytes, 20);

    // Moving the key to another tier displaces the old copy too.
    assert!(cache.put_in(Tier::L3, "k".to_string(), vec![3], 5));
    assert_eq!(cache.statistics().current_bytes, 5);
}

#[rstest]
fn prefetch_only_loads_absent_keys(cache: CacheManager<String, Vec<u8>>) {
    cache.put("have".to_string(), vec![0], 1);
    let keys = vec!["have".to_string(), "want".to_string(), "gone".to_string()];
    cache.prefetch(keys, |key| {
        (key != "gone").then(|| (vec![1], 1))
    });

    assert_eq!(cache.sizes()[2], 1);
    let stats = cache.statistics();
    assert_eq!(stats.prefetch_hits, 1);
    assert_eq!(stats.prefetch_misses, 1);
}
