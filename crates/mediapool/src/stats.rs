//! Live atomic counters and immutable snapshots
//!
//! Every component keeps lock-free counters updated on the hot path and hands
//! out plain snapshot structs for reporting. Snapshots are point-in-time
//! copies, so report generation never races with producers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Raise `peak` to `candidate` with a compare-and-retry loop so concurrent
/// peaks are never under-reported.
pub(crate) fn bump_peak(peak: &AtomicUsize, candidate: usize) {
    let mut observed = peak.load(Ordering::Relaxed);
    while candidate > observed {
        match peak.compare_exchange_weak(
            observed,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => observed = actual,
        }
    }
}

/// Human-readable byte formatting for reports.
pub(crate) fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2} {}", UNITS[unit])
}

/// Pool allocator counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub(crate) total_allocated: AtomicUsize,
    pub(crate) total_freed: AtomicUsize,
    pub(crate) current_usage: AtomicUsize,
    pub(crate) peak_usage: AtomicUsize,
    pub(crate) allocation_count: AtomicU64,
    pub(crate) free_count: AtomicU64,
    pub(crate) pool_hit_count: AtomicU64,
    pub(crate) system_alloc_count: AtomicU64,
}

impl PoolStats {
    pub(crate) fn record_alloc(&self, size: usize, from_pool: bool) {
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.total_allocated.fetch_add(size, Ordering::Relaxed);
        let usage = self.current_usage.fetch_add(size, Ordering::Relaxed) + size;
        bump_peak(&self.peak_usage, usage);
        if from_pool {
            self.pool_hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.system_alloc_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_free(&self, size: usize) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.total_freed.fetch_add(size, Ordering::Relaxed);
        self.current_usage.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            current_usage: self.current_usage.load(Ordering::Relaxed),
            peak_usage: self.peak_usage.load(Ordering::Relaxed),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            free_count: self.free_count.load(Ordering::Relaxed),
            pool_hit_count: self.pool_hit_count.load(Ordering::Relaxed),
            system_alloc_count: self.system_alloc_count.load(Ordering::Relaxed),
        }
    }

}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub total_allocated: usize,
    pub total_freed: usize,
    pub current_usage: usize,
    pub peak_usage: usize,
    pub allocation_count: u64,
    pub free_count: u64,
    pub pool_hit_count: u64,
    pub system_alloc_count: u64,
}

impl PoolStatsSnapshot {
    /// Fraction of allocations satisfied from a pre-carved block.
    pub fn hit_rate(&self) -> f64 {
        if self.allocation_count == 0 {
            0.0
        } else {
            self.pool_hit_count as f64 / self.allocation_count as f64
        }
    }

    /// Current usage relative to the observed peak.
    pub fn utilization_rate(&self) -> f64 {
        if self.peak_usage == 0 {
            1.0
        } else {
            self.current_usage as f64 / self.peak_usage as f64
        }
    }
}

/// Generic object pool counters.
#[derive(Debug, Default)]
pub struct ObjectPoolStats {
    pub(crate) total_created: AtomicU64,
    pub(crate) total_acquired: AtomicU64,
    pub(crate) total_released: AtomicU64,
    pub(crate) current_in_use: AtomicUsize,
    pub(crate) peak_usage: AtomicUsize,
}

impl ObjectPoolStats {
    pub(crate) fn record_create(&self) {
        self.total_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acquire(&self) {
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        let in_use = self.current_in_use.fetch_add(1, Ordering::Relaxed) + 1;
        bump_peak(&self.peak_usage, in_use);
    }

    pub(crate) fn record_release(&self) {
        self.total_released.fetch_add(1, Ordering::Relaxed);
        self.current_in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn in_use(&self) -> usize {
        self.current_in_use.load(Ordering::Relaxed)
    }

    /// Queue length is owned by the pool, so the caller passes it in.
    pub fn snapshot(&self, available: usize) -> ObjectPoolStatsSnapshot {
        ObjectPoolStatsSnapshot {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            current_in_use: self.current_in_use.load(Ordering::Relaxed),
            current_available: available,
            peak_usage: self.peak_usage.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ObjectPoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectPoolStatsSnapshot {
    pub total_created: u64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub current_in_use: usize,
    pub current_available: usize,
    pub peak_usage: usize,
}

impl ObjectPoolStatsSnapshot {
    /// Fraction of acquisitions served without creating a fresh object.
    pub fn hit_rate(&self) -> f64 {
        if self.total_acquired == 0 {
            0.0
        } else {
            (self.total_acquired.saturating_sub(self.total_created)) as f64
                / self.total_acquired as f64
        }
    }
}

/// Buffer recycler counters, shared by the packet and frame recyclers.
#[derive(Debug, Default)]
pub struct RecyclerStats {
    pub(crate) total_created: AtomicU64,
    pub(crate) total_acquired: AtomicU64,
    pub(crate) total_released: AtomicU64,
    pub(crate) current_in_use: AtomicUsize,
    pub(crate) current_available: AtomicUsize,
    pub(crate) pool_hits: AtomicU64,
    pub(crate) pool_misses: AtomicU64,
    pub(crate) current_memory: AtomicUsize,
    pub(crate) peak_memory: AtomicUsize,
}

impl RecyclerStats {
    pub(crate) fn record_memory_add(&self, bytes: usize) {
        let usage = self.current_memory.fetch_add(bytes, Ordering::Relaxed) + bytes;
        bump_peak(&self.peak_memory, usage);
    }

    pub(crate) fn record_memory_sub(&self, bytes: usize) {
        self.current_memory.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RecyclerStatsSnapshot {
        RecyclerStatsSnapshot {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            current_in_use: self.current_in_use.load(Ordering::Relaxed),
            current_available: self.current_available.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            current_memory: self.current_memory.load(Ordering::Relaxed),
            peak_memory: self.peak_memory.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RecyclerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecyclerStatsSnapshot {
    pub total_created: u64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub current_in_use: usize,
    pub current_available: usize,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub current_memory: usize,
    pub peak_memory: usize,
}

impl RecyclerStatsSnapshot {
    /// Fraction of acquisitions served from a sub-pool.
    pub fn hit_rate(&self) -> f64 {
        let total = self.pool_hits + self.pool_misses;
        if total == 0 {
            0.0
        } else {
            self.pool_hits as f64 / total as f64
        }
    }

    /// Current memory relative to the observed peak.
    pub fn memory_efficiency(&self) -> f64 {
        if self.peak_memory == 0 {
            0.0
        } else {
            self.current_memory as f64 / self.peak_memory as f64
        }
    }
}

/// Multi-tier cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub(crate) l1_hits: AtomicU64,
    pub(crate) l2_hits: AtomicU64,
    pub(crate) l3_hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) promotions: AtomicU64,
    pub(crate) demotions: AtomicU64,
    pub(crate) expirations: AtomicU64,
    pub(crate) prefetch_hits: AtomicU64,
    pub(crate) prefetch_misses: AtomicU64,
    pub(crate) current_bytes: AtomicUsize,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l3_hits: self.l3_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            prefetch_hits: self.prefetch_hits.load(Ordering::Relaxed),
            prefetch_misses: self.prefetch_misses.load(Ordering::Relaxed),
            current_bytes: self.current_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub expirations: u64,
    pub prefetch_hits: u64,
    pub prefetch_misses: u64,
    pub current_bytes: usize,
}

impl CacheStatsSnapshot {
    pub fn total_hits(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.l3_hits
    }

    /// `hits / (hits + misses)`, always within `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.total_hits() as f64 / total as f64
        }
    }

    pub fn l1_hit_rate(&self) -> f64 {
        let total = self.total_hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.l1_hits as f64 / total as f64
        }
    }

    pub fn prefetch_efficiency(&self) -> f64 {
        let total = self.prefetch_hits + self.prefetch_misses;
        if total == 0 {
            0.0
        } else {
            self.prefetch_hits as f64 / total as f64
        }
    }
}

/// Allocation tracker counters.
#[derive(Debug, Default)]
pub struct TrackerStats {
    pub(crate) total_allocated: AtomicUsize,
    pub(crate) total_freed: AtomicUsize,
    pub(crate) current_usage: AtomicUsize,
    pub(crate) peak_usage: AtomicUsize,
    pub(crate) allocation_count: AtomicU64,
    pub(crate) free_count: AtomicU64,
    pub(crate) leak_count: AtomicU64,
}

impl TrackerStats {
    pub fn snapshot(&self) -> TrackerStatsSnapshot {
        TrackerStatsSnapshot {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            current_usage: self.current_usage.load(Ordering::Relaxed),
            peak_usage: self.peak_usage.load(Ordering::Relaxed),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            free_count: self.free_count.load(Ordering::Relaxed),
            leak_count: self.leak_count.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.total_allocated.store(0, Ordering::Relaxed);
        self.total_freed.store(0, Ordering::Relaxed);
        self.current_usage.store(0, Ordering::Relaxed);
        self.peak_usage.store(0, Ordering::Relaxed);
        self.allocation_count.store(0, Ordering::Relaxed);
        self.free_count.store(0, Ordering::Relaxed);
        self.leak_count.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`TrackerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStatsSnapshot {
    pub total_allocated: usize,
    pub total_freed: usize,
    pub current_usage: usize,
    pub peak_usage: usize,
    pub allocation_count: u64,
    pub free_count: u64,
    pub leak_count: u64,
}

impl TrackerStatsSnapshot {
    pub fn average_allocation_size(&self) -> f64 {
        if self.allocation_count == 0 {
            0.0
        } else {
            self.total_allocated as f64 / self.allocation_count as f64
        }
    }

    /// Freed bytes over allocated bytes.
    pub fn memory_efficiency(&self) -> f64 {
        if self.total_allocated == 0 {
            0.0
        } else {
            self.total_freed as f64 / self.total_allocated as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn peak_is_never_under_reported() {
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for i in 1..=8usize {
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                bump_peak(&peak, i * 100);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::Relaxed), 800);
    }

    #[test]
    fn pool_hit_rate_bounds() {
        let stats = PoolStats::default();
        stats.record_alloc(128, true);
        stats.record_alloc(128, false);
        let snap = stats.snapshot();
        assert!((snap.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(snap.current_usage, 256);
        stats.record_free(128);
        assert_eq!(stats.snapshot().current_usage, 128);
        assert_eq!(stats.snapshot().peak_usage, 256);
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MiB");
    }
}
