//! Size-categorized packet recycler
//!
//! Each category holds a bounded set of target-size sub-pools. Allocation
//! pops a ready buffer from the matching sub-pool or asks the backend for a
//! fresh one. Leases return buffers on drop; `share` converts a lease into
//! a cloneable refcounted packet that returns on last drop. A background
//! thread prunes idle sub-pools; crossing the pressure threshold triggers a
//! partial shrink and the pressure callback.

use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::config::PacketRecyclerConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::recycler::backend::{BufferBackend, HeapBackend, PacketBuf};
use crate::recycler::SizeCategory;
use crate::stats::{format_bytes, RecyclerStats, RecyclerStatsSnapshot};

/// Callback fired when tracked memory crosses the pressure threshold.
/// Receives current usage as a fraction of the configured maximum.
pub type PressureCallback = Arc<dyn Fn(f64) + Send + Sync>;

struct SubPool {
    ready: Vec<PacketBuf>,
    last_used: Instant,
}

struct RecyclerShared {
    config: PacketRecyclerConfig,
    backend: Arc<dyn BufferBackend>,
    // One lock per category keeps unrelated streams from contending.
    categories: [Mutex<FxHashMap<usize, SubPool>>; 5],
    stats: RecyclerStats,
    pressure_callback: Mutex<Option<PressureCallback>>,
    shutdown: AtomicBool,
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

impl RecyclerShared {
    fn recycle(&self, mut buf: PacketBuf, category: SizeCategory, target: usize) {
        self.stats.total_released.fetch_add(1, Ordering::Relaxed);
        self.stats.current_in_use.fetch_sub(1, Ordering::Relaxed);
        if self.shutdown.load(Ordering::Acquire) {
            self.stats.record_memory_sub(target);
            return;
        }
        self.backend.reset_packet(&mut buf);

        let mut pools = self.categories[category_slot(category)].lock();
        let room = match pools.get_mut(&target) {
            Some(pool) => {
                pool.last_used = Instant::now();
                pool.ready.len() < self.config.packets_per_pool
            }
            None => pools.len() < self.config.max_pools_per_category,
        };
        if room {
            pools
                .entry(target)
                .or_insert_with(|| SubPool {
                    ready: Vec::with_capacity(self.config.packets_per_pool),
                    last_used: Instant::now(),
                })
                .ready
                .push(buf);
            self.stats.current_available.fetch_add(1, Ordering::Relaxed);
        } else {
            // Full sub-pool or category at its pool cap: drop the buffer.
            self.stats.record_memory_sub(target);
        }
    }

    fn usage_fraction(&self) -> f64 {
        self.stats.current_memory.load(Ordering::Relaxed) as f64
            / self.config.max_total_memory as f64
    }

    /// Shrink every sub-pool to a quarter of its configured capacity.
    fn shrink_to_quarter(&self) {
        let keep = self.config.packets_per_pool / 4;
        for slot in &self.categories {
            let mut pools = slot.lock();
            for (target, pool) in pools.iter_mut() {
                while pool.ready.len() > keep {
                    pool.ready.pop();
                    self.stats.record_memory_sub(*target);
                    self.stats.current_available.fetch_sub(1, Ordering::Relaxed);
                }
            }
            pools.retain(|_, pool| !pool.ready.is_empty());
        }
    }

    /// Drop every ready buffer in pools idle longer than `cleanup_interval`.
    fn prune_idle(&self) {
        let Some(max_idle) = self.config.cleanup_interval else {
            return;
        };
        let now = Instant::now();
        let mut dropped = 0usize;
        for slot in &self.categories {
            let mut pools = slot.lock();
            pools.retain(|target, pool| {
                if now.duration_since(pool.last_used) > max_idle {
                    for _ in pool.ready.drain(..) {
                        self.stats.record_memory_sub(*target);
                        self.stats.current_available.fetch_sub(1, Ordering::Relaxed);
                        dropped += 1;
                    }
                    false
                } else {
                    true
                }
            });
        }
        if dropped > 0 {
            debug!(dropped, "pruned idle packet sub-pools");
        }
    }
}

fn category_slot(category: SizeCategory) -> usize {
    match category {
        SizeCategory::Tiny => 0,
        SizeCategory::Small => 1,
        SizeCategory::Medium => 2,
        SizeCategory::Large => 3,
        SizeCategory::ExtraLarge => 4,
    }
}

/// RAII lease on a packet buffer. Returns the buffer to its sub-pool on
/// drop.
pub struct PacketLease {
    buf: Option<PacketBuf>,
    shared: Weak<RecyclerShared>,
    category: SizeCategory,
    target: usize,
    from_pool: bool,
}

impl PacketLease {
    pub fn category(&self) -> SizeCategory {
        self.category
    }

    /// True when this lease reused a pooled buffer.
    pub fn from_pool(&self) -> bool {
        self.from_pool
    }

    /// Convert into a cloneable shared packet. The buffer returns to the
    /// pool when the last clone drops.
    pub fn share(mut self) -> SharedPacket {
        SharedPacket {
            inner: Arc::new(SharedInner {
                buf: self.buf.take().expect("lease already consumed"),
                shared: self.shared.clone(),
                category: self.category,
                target: self.target,
            }),
        }
    }
}

impl Deref for PacketLease {
    type Target = PacketBuf;

    #[inline]
    fn deref(&self) -> &PacketBuf {
        self.buf.as_ref().expect("lease already consumed")
    }
}

impl DerefMut for PacketLease {
    #[inline]
    fn deref_mut(&mut self) -> &mut PacketBuf {
        self.buf.as_mut().expect("lease already consumed")
    }
}

impl Drop for PacketLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Some(shared) = self.shared.upgrade() {
                shared.recycle(buf, self.category, self.target);
            }
        }
    }
}

struct SharedInner {
    buf: PacketBuf,
    shared: Weak<RecyclerShared>,
    category: SizeCategory,
    target: usize,
}

impl Drop for SharedInner {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let buf = std::mem::take(&mut self.buf);
            shared.recycle(buf, self.category, self.target);
        }
    }
}

/// Cloneable read-only view of a packet buffer.
#[derive(Clone)]
pub struct SharedPacket {
    inner: Arc<SharedInner>,
}

impl SharedPacket {
    pub fn data(&self) -> &[u8] {
        &self.inner.buf.data
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// Per-category occupancy view for reports and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryInfo {
    pub sub_pools: usize,
    pub ready_buffers: usize,
    pub pooled_bytes: usize,
}

/// Recycler for compressed packet buffers.
pub struct PacketRecycler {
    inner: Arc<RecyclerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PacketRecycler {
    pub fn new(config: PacketRecyclerConfig) -> MemoryResult<Self> {
        Self::with_backend(config, Arc::new(HeapBackend))
    }

    pub fn with_backend(
        config: PacketRecyclerConfig,
        backend: Arc<dyn BufferBackend>,
    ) -> MemoryResult<Self> {
        config.validate()?;
        info!(backend = backend.name(), "packet recycler starting");
        let inner = Arc::new(RecyclerShared {
            config,
            backend,
            categories: std::array::from_fn(|_| Mutex::new(FxHashMap::default())),
            stats: RecyclerStats::default(),
            pressure_callback: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        });

        let worker = inner.config.cleanup_interval.map(|interval| {
            let shared = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("packet-recycler-gc".into())
                .spawn(move || {
                    loop {
                        {
                            let mut guard = shared.wakeup_lock.lock();
                            shared.wakeup.wait_for(&mut guard, interval);
                        }
                        if shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        shared.prune_idle();
                    }
                })
                .expect("spawn packet recycler worker")
        });

        Ok(Self {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Lease a buffer with capacity for at least `size` bytes.
    pub fn allocate(&self, size: usize) -> MemoryResult<PacketLease> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(MemoryError::NotInitialized);
        }
        if size == 0 {
            return Err(MemoryError::invalid_params("packet size must be > 0"));
        }
        let category = SizeCategory::for_size(size);
        let target = category.suggested_size(size);
        if target > self.inner.config.max_total_memory {
            return Err(MemoryError::invalid_params(format!(
                "packet of {size} bytes exceeds recycler capacity"
            )));
        }

        let pooled = {
            let mut pools = self.inner.categories[category_slot(category)].lock();
            pools.get_mut(&target).and_then(|pool| {
                pool.last_used = Instant::now();
                pool.ready.pop()
            })
        };

        let (buf, from_pool) = match pooled {
            Some(buf) => {
                self.inner.stats.pool_hits.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .stats
                    .current_available
                    .fetch_sub(1, Ordering::Relaxed);
                (buf, true)
            }
            None => {
                // Growing past the hard ceiling is exhaustion, not pressure.
                let current = self.inner.stats.current_memory.load(Ordering::Relaxed);
                if current + target > self.inner.config.max_total_memory {
                    return Err(MemoryError::PoolExhausted {
                        pool: category.name().to_string(),
                    });
                }
                self.inner.stats.pool_misses.fetch_add(1, Ordering::Relaxed);
                self.inner.stats.total_created.fetch_add(1, Ordering::Relaxed);
                self.inner.stats.record_memory_add(target);
                (self.inner.backend.alloc_packet(target), false)
            }
        };
        self.inner.stats.total_acquired.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.current_in_use.fetch_add(1, Ordering::Relaxed);

        self.check_pressure();

        Ok(PacketLease {
            buf: Some(buf),
            shared: Arc::downgrade(&self.inner),
            category,
            target,
            from_pool,
        })
    }

    /// Lease `count` buffers of the same size in one call.
    pub fn allocate_batch(&self, size: usize, count: usize) -> MemoryResult<Vec<PacketLease>> {
        (0..count).map(|_| self.allocate(size)).collect()
    }

    /// Pre-create `count` ready buffers at the category's base size.
    pub fn warmup_category(&self, category: SizeCategory, count: usize) {
        let target = category.suggested_size(1);
        let mut pools = self.inner.categories[category_slot(category)].lock();
        let pool = pools.entry(target).or_insert_with(|| SubPool {
            ready: Vec::with_capacity(self.inner.config.packets_per_pool),
            last_used: Instant::now(),
        });
        let cap = self.inner.config.packets_per_pool;
        while pool.ready.len() < count.min(cap) {
            pool.ready.push(self.inner.backend.alloc_packet(target));
            self.inner.stats.total_created.fetch_add(1, Ordering::Relaxed);
            self.inner.stats.record_memory_add(target);
            self.inner
                .stats
                .current_available
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn check_pressure(&self) {
        let fraction = self.inner.usage_fraction();
        if fraction <= self.inner.config.pressure_threshold {
            return;
        }
        debug!(usage = fraction, "packet recycler under memory pressure");
        self.inner.shrink_to_quarter();
        // Copy the callback out so it runs without any recycler lock held.
        let callback = self.inner.pressure_callback.lock().clone();
        if let Some(callback) = callback {
            callback(fraction);
        }
    }

    pub fn set_pressure_callback(&self, callback: impl Fn(f64) + Send + Sync + 'static) {
        *self.inner.pressure_callback.lock() = Some(Arc::new(callback));
    }

    /// Shrink every sub-pool to a quarter of its capacity immediately.
    pub fn force_garbage_collection(&self) {
        self.inner.shrink_to_quarter();
    }

    pub fn category_info(&self, category: SizeCategory) -> CategoryInfo {
        let pools = self.inner.categories[category_slot(category)].lock();
        let mut info = CategoryInfo {
            sub_pools: pools.len(),
            ..CategoryInfo::default()
        };
        for (target, pool) in pools.iter() {
            info.ready_buffers += pool.ready.len();
            info.pooled_bytes += target * pool.ready.len();
        }
        info
    }

    pub fn statistics(&self) -> RecyclerStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn report(&self) -> String {
        let stats = self.statistics();
        let mut out = String::new();
        let _ = writeln!(out, "packet recycler ({})", self.inner.backend.name());
        let _ = writeln!(
            out,
            "  memory: {} current, {} peak (limit {})",
            format_bytes(stats.current_memory),
            format_bytes(stats.peak_memory),
            format_bytes(self.inner.config.max_total_memory),
        );
        let _ = writeln!(
            out,
            "  acquisitions: {}, hit rate {:.1}%",
            stats.total_acquired,
            stats.hit_rate() * 100.0
        );
        for category in SizeCategory::ALL {
            let info = self.category_info(category);
            if info.sub_pools > 0 {
                let _ = writeln!(
                    out,
                    "  {}: {} sub-pools, {} ready ({})",
                    category.name(),
                    info.sub_pools,
                    info.ready_buffers,
                    format_bytes(info.pooled_bytes),
                );
            }
        }
        out
    }

    /// Stop the worker and reject further allocations. Outstanding leases
    /// drop their buffers instead of re-pooling them.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        // Release everything still pooled.
        for slot in &self.inner.categories {
            let mut pools = slot.lock();
            for (target, pool) in pools.iter_mut() {
                for _ in pool.ready.drain(..) {
                    self.inner.stats.record_memory_sub(*target);
                }
            }
            pools.clear();
        }
    }
}

impl Drop for PacketRecycler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn quiet_config() -> PacketRecyclerConfig {
        PacketRecyclerConfig {
            cleanup_interval: None,
            ..PacketRecyclerConfig::default()
        }
    }

    #[test]
    fn lease_round_trip_reuses_buffer() {
        let recycler = PacketRecycler::new(quiet_config()).unwrap();

        {
            let mut lease = recycler.allocate(5000).unwrap();
            assert!(!lease.from_pool());
            lease.data.extend_from_slice(b"payload");
        }
        let lease = recycler.allocate(5000).unwrap();
        assert!(lease.from_pool());
        assert!(lease.data.is_empty());
        assert!(lease.capacity() >= 16 * 1024);
    }

    #[test]
    fn different_categories_use_different_pools() {
        let recycler = PacketRecycler::new(quiet_config()).unwrap();
        drop(recycler.allocate(500).unwrap());
        let lease = recycler.allocate(100_000).unwrap();
        assert!(!lease.from_pool());
        assert_eq!(lease.category(), SizeCategory::Medium);
    }

    #[test]
    fn shared_packet_returns_on_last_drop() {
        let recycler = PacketRecycler::new(quiet_config()).unwrap();

        let shared = recycler.allocate(1000).unwrap().share();
        let clone = shared.clone();
        assert_eq!(shared.ref_count(), 2);
        drop(shared);
        // Still held by the clone.
        assert_eq!(recycler.statistics().current_in_use, 1);
        drop(clone);
        assert_eq!(recycler.statistics().current_in_use, 0);
        assert!(recycler.allocate(1000).unwrap().from_pool());
    }

    #[test]
    fn pressure_triggers_callback_and_shrink() {
        let config = PacketRecyclerConfig {
            max_total_memory: 8 * 1024 * 1024,
            pressure_threshold: 0.5,
            cleanup_interval: None,
            ..PacketRecyclerConfig::default()
        };
        let recycler = PacketRecycler::new(config).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        recycler.set_pressure_callback(move |fraction| {
            assert!(fraction > 0.5);
            fired_in_cb.fetch_add(1, Ordering::Relaxed);
        });

        // 1 MiB leases held live push usage past 50% of 8 MiB.
        let _held: Vec<_> = (0..6)
            .map(|_| recycler.allocate(1024 * 1024).unwrap())
            .collect();
        assert!(fired.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn gc_shrinks_to_quarter() {
        let config = PacketRecyclerConfig {
            packets_per_pool: 8,
            cleanup_interval: None,
            ..PacketRecyclerConfig::default()
        };
        let recycler = PacketRecycler::new(config).unwrap();
        recycler.warmup_category(SizeCategory::Small, 8);
        assert_eq!(recycler.category_info(SizeCategory::Small).ready_buffers, 8);

        recycler.force_garbage_collection();
        assert_eq!(recycler.category_info(SizeCategory::Small).ready_buffers, 2);
    }

    #[test]
    fn hard_cap_refuses_new_buffers() {
        let config = PacketRecyclerConfig {
            max_total_memory: 4 * 1024 * 1024,
            pressure_threshold: 1.0,
            cleanup_interval: None,
            ..PacketRecyclerConfig::default()
        };
        let recycler = PacketRecycler::new(config).unwrap();
        let _held: Vec<_> = (0..4)
            .map(|_| recycler.allocate(1024 * 1024).unwrap())
            .collect();

        assert!(matches!(
            recycler.allocate(1024 * 1024),
            Err(MemoryError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn rejects_zero_and_oversized() {
        let recycler = PacketRecycler::new(quiet_config()).unwrap();
        assert!(recycler.allocate(0).is_err());
        assert!(recycler.allocate(usize::MAX / 4).is_err());
    }

    #[test]
    fn shutdown_rejects_new_leases() {
        let recycler = PacketRecycler::new(quiet_config()).unwrap();
        let lease = recycler.allocate(100).unwrap();
        recycler.shutdown();
        assert!(matches!(
            recycler.allocate(100),
            Err(MemoryError::NotInitialized)
        ));
        // Dropping an outstanding lease after shutdown must not repool.
        drop(lease);
        assert_eq!(recycler.statistics().current_memory, 0);
    }

    #[test]
    fn concurrent_allocate_release() {
        use std::thread;

        let recycler = Arc::new(PacketRecycler::new(quiet_config()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let recycler = Arc::clone(&recycler);
                thread::spawn(move || {
                    for i in 0..200usize {
                        let mut lease = recycler.allocate(1 + i % 20_000).unwrap();
                        lease.data.push(i as u8);
                        thread::yield_now();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(recycler.statistics().current_in_use, 0);
    }
}
