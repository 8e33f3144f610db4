//! Frame recycler keyed by exact frame geometry
//!
//! Decoded frames only interchange when width, height, format, and stride
//! alignment all match, so sub-pools are keyed by the full [`FrameSpec`].
//! Sub-pools live in a sharded map; a background thread drops pools that
//! sit idle.

use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::config::FrameRecyclerConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::recycler::backend::{BufferBackend, FrameBuf, FrameSpec, HeapBackend};
use crate::recycler::packet::PressureCallback;
use crate::stats::{format_bytes, RecyclerStats, RecyclerStatsSnapshot};

struct FramePool {
    ready: Vec<FrameBuf>,
    last_used: Instant,
}

struct FrameShared {
    config: FrameRecyclerConfig,
    backend: Arc<dyn BufferBackend>,
    pools: DashMap<FrameSpec, FramePool>,
    stats: RecyclerStats,
    pressure_callback: Mutex<Option<PressureCallback>>,
    shutdown: AtomicBool,
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

impl FrameShared {
    fn recycle(&self, mut buf: FrameBuf) {
        self.stats.total_released.fetch_add(1, Ordering::Relaxed);
        self.stats.current_in_use.fetch_sub(1, Ordering::Relaxed);
        let size = buf.size();
        if self.shutdown.load(Ordering::Acquire) {
            self.stats.record_memory_sub(size);
            return;
        }
        self.backend.reset_frame(&mut buf);

        let spec = buf.spec;
        match self.pools.get_mut(&spec) {
            Some(mut pool) => {
                pool.last_used = Instant::now();
                if pool.ready.len() < self.config.frames_per_pool {
                    pool.ready.push(buf);
                    self.stats.current_available.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.record_memory_sub(size);
                }
            }
            None => {
                if self.pools.len() < self.config.max_pools {
                    self.pools.insert(
                        spec,
                        FramePool {
                            ready: vec![buf],
                            last_used: Instant::now(),
                        },
                    );
                    self.stats.current_available.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.record_memory_sub(size);
                }
            }
        }
    }

    fn usage_fraction(&self) -> f64 {
        self.stats.current_memory.load(Ordering::Relaxed) as f64
            / self.config.max_total_memory as f64
    }

    /// Shrink every sub-pool to a quarter of its configured capacity.
    fn shrink_to_quarter(&self) {
        let keep = self.config.frames_per_pool / 4;
        let mut dropped_bytes = 0usize;
        for mut entry in self.pools.iter_mut() {
            let pool = entry.value_mut();
            while pool.ready.len() > keep {
                if let Some(buf) = pool.ready.pop() {
                    dropped_bytes += buf.size();
                    self.stats.current_available.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        self.pools.retain(|_, pool| !pool.ready.is_empty());
        if dropped_bytes > 0 {
            self.stats.record_memory_sub(dropped_bytes);
            debug!(bytes = dropped_bytes, "shrank frame sub-pools");
        }
    }

    /// Drop sub-pools idle longer than `max_idle`.
    fn prune_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut dropped_bytes = 0usize;
        self.pools.retain(|_, pool| {
            if now.duration_since(pool.last_used) > max_idle {
                for buf in pool.ready.drain(..) {
                    dropped_bytes += buf.size();
                    self.stats.current_available.fetch_sub(1, Ordering::Relaxed);
                }
                false
            } else {
                true
            }
        });
        if dropped_bytes > 0 {
            self.stats.record_memory_sub(dropped_bytes);
            debug!(bytes = dropped_bytes, "pruned idle frame sub-pools");
        }
    }

    fn clear_ready(&self) {
        let mut dropped_bytes = 0usize;
        self.pools.retain(|_, pool| {
            for buf in pool.ready.drain(..) {
                dropped_bytes += buf.size();
                self.stats.current_available.fetch_sub(1, Ordering::Relaxed);
            }
            false
        });
        if dropped_bytes > 0 {
            self.stats.record_memory_sub(dropped_bytes);
        }
    }
}

/// RAII lease on a frame buffer.
pub struct FrameLease {
    buf: Option<FrameBuf>,
    shared: Weak<FrameShared>,
    from_pool: bool,
}

impl FrameLease {
    pub fn from_pool(&self) -> bool {
        self.from_pool
    }

    pub fn spec(&self) -> FrameSpec {
        self.buf.as_ref().expect("lease already consumed").spec
    }

    /// Convert into a cloneable shared frame returning on last drop.
    pub fn share(mut self) -> SharedFrame {
        SharedFrame {
            inner: Arc::new(SharedFrameInner {
                buf: self.buf.take(),
                shared: self.shared.clone(),
            }),
        }
    }
}

impl Deref for FrameLease {
    type Target = FrameBuf;

    #[inline]
    fn deref(&self) -> &FrameBuf {
        self.buf.as_ref().expect("lease already consumed")
    }
}

impl DerefMut for FrameLease {
    #[inline]
    fn deref_mut(&mut self) -> &mut FrameBuf {
        self.buf.as_mut().expect("lease already consumed")
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Some(shared) = self.shared.upgrade() {
                shared.recycle(buf);
            }
        }
    }
}

struct SharedFrameInner {
    buf: Option<FrameBuf>,
    shared: Weak<FrameShared>,
}

impl Drop for SharedFrameInner {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Some(shared) = self.shared.upgrade() {
                shared.recycle(buf);
            }
        }
    }
}

/// Cloneable read-only view of a decoded frame.
#[derive(Clone)]
pub struct SharedFrame {
    inner: Arc<SharedFrameInner>,
}

impl SharedFrame {
    pub fn frame(&self) -> &FrameBuf {
        self.inner.buf.as_ref().expect("frame already returned")
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// Per-spec occupancy view.
#[derive(Debug, Clone, Copy)]
pub struct FramePoolInfo {
    pub spec: FrameSpec,
    pub ready_frames: usize,
    pub pooled_bytes: usize,
}

/// Recycler for decoded frame buffers.
pub struct FrameRecycler {
    inner: Arc<FrameShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FrameRecycler {
    pub fn new(config: FrameRecyclerConfig) -> MemoryResult<Self> {
        Self::with_backend(config, Arc::new(HeapBackend))
    }

    pub fn with_backend(
        config: FrameRecyclerConfig,
        backend: Arc<dyn BufferBackend>,
    ) -> MemoryResult<Self> {
        config.validate()?;
        info!(backend = backend.name(), "frame recycler starting");
        let inner = Arc::new(FrameShared {
            config,
            backend,
            pools: DashMap::new(),
            stats: RecyclerStats::default(),
            pressure_callback: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        });

        let worker = inner.config.cleanup_interval.map(|interval| {
            let shared = Arc::clone(&inner);
            let max_idle = shared.config.max_pool_idle;
            std::thread::Builder::new()
                .name("frame-recycler-gc".into())
                .spawn(move || {
                    loop {
                        {
                            let mut guard = shared.wakeup_lock.lock();
                            shared.wakeup.wait_for(&mut guard, interval);
                        }
                        if shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        shared.prune_idle(max_idle);
                    }
                })
                .expect("spawn frame recycler worker")
        });

        Ok(Self {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Lease a frame buffer for `spec`.
    pub fn allocate(&self, spec: &FrameSpec) -> MemoryResult<FrameLease> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(MemoryError::NotInitialized);
        }
        spec.validate()?;
        if !self.inner.backend.supports(spec.format) {
            return Err(MemoryError::UnsupportedFormat {
                format: spec.format.name().to_string(),
            });
        }
        let size = spec.layout().size;
        if size > self.inner.config.max_frame_size {
            return Err(MemoryError::invalid_params(format!(
                "frame of {size} bytes exceeds the per-frame limit"
            )));
        }

        let pooled = self.inner.pools.get_mut(spec).and_then(|mut pool| {
            pool.last_used = Instant::now();
            pool.ready.pop()
        });

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
                self.inner.stats.pool_misses.fetch_add(1, Ordering::Relaxed);
                self.inner.stats.total_created.fetch_add(1, Ordering::Relaxed);
                let buf = self.inner.backend.alloc_frame(spec)?;
                self.inner.stats.record_memory_add(buf.size());
                (buf, false)
            }
        };
        self.inner.stats.total_acquired.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.current_in_use.fetch_add(1, Ordering::Relaxed);

        self.check_pressure();

        Ok(FrameLease {
            buf: Some(buf),
            shared: Arc::downgrade(&self.inner),
            from_pool,
        })
    }

    /// Pre-create `count` ready frames for `spec`.
    pub fn preallocate(&self, spec: &FrameSpec, count: usize) -> MemoryResult<()> {
        spec.validate()?;
        if !self.inner.backend.supports(spec.format) {
            return Err(MemoryError::UnsupportedFormat {
                format: spec.format.name().to_string(),
            });
        }
        let cap = self.inner.config.frames_per_pool;
        let mut pool = self
            .inner
            .pools
            .entry(*spec)
            .or_insert_with(|| FramePool {
                ready: Vec::with_capacity(cap),
                last_used: Instant::now(),
            });
        while pool.ready.len() < count.min(cap) {
            let buf = self.inner.backend.alloc_frame(spec)?;
            self.inner.stats.total_created.fetch_add(1, Ordering::Relaxed);
            self.inner.stats.record_memory_add(buf.size());
            self.inner
                .stats
                .current_available
                .fetch_add(1, Ordering::Relaxed);
            pool.ready.push(buf);
        }
        Ok(())
    }

    fn check_pressure(&self) {
        let fraction = self.inner.usage_fraction();
        if fraction <= self.inner.config.pressure_threshold {
            return;
        }
        debug!(usage = fraction, "frame recycler under memory pressure");
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

    /// Drop sub-pools idle longer than `max_idle` right now.
    pub fn cleanup(&self, max_idle: Duration) {
        self.inner.prune_idle(max_idle);
    }

    /// Drop every ready frame across all sub-pools.
    pub fn force_garbage_collection(&self) {
        self.inner.clear_ready();
    }

    pub fn pool_info(&self) -> Vec<FramePoolInfo> {
        self.inner
            .pools
            .iter()
            .map(|entry| {
                let pooled_bytes = entry.value().ready.iter().map(FrameBuf::size).sum();
                FramePoolInfo {
                    spec: *entry.key(),
                    ready_frames: entry.value().ready.len(),
                    pooled_bytes,
                }
            })
            .collect()
    }

    pub fn statistics(&self) -> RecyclerStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn report(&self) -> String {
        let stats = self.statistics();
        let mut out = String::new();
        let _ = writeln!(out, "frame recycler ({})", self.inner.backend.name());
        let _ = writeln!(
            out,
            "  memory: {} current, {} peak",
            format_bytes(stats.current_memory),
            format_bytes(stats.peak_memory),
        );
        let _ = writeln!(
            out,
            "  acquisitions: {}, hit rate {:.1}%",
            stats.total_acquired,
            stats.hit_rate() * 100.0
        );
        for info in self.pool_info() {
            let _ = writeln!(
                out,
                "  {}x{} {}: {} ready ({})",
                info.spec.width,
                info.spec.height,
                info.spec.format.name(),
                info.ready_frames,
                format_bytes(info.pooled_bytes),
            );
        }
        out
    }

    /// Stop the worker and reject further allocations.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.inner.clear_ready();
    }
}

impl Drop for FrameRecycler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recycler::backend::PixelFormat;

    fn quiet_config() -> FrameRecyclerConfig {
        FrameRecyclerConfig {
            cleanup_interval: None,
            ..FrameRecyclerConfig::default()
        }
    }

    #[test]
    fn frames_reuse_within_matching_spec() {
        let recycler = FrameRecycler::new(quiet_config()).unwrap();
        let spec = FrameSpec::new(640, 480, PixelFormat::Yuv420p);

        drop(recycler.allocate(&spec).unwrap());
        let lease = recycler.allocate(&spec).unwrap();
        assert!(lease.from_pool());

        // A different geometry gets its own pool.
        let other = FrameSpec::new(1280, 720, PixelFormat::Yuv420p);
        assert!(!recycler.allocate(&other).unwrap().from_pool());
    }

    #[test]
    fn preallocate_warms_the_pool() {
        let recycler = FrameRecycler::new(quiet_config()).unwrap();
        let spec = FrameSpec::new(320, 240, PixelFormat::Nv12);
        recycler.preallocate(&spec, 4).unwrap();

        let info = recycler.pool_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].ready_frames, 4);
        assert!(recycler.allocate(&spec).unwrap().from_pool());
    }

    #[test]
    fn rejects_oversized_frame() {
        let config = FrameRecyclerConfig {
            max_frame_size: 1024 * 1024,
            ..quiet_config()
        };
        let recycler = FrameRecycler::new(config).unwrap();
        let spec = FrameSpec::new(3840, 2160, PixelFormat::Rgba);
        assert!(matches!(
            recycler.allocate(&spec),
            Err(MemoryError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn cleanup_drops_idle_pools() {
        let recycler = FrameRecycler::new(quiet_config()).unwrap();
        let spec = FrameSpec::new(320, 240, PixelFormat::Gray8);
        recycler.preallocate(&spec, 2).unwrap();

        recycler.cleanup(Duration::ZERO);
        assert!(recycler.pool_info().is_empty());
        assert_eq!(recycler.statistics().current_memory, 0);
    }

    #[test]
    fn shared_frame_returns_on_last_drop() {
        let recycler = FrameRecycler::new(quiet_config()).unwrap();
        let spec = FrameSpec::new(320, 240, PixelFormat::Gray8);

        let shared = recycler.allocate(&spec).unwrap().share();
        let clone = shared.clone();
        drop(shared);
        assert_eq!(recycler.statistics().current_in_use, 1);
        drop(clone);
        assert!(recycler.allocate(&spec).unwrap().from_pool());
    }

    #[test]
    fn pressure_shrinks_pools_and_fires_callback() {
        use std::sync::atomic::AtomicUsize;

        let config = FrameRecyclerConfig {
            max_total_memory: 1024 * 1024,
            pressure_threshold: 0.5,
            frames_per_pool: 8,
            ..quiet_config()
        };
        let recycler = FrameRecycler::new(config).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        recycler.set_pressure_callback(move |fraction| {
            assert!(fraction > 0.5);
            fired_in_cb.fetch_add(1, Ordering::Relaxed);
        });

        // Eight ready 320x240 GRAY8 frames sit above half of the 1 MiB
        // budget.
        let spec = FrameSpec::new(320, 240, PixelFormat::Gray8);
        recycler.preallocate(&spec, 8).unwrap();
        assert_eq!(fired.load(Ordering::Relaxed), 0);

        // The next miss crosses the pressure line, shrinking ready pools to
        // a quarter of their capacity and notifying.
        let other = FrameSpec::new(640, 480, PixelFormat::Gray8);
        let _lease = recycler.allocate(&other).unwrap();
        assert!(fired.load(Ordering::Relaxed) > 0);

        let ready: usize = recycler
            .pool_info()
            .iter()
            .filter(|info| info.spec == spec)
            .map(|info| info.ready_frames)
            .sum();
        assert_eq!(ready, 2);
    }

    #[test]
    fn backend_format_gaps_are_reported() {
        struct LumaOnly;
        impl BufferBackend for LumaOnly {
            fn name(&self) -> &'static str {
                "luma-only"
            }
            fn supports(&self, format: PixelFormat) -> bool {
                format == PixelFormat::Gray8
            }
            fn alloc_packet(&self, capacity: usize) -> crate::recycler::backend::PacketBuf {
                HeapBackend.alloc_packet(capacity)
            }
            fn alloc_frame(&self, spec: &FrameSpec) -> MemoryResult<FrameBuf> {
                HeapBackend.alloc_frame(spec)
            }
        }

        let recycler =
            FrameRecycler::with_backend(quiet_config(), Arc::new(LumaOnly)).unwrap();
        assert!(recycler
            .allocate(&FrameSpec::new(320, 240, PixelFormat::Gray8))
            .is_ok());

        let spec = FrameSpec::new(320, 240, PixelFormat::Yuv420p);
        assert!(matches!(
            recycler.allocate(&spec),
            Err(MemoryError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            recycler.preallocate(&spec, 2),
            Err(MemoryError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn plane_writes_stay_in_bounds() {
        let recycler = FrameRecycler::new(quiet_config()).unwrap();
        let spec = FrameSpec::new(64, 48, PixelFormat::Yuv420p);
        let mut lease = recycler.allocate(&spec).unwrap();
        for plane in 0..lease.planes {
            let fill = 0x10 * (plane as u8 + 1);
            lease.plane_mut(plane).fill(fill);
        }
        assert!(lease.plane(0).iter().all(|&b| b == 0x10));
        assert!(lease.plane(2).iter().all(|&b| b == 0x30));
    }
}
