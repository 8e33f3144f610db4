//! Orchestrator owning every memory component
//!
//! One `MemoryManager` composes the pool allocator, both recyclers, the
//! tiered cache, and the allocation tracker under a single configuration.
//! It routes tracked allocations, aggregates statistics, maps usage to a
//! pressure level, and runs a background optimization pass that reclaims
//! memory when pressure climbs.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::config::{ManagerConfig, Scenario, Strategy};
use crate::error::MemoryResult;
use crate::pool::{PoolAllocator, PoolBlock};
use crate::recycler::{BufferBackend, FrameRecycler, HeapBackend, PacketRecycler};
use crate::stats::{
    format_bytes, CacheStatsSnapshot, PoolStatsSnapshot, RecyclerStatsSnapshot,
    TrackerStatsSnapshot,
};
use crate::tracker::AllocationTracker;

/// How close aggregate usage is to the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Low,
    Moderate,
    High,
    Critical,
}

/// Payload passed to the pressure callback.
#[derive(Debug, Clone, Copy)]
pub struct PressureEvent {
    pub level: PressureLevel,
    pub current_usage: usize,
    pub limit: usize,
}

/// Callback fired when the optimization pass sees high pressure.
pub type PressureEventCallback = Arc<dyn Fn(PressureEvent) + Send + Sync>;

/// Aggregate snapshot across every component.
#[derive(Debug, Clone, Copy)]
pub struct GlobalStatistics {
    pub pool: PoolStatsSnapshot,
    pub packets: RecyclerStatsSnapshot,
    pub frames: RecyclerStatsSnapshot,
    pub cache: CacheStatsSnapshot,
    pub tracker: TrackerStatsSnapshot,
    pub total_usage: usize,
}

struct ManagerShared {
    config: ManagerConfig,
    pool: PoolAllocator,
    packets: PacketRecycler,
    frames: FrameRecycler,
    cache: CacheManager<String, Vec<u8>>,
    tracker: AllocationTracker,
    pressure_callback: Mutex<Option<PressureEventCallback>>,
    shutdown: AtomicBool,
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

impl ManagerShared {
    fn total_usage(&self) -> usize {
        self.pool.statistics().current_usage
            + self.packets.statistics().current_memory
            + self.frames.statistics().current_memory
            + self.cache.statistics().current_bytes
    }

    fn pressure_level(&self) -> PressureLevel {
        let fraction = self.total_usage() as f64 / self.config.max_total_memory as f64;
        if fraction < 0.5 {
            PressureLevel::Low
        } else if fraction < self.config.pressure_threshold {
            PressureLevel::Moderate
        } else if fraction < 0.95 {
            PressureLevel::High
        } else {
            PressureLevel::Critical
        }
    }

    fn collect_garbage(&self) {
        self.pool.defragment();
        self.packets.force_garbage_collection();
        self.frames.force_garbage_collection();
        self.cache.run_maintenance();
    }

    fn optimize(&self) {
        let level = self.pressure_level();
        if level < PressureLevel::High {
            return;
        }
        let usage = self.total_usage();
        warn!(?level, usage, "memory pressure, reclaiming");
        self.collect_garbage();
        let callback = self.pressure_callback.lock().clone();
        if let Some(callback) = callback {
            callback(PressureEvent {
                level,
                current_usage: usage,
                limit: self.config.max_total_memory,
            });
        }
    }
}

/// Facade over the whole memory subsystem.
pub struct MemoryManager {
    inner: Arc<ManagerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryManager {
    pub fn new(config: ManagerConfig) -> MemoryResult<Self> {
        Self::with_backend(config, Arc::new(HeapBackend))
    }

    /// Build the manager around a preset for `scenario` shaped by
    /// `strategy`.
    pub fn for_scenario(scenario: Scenario, strategy: Strategy) -> MemoryResult<Self> {
        Self::new(ManagerConfig::for_scenario(scenario, strategy))
    }

    /// Build with an explicit buffer backend for both recyclers.
    pub fn with_backend(
        config: ManagerConfig,
        backend: Arc<dyn BufferBackend>,
    ) -> MemoryResult<Self> {
        config.validate()?;
        info!(
            strategy = ?config.strategy,
            scenario = ?config.scenario,
            limit = %format_bytes(config.max_total_memory),
            "memory manager starting"
        );

        let inner = Arc::new(ManagerShared {
            pool: PoolAllocator::new(config.pool.clone())?,
            packets: PacketRecycler::with_backend(config.packets.clone(), Arc::clone(&backend))?,
            frames: FrameRecycler::with_backend(config.frames.clone(), backend)?,
            cache: CacheManager::new(config.cache.clone())?,
            tracker: AllocationTracker::new(config.tracker.clone())?,
            pressure_callback: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
            config,
        });

        let worker = if inner.config.enable_auto_optimization {
            let shared = Arc::clone(&inner);
            let interval = shared.config.optimization_interval;
            Some(
                std::thread::Builder::new()
                    .name("memory-optimizer".into())
                    .spawn(move || {
                        loop {
                            {
                                let mut guard = shared.wakeup_lock.lock();
                                shared.wakeup.wait_for(&mut guard, interval);
                            }
                            if shared.shutdown.load(Ordering::Acquire) {
                                break;
                            }
                            shared.optimize();
                        }
                    })
                    .expect("spawn memory optimizer"),
            )
        } else {
            None
        };

        Ok(Self {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Tracked allocation attributed to an "unknown" site.
    pub fn allocate(&self, size: usize) -> MemoryResult<PoolBlock> {
        self.allocate_for(size, "unknown")
    }

    /// Tracked allocation attributed to `site` (decoder name, filter, ...).
    pub fn allocate_for(&self, size: usize, site: &str) -> MemoryResult<PoolBlock> {
        let block = self.inner.pool.allocate(size)?;
        if self.inner.config.enable_tracking {
            self.inner.tracker.record_allocation(block.id(), block.len(), site);
        }
        Ok(block)
    }

    pub fn deallocate(&self, block: PoolBlock) {
        if self.inner.config.enable_tracking {
            self.inner.tracker.record_deallocation(block.id(), block.len());
        }
        self.inner.pool.deallocate(block);
    }

    pub fn pool(&self) -> &PoolAllocator {
        &self.inner.pool
    }

    pub fn packets(&self) -> &PacketRecycler {
        &self.inner.packets
    }

    pub fn frames(&self) -> &FrameRecycler {
        &self.inner.frames
    }

    pub fn cache(&self) -> &CacheManager<String, Vec<u8>> {
        &self.inner.cache
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.inner.tracker
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Aggregate usage across pool, recyclers, and cache.
    pub fn total_usage(&self) -> usize {
        self.inner.total_usage()
    }

    pub fn pressure_level(&self) -> PressureLevel {
        self.inner.pressure_level()
    }

    pub fn set_pressure_callback(
        &self,
        callback: impl Fn(PressureEvent) + Send + Sync + 'static,
    ) {
        *self.inner.pressure_callback.lock() = Some(Arc::new(callback));
    }

    /// Reclaim memory across every component right now.
    pub fn force_garbage_collection(&self) {
        self.inner.collect_garbage();
    }

    /// Run one optimization pass synchronously, exactly as the background
    /// worker would.
    pub fn run_optimization(&self) {
        self.inner.optimize();
    }

    pub fn statistics(&self) -> GlobalStatistics {
        GlobalStatistics {
            pool: self.inner.pool.statistics(),
            packets: self.inner.packets.statistics(),
            frames: self.inner.frames.statistics(),
            cache: self.inner.cache.statistics(),
            tracker: self.inner.tracker.statistics(),
            total_usage: self.inner.total_usage(),
        }
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "memory manager: {} used of {} ({:?} pressure)",
            format_bytes(self.total_usage()),
            format_bytes(self.inner.config.max_total_memory),
            self.pressure_level(),
        );
        out.push_str(&self.inner.pool.report());
        out.push_str(&self.inner.packets.report());
        out.push_str(&self.inner.frames.report());
        out.push_str(&self.inner.cache.report());
        out.push_str(&self.inner.tracker.report());
        out
    }

    /// Stop the optimizer and shut every component down, in dependency
    /// order.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.inner.cache.shutdown();
        self.inner.packets.shutdown();
        self.inner.frames.shutdown();
        self.inner.tracker.shutdown();
        self.inner.pool.shutdown();
        info!("memory manager stopped");
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
