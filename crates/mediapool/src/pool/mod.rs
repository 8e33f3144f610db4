//! Layered pool allocator with segregated size classes
//!
//! Requests are routed to a small, medium, or large class by size. Each
//! class carves aligned chunks and hands out fixed-size blocks through a
//! free-index stack. Requests the classes cannot serve (oversized,
//! over-aligned, or past the carve ceiling) fall back to the system
//! allocator. Every allocation is returned as a tagged `PoolBlock` handle;
//! deallocation consumes the handle, so a foreign pointer can never be fed
//! back into the pool.

mod chunk;
mod class;

pub use class::SizeClass;

use std::alloc::{Layout, alloc, dealloc};
use std::fmt::Write as _;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::stats::{PoolStats, PoolStatsSnapshot, format_bytes};

use class::{BlockIndex, LayeredClass};

/// Where a block's storage came from. Private so callers cannot forge
/// handles.
enum Provenance {
    Pool { class: SizeClass, index: BlockIndex },
    System { layout: Layout },
}

/// Owned handle to one allocation from a [`PoolAllocator`].
///
/// The handle is consumed by [`PoolAllocator::deallocate`]; dropping it
/// without deallocating leaks the block (the tracker reports such blocks).
pub struct PoolBlock {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
    id: u64,
    provenance: Provenance,
}

// Safety: the block owns its region exclusively until deallocated.
unsafe impl Send for PoolBlock {}

impl PoolBlock {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Requested length in bytes. The underlying block may be larger.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Monotonic allocation id, unique per allocator instance.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True when the block came from a pool class rather than the system
    /// allocator.
    #[inline]
    pub fn is_pooled(&self) -> bool {
        matches!(self.provenance, Provenance::Pool { .. })
    }
}

impl std::fmt::Debug for PoolBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBlock")
            .field("len", &self.len)
            .field("align", &self.align)
            .field("id", &self.id)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

/// Aggregate health view across the three classes.
#[derive(Debug, Clone, Copy)]
pub struct PoolHealthReport {
    pub fragmentation: f64,
    pub free_blocks: usize,
    pub total_blocks: usize,
    pub largest_run: usize,
    pub smallest_run: usize,
    pub average_run: f64,
    pub utilization: f64,
    pub healthy: bool,
}

/// Fragmentation above this marks the pool unhealthy.
const FRAGMENTATION_LIMIT: f64 = 0.8;

/// Segregated-class pool allocator.
pub struct PoolAllocator {
    config: PoolConfig,
    classes: [LayeredClass; 3],
    stats: PoolStats,
    carved_bytes: AtomicUsize,
    next_alloc_id: AtomicU64,
    shutdown: AtomicBool,
}

impl PoolAllocator {
    pub fn new(config: PoolConfig) -> MemoryResult<Self> {
        config.validate()?;
        let classes = [
            LayeredClass::new(
                SizeClass::Small,
                config.small_block_size,
                config.small_blocks_per_chunk,
                config.alignment,
            ),
            LayeredClass::new(
                SizeClass::Medium,
                config.medium_block_size,
                config.medium_blocks_per_chunk,
                config.alignment,
            ),
            LayeredClass::new(
                SizeClass::Large,
                config.large_block_size,
                config.large_blocks_per_chunk,
                config.alignment,
            ),
        ];

        let allocator = Self {
            config,
            classes,
            stats: PoolStats::default(),
            carved_bytes: AtomicUsize::new(0),
            next_alloc_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        };

        if allocator.config.prewarm_small {
            // Carve the first small chunk up front so the first frame of a
            // stream never pays the carve cost.
            let class = allocator.class(SizeClass::Small);
            let (index, _ptr, carved) = class.expand_and_allocate()?;
            class.release_block(index);
            allocator.carved_bytes.fetch_add(carved, Ordering::Relaxed);
        }

        Ok(allocator)
    }

    #[inline]
    fn class(&self, class: SizeClass) -> &LayeredClass {
        &self.classes[class as usize]
    }

    fn select_class(&self, size: usize) -> Option<SizeClass> {
        if size <= self.config.small_block_size {
            Some(SizeClass::Small)
        } else if size <= self.config.medium_block_size {
            Some(SizeClass::Medium)
        } else if size <= self.config.large_block_size {
            Some(SizeClass::Large)
        } else {
            None
        }
    }

    /// Allocate `size` bytes at the pool's default alignment.
    pub fn allocate(&self, size: usize) -> MemoryResult<PoolBlock> {
        self.allocate_aligned(size, self.config.alignment)
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Alignments above the pool's configured alignment bypass the classes
    /// and go straight to the system allocator.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> MemoryResult<PoolBlock> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(MemoryError::NotInitialized);
        }
        if size == 0 {
            return Err(MemoryError::invalid_params("allocation size must be > 0"));
        }
        if !align.is_power_of_two() {
            return Err(MemoryError::invalid_params(
                "alignment must be a power of two",
            ));
        }

        if align <= self.config.alignment {
            if let Some(class) = self.select_class(size) {
                return self.allocate_from_class(class, size, align);
            }
        }
        self.allocate_system(size, align)
    }

    fn allocate_from_class(
        &self,
        class: SizeClass,
        size: usize,
        align: usize,
    ) -> MemoryResult<PoolBlock> {
        let layered = self.class(class);

        // Fast path: a block is already free.
        if let Some((index, ptr)) = layered.allocate_block() {
            self.stats.record_alloc(size, true);
            return Ok(self.pooled_block(ptr, size, align, class, index));
        }

        // Slow path: carve a chunk if the ceiling allows it.
        let chunk_bytes = layered.chunk_bytes();
        let reserved = self.carved_bytes.fetch_add(chunk_bytes, Ordering::AcqRel);
        if reserved + chunk_bytes <= self.config.max_pool_size {
            match layered.expand_and_allocate() {
                Ok((index, ptr, _carved)) => {
                    self.stats.record_alloc(size, true);
                    return Ok(self.pooled_block(ptr, size, align, class, index));
                }
                Err(e) => {
                    self.carved_bytes.fetch_sub(chunk_bytes, Ordering::AcqRel);
                    warn!(class = class.name(), error = %e, "chunk carve failed, falling back to system");
                }
            }
        } else {
            self.carved_bytes.fetch_sub(chunk_bytes, Ordering::AcqRel);
            debug!(
                class = class.name(),
                "carve ceiling reached, falling back to system"
            );
        }

        self.allocate_system(size, align)
    }

    fn allocate_system(&self, size: usize, align: usize) -> MemoryResult<PoolBlock> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| MemoryError::invalid_params(format!("invalid layout: {e}")))?;
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or(MemoryError::OutOfMemory { size })?;

        self.stats.record_alloc(size, false);
        Ok(PoolBlock {
            ptr,
            len: size,
            align,
            id: self.next_alloc_id.fetch_add(1, Ordering::Relaxed),
            provenance: Provenance::System { layout },
        })
    }

    fn pooled_block(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
        class: SizeClass,
        index: BlockIndex,
    ) -> PoolBlock {
        PoolBlock {
            ptr,
            len: size,
            align,
            id: self.next_alloc_id.fetch_add(1, Ordering::Relaxed),
            provenance: Provenance::Pool { class, index },
        }
    }

    /// Return a block. Consuming the handle makes double-free and
    /// foreign-pointer free unrepresentable.
    pub fn deallocate(&self, block: PoolBlock) {
        self.stats.record_free(block.len);
        match block.provenance {
            Provenance::Pool { class, index } => self.class(class).release_block(index),
            Provenance::System { layout } => unsafe {
                dealloc(block.ptr.as_ptr(), layout);
            },
        }
    }

    pub fn statistics(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Bytes currently carved into chunks across all classes.
    pub fn carved_bytes(&self) -> usize {
        self.carved_bytes.load(Ordering::Relaxed)
    }

    pub fn chunk_count(&self, class: SizeClass) -> usize {
        self.class(class).chunk_count()
    }

    /// Aggregate fragmentation: per-class fragmentation weighted by each
    /// class's free block count.
    pub fn fragmentation_rate(&self) -> f64 {
        let mut free = 0usize;
        let mut weighted = 0.0;
        for class in SizeClass::ALL {
            let runs = self.class(class).free_runs();
            weighted += runs.fragmentation() * runs.free_blocks as f64;
            free += runs.free_blocks;
        }
        if free == 0 {
            return 0.0;
        }
        (weighted / free as f64).clamp(0.0, 1.0)
    }

    pub fn is_healthy(&self) -> bool {
        self.fragmentation_rate() <= FRAGMENTATION_LIMIT
            && self.carved_bytes() <= self.config.max_pool_size
    }

    pub fn health_report(&self) -> PoolHealthReport {
        let mut free_blocks = 0usize;
        let mut total_blocks = 0usize;
        let mut largest = 0usize;
        let mut smallest = usize::MAX;
        let mut run_count = 0usize;
        for class in SizeClass::ALL {
            let runs = self.class(class).free_runs();
            free_blocks += runs.free_blocks;
            total_blocks += runs.total_blocks;
            largest = largest.max(runs.largest_run);
            if runs.run_count > 0 {
                smallest = smallest.min(runs.smallest_run);
            }
            run_count += runs.run_count;
        }
        let average_run = if run_count > 0 {
            free_blocks as f64 / run_count as f64
        } else {
            0.0
        };
        let utilization = if total_blocks > 0 {
            1.0 - free_blocks as f64 / total_blocks as f64
        } else {
            0.0
        };
        let fragmentation = self.fragmentation_rate();
        PoolHealthReport {
            fragmentation,
            free_blocks,
            total_blocks,
            largest_run: largest,
            smallest_run: if smallest == usize::MAX { 0 } else { smallest },
            average_run,
            utilization,
            healthy: self.is_healthy(),
        }
    }

    /// Sort every class's free stack into address order. Returns the total
    /// number of contiguous free runs afterwards.
    pub fn defragment(&self) -> usize {
        SizeClass::ALL
            .iter()
            .map(|&class| self.class(class).defragment())
            .sum()
    }

    /// Human-readable usage report.
    pub fn report(&self) -> String {
        let stats = self.statistics();
        let health = self.health_report();
        let mut out = String::new();
        let _ = writeln!(out, "pool allocator");
        let _ = writeln!(
            out,
            "  usage: {} current, {} peak, {} carved",
            format_bytes(stats.current_usage),
            format_bytes(stats.peak_usage),
            format_bytes(self.carved_bytes()),
        );
        let _ = writeln!(
            out,
            "  allocations: {} total, {:.1}% pool hits",
            stats.allocation_count,
            stats.hit_rate() * 100.0
        );
        for class in SizeClass::ALL {
            let _ = writeln!(
                out,
                "  {} class: {} chunks of {}",
                class.name(),
                self.chunk_count(class),
                format_bytes(self.class(class).chunk_bytes()),
            );
        }
        let _ = writeln!(
            out,
            "  fragmentation: {:.1}% ({} free blocks, largest run {}), healthy: {}",
            health.fragmentation * 100.0,
            health.free_blocks,
            health.largest_run,
            health.healthy
        );
        out
    }

    /// Stop serving allocations. Outstanding blocks can still be returned.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
