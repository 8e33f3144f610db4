//! Memory and resource management for media pipelines
//!
//! Building blocks, composable or used standalone:
//!
//! - [`pool::PoolAllocator`]: segregated-class block allocator with system
//!   fallback and fragmentation analytics
//! - [`object_pool::ObjectPool`]: generic object pool with factory and
//!   reset closures
//! - [`recycler::PacketRecycler`] / [`recycler::FrameRecycler`]:
//!   size-categorized buffer recycling over pluggable backends
//! - [`cache::CacheManager`]: three-tier cache with per-tier eviction
//!   policies
//! - [`tracker::AllocationTracker`]: allocation ledger, hotspots, leak
//!   detection
//! - [`manager::MemoryManager`]: orchestrator wiring everything together

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod object_pool;
pub mod pool;
pub mod recycler;
pub mod stats;
pub mod tracker;

pub use cache::{CacheManager, EvictionPolicy, Tier, TierCodec};
pub use config::{
    CacheConfig, FrameRecyclerConfig, ManagerConfig, ObjectPoolConfig, PacketRecyclerConfig,
    PoolConfig, Scenario, Strategy, TierConfig, TrackerConfig,
};
pub use error::{MemoryError, MemoryResult};
pub use manager::{GlobalStatistics, MemoryManager, PressureEvent, PressureLevel};
pub use object_pool::{ObjectPool, PooledObject};
pub use pool::{PoolAllocator, PoolBlock, PoolHealthReport, SizeClass};
pub use recycler::{
    BackendRegistry, BufferBackend, FrameBuf, FrameLease, FrameRecycler, FrameSpec, HeapBackend,
    PacketBuf, PacketLease, PacketRecycler, PixelFormat, SharedFrame, SharedPacket, SizeCategory,
};
pub use tracker::{AllocationRecord, AllocationTracker, Hotspot, UsageSnapshot};
