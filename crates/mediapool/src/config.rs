//! Configuration surface for every pool component
//!
//! All config structs are serde-friendly, carry sensible defaults for a
//! multi-stream media pipeline, and are validated once at construction time.
//! Strategy and scenario presets rewrite the component configs before any
//! component is built; they never mutate a live component.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{EvictionPolicy, Tier};
use crate::error::{MemoryError, MemoryResult};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Layered pool allocator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Small class block size (audio frames, control payloads)
    pub small_block_size: usize,
    /// Medium class block size (typical compressed video frames)
    pub medium_block_size: usize,
    /// Large class block size (keyframes, high-bitrate frames)
    pub large_block_size: usize,
    /// Blocks carved per chunk, per class
    pub small_blocks_per_chunk: usize,
    pub medium_blocks_per_chunk: usize,
    pub large_blocks_per_chunk: usize,
    /// Ceiling on total carved chunk bytes; requests beyond it fall back to
    /// the system allocator
    pub max_pool_size: usize,
    /// Default alignment for returned blocks (SIMD-friendly)
    pub alignment: usize,
    /// Carve one small chunk eagerly at construction
    pub prewarm_small: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            small_block_size: KIB,
            medium_block_size: 64 * KIB,
            large_block_size: MIB,
            small_blocks_per_chunk: 256,
            medium_blocks_per_chunk: 64,
            large_blocks_per_chunk: 16,
            max_pool_size: 512 * MIB,
            alignment: 32,
            prewarm_small: true,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> MemoryResult<()> {
        if self.small_block_size == 0 {
            return Err(MemoryError::invalid_config("small_block_size must be > 0"));
        }
        if self.medium_block_size <= self.small_block_size
            || self.large_block_size <= self.medium_block_size
        {
            return Err(MemoryError::invalid_config(
                "block sizes must be strictly increasing across classes",
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(MemoryError::invalid_config(
                "alignment must be a power of two",
            ));
        }
        for (name, blocks) in [
            ("small_blocks_per_chunk", self.small_blocks_per_chunk),
            ("medium_blocks_per_chunk", self.medium_blocks_per_chunk),
            ("large_blocks_per_chunk", self.large_blocks_per_chunk),
        ] {
            if blocks == 0 {
                return Err(MemoryError::invalid_config(format!("{name} must be > 0")));
            }
        }
        let largest_chunk = self.large_block_size * self.large_blocks_per_chunk;
        if self.max_pool_size < largest_chunk {
            return Err(MemoryError::invalid_config(
                "max_pool_size smaller than a single large chunk",
            ));
        }
        Ok(())
    }
}

/// Generic object pool configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObjectPoolConfig {
    /// Objects created eagerly at construction
    pub initial_size: usize,
    /// Ceiling on live + pooled objects
    pub max_size: usize,
    /// Create new objects when the queue is drained
    pub auto_expand: bool,
}

impl Default for ObjectPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 16,
            max_size: 128,
            auto_expand: true,
        }
    }
}

impl ObjectPoolConfig {
    pub fn validate(&self) -> MemoryResult<()> {
        if self.max_size == 0 {
            return Err(MemoryError::invalid_config("max_size must be > 0"));
        }
        if self.initial_size > self.max_size {
            return Err(MemoryError::invalid_config(
                "initial_size must not exceed max_size",
            ));
        }
        Ok(())
    }
}

/// Packet recycler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecyclerConfig {
    /// Distinct target-size sub-pools allowed per size category
    pub max_pools_per_category: usize,
    /// Ready-buffer capacity of each sub-pool
    pub packets_per_pool: usize,
    /// Aggregate tracked memory ceiling for this recycler
    pub max_total_memory: usize,
    /// Fraction of `max_total_memory` that triggers the pressure path
    pub pressure_threshold: f64,
    /// Background cleanup period; `None` disables the worker thread
    pub cleanup_interval: Option<Duration>,
}

impl Default for PacketRecyclerConfig {
    fn default() -> Self {
        Self {
            max_pools_per_category: 8,
            packets_per_pool: 32,
            max_total_memory: 128 * MIB,
            pressure_threshold: 0.8,
            cleanup_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl PacketRecyclerConfig {
    pub fn validate(&self) -> MemoryResult<()> {
        if self.max_pools_per_category == 0 || self.packets_per_pool == 0 {
            return Err(MemoryError::invalid_config(
                "pool counts and capacities must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.pressure_threshold) {
            return Err(MemoryError::invalid_config(
                "pressure_threshold must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// Frame recycler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecyclerConfig {
    /// Distinct frame-spec sub-pools allowed
    pub max_pools: usize,
    /// Ready-frame capacity of each sub-pool
    pub frames_per_pool: usize,
    /// Reject single frames larger than this
    pub max_frame_size: usize,
    /// Aggregate tracked memory ceiling for this recycler
    pub max_total_memory: usize,
    /// Fraction of `max_total_memory` that triggers the pressure path
    pub pressure_threshold: f64,
    /// Sub-pools idle longer than this are dropped by `cleanup`
    pub max_pool_idle: Duration,
    /// Background cleanup period; `None` disables the worker thread
    pub cleanup_interval: Option<Duration>,
}

impl Default for FrameRecyclerConfig {
    fn default() -> Self {
        Self {
            max_pools: 32,
            frames_per_pool: 16,
            max_frame_size: 64 * MIB,
            max_total_memory: 256 * MIB,
            pressure_threshold: 0.8,
            max_pool_idle: Duration::from_secs(60),
            cleanup_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl FrameRecyclerConfig {
    pub fn validate(&self) -> MemoryResult<()> {
        if self.max_pools == 0 || self.frames_per_pool == 0 {
            return Err(MemoryError::invalid_config(
                "pool counts and capacities must be > 0",
            ));
        }
        if self.max_frame_size == 0 {
            return Err(MemoryError::invalid_config("max_frame_size must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.pressure_threshold) {
            return Err(MemoryError::invalid_config(
                "pressure_threshold must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// Per-tier cache configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierConfig {
    /// Entry capacity of the tier
    pub capacity: usize,
    /// Eviction policy applied when the tier is full
    pub policy: EvictionPolicy,
}

impl TierConfig {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self { capacity, policy }
    }
}

/// Multi-tier cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub l1: TierConfig,
    pub l2: TierConfig,
    pub l3: TierConfig,
    /// Entries older than this are purged by maintenance; `None` disables TTL
    pub ttl: Option<Duration>,
    /// Access count at which maintenance promotes an entry one tier up
    pub promote_threshold: u64,
    /// Access count at or below which an idle entry is demoted one tier down
    pub demote_threshold: u64,
    /// Idle duration before a cold entry becomes a demotion candidate
    pub demote_idle: Duration,
    /// Victims evicted from L1/L2 are reinserted one tier down instead of
    /// being dropped
    pub demote_on_evict: bool,
    /// Background maintenance period; `None` disables the worker thread
    pub maintenance_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: TierConfig::new(64, EvictionPolicy::Lru),
            l2: TierConfig::new(256, EvictionPolicy::Lfu),
            l3: TierConfig::new(1024, EvictionPolicy::Fifo),
            ttl: Some(Duration::from_secs(300)),
            promote_threshold: 3,
            demote_threshold: 1,
            demote_idle: Duration::from_secs(30),
            demote_on_evict: true,
            maintenance_interval: Some(Duration::from_secs(10)),
        }
    }
}

impl CacheConfig {
    pub fn tier(&self, tier: Tier) -> TierConfig {
        match tier {
            Tier::L1 => self.l1,
            Tier::L2 => self.l2,
            Tier::L3 => self.l3,
        }
    }

    pub fn validate(&self) -> MemoryResult<()> {
        for (name, cfg) in [("l1", self.l1), ("l2", self.l2), ("l3", self.l3)] {
            if cfg.capacity == 0 {
                return Err(MemoryError::invalid_config(format!(
                    "{name} capacity must be > 0"
                )));
            }
        }
        if self.promote_threshold == 0 {
            return Err(MemoryError::invalid_config(
                "promote_threshold must be > 0",
            ));
        }
        Ok(())
    }
}

/// Allocation tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Keep a per-allocation ledger for leak detection
    pub enable_leak_detection: bool,
    /// Ledger capacity; the oldest record is evicted beyond this
    pub max_allocations: usize,
    /// Live records older than this count as leaks
    pub leak_age: Duration,
    /// Usage above this fires the alert callback
    pub alert_threshold: usize,
    /// Minimum spacing between alert callback invocations
    pub alert_cooldown: Duration,
    /// Period of the history snapshot thread; `None` disables it
    pub history_interval: Option<Duration>,
    /// History ring capacity
    pub max_history: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enable_leak_detection: true,
            max_allocations: 100_000,
            leak_age: Duration::from_secs(60),
            alert_threshold: 100 * MIB,
            alert_cooldown: Duration::from_secs(30),
            history_interval: Some(Duration::from_secs(5)),
            max_history: 1000,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> MemoryResult<()> {
        if self.max_allocations == 0 {
            return Err(MemoryError::invalid_config("max_allocations must be > 0"));
        }
        if self.max_history == 0 {
            return Err(MemoryError::invalid_config("max_history must be > 0"));
        }
        Ok(())
    }
}

/// Global memory management strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Large pools, aggressive prewarm, relaxed ceilings
    Performance,
    /// Small pools, eager reclamation, tight ceilings
    MemorySaving,
    /// Middle ground (default)
    Balanced,
    /// Component configs taken exactly as provided
    Custom,
}

/// Workload scenario presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scenario {
    SingleStream,
    MultiStream,
    RealTime,
    Batch,
    LowLatency,
    HighThroughput,
}

/// Orchestrator configuration composing every component config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub strategy: Strategy,
    pub scenario: Scenario,
    /// Aggregate memory ceiling across all components
    pub max_total_memory: usize,
    /// Route manager allocations through the allocation tracker
    pub enable_tracking: bool,
    /// Run the background optimization thread
    pub enable_auto_optimization: bool,
    /// Period of the optimization thread
    pub optimization_interval: Duration,
    /// Usage fraction at which the manager reacts to pressure
    pub pressure_threshold: f64,

    pub pool: PoolConfig,
    pub packets: PacketRecyclerConfig,
    pub frames: FrameRecyclerConfig,
    pub cache: CacheConfig,
    pub tracker: TrackerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Balanced,
            scenario: Scenario::MultiStream,
            max_total_memory: 1024 * MIB,
            enable_tracking: true,
            enable_auto_optimization: true,
            optimization_interval: Duration::from_secs(60),
            pressure_threshold: 0.85,
            pool: PoolConfig::default(),
            packets: PacketRecyclerConfig::default(),
            frames: FrameRecyclerConfig::default(),
            cache: CacheConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Build a config pre-set for a workload scenario, then shaped by the
    /// given strategy.
    pub fn for_scenario(scenario: Scenario, strategy: Strategy) -> Self {
        let mut config = Self {
            scenario,
            strategy,
            ..Self::default()
        };
        config.apply_scenario();
        config.apply_strategy();
        config
    }

    fn apply_scenario(&mut self) {
        match self.scenario {
            Scenario::SingleStream => {
                self.pool.small_blocks_per_chunk = 128;
                self.packets.packets_per_pool = 16;
                self.frames.frames_per_pool = 8;
                self.cache.l1.capacity = 32;
            }
            Scenario::MultiStream => {
                // Defaults already target multi-stream decode.
            }
            Scenario::RealTime | Scenario::LowLatency => {
                self.pool.prewarm_small = true;
                self.packets.packets_per_pool = 64;
                self.frames.frames_per_pool = 32;
                self.cache.maintenance_interval = Some(Duration::from_secs(5));
                self.optimization_interval = Duration::from_secs(10);
            }
            Scenario::Batch => {
                self.pool.prewarm_small = false;
                self.cache.ttl = None;
                self.optimization_interval = Duration::from_secs(300);
            }
            Scenario::HighThroughput => {
                self.pool.max_pool_size = 1024 * MIB;
                self.packets.max_total_memory = 256 * MIB;
                self.frames.max_total_memory = 512 * MIB;
                self.cache.l3.capacity = 4096;
            }
        }
    }

    fn apply_strategy(&mut self) {
        match self.strategy {
            Strategy::Performance => {
                self.pool.max_pool_size = self.pool.max_pool_size.saturating_mul(2);
                self.packets.packets_per_pool *= 2;
                self.frames.frames_per_pool *= 2;
                self.pressure_threshold = 0.95;
            }
            Strategy::MemorySaving => {
                self.pool.max_pool_size /= 4;
                self.pool.prewarm_small = false;
                self.packets.packets_per_pool = (self.packets.packets_per_pool / 2).max(1);
                self.frames.frames_per_pool = (self.frames.frames_per_pool / 2).max(1);
                self.packets.max_total_memory /= 2;
                self.frames.max_total_memory /= 2;
                self.pressure_threshold = 0.7;
            }
            Strategy::Balanced | Strategy::Custom => {}
        }
    }

    pub fn validate(&self) -> MemoryResult<()> {
        if self.max_total_memory == 0 {
            return Err(MemoryError::invalid_config("max_total_memory must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.pressure_threshold) {
            return Err(MemoryError::invalid_config(
                "pressure_threshold must be within [0, 1]",
            ));
        }
        self.pool.validate()?;
        self.packets.validate()?;
        self.frames.validate()?;
        self.cache.validate()?;
        self.tracker.validate()?;
        Ok(())
    }
}
