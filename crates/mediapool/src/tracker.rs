//! Allocation tracking and leak detection
//!
//! Tracks live allocations in a bounded ledger keyed by allocation id,
//! aggregates per-site hotspots and a size distribution, keeps a usage
//! history ring, and fires an alert callback when usage crosses the
//! configured threshold. A background thread records history snapshots.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::config::TrackerConfig;
use crate::error::MemoryResult;
use crate::stats::{bump_peak, format_bytes, TrackerStats, TrackerStatsSnapshot};

/// Callback fired when current usage crosses the alert threshold.
pub type AlertCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// One live allocation.
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    pub id: u64,
    pub size: usize,
    pub at: Instant,
    pub site: String,
    pub thread: ThreadId,
}

/// Point-in-time usage sample for the history ring.
#[derive(Debug, Clone, Copy)]
pub struct UsageSnapshot {
    pub taken_at: SystemTime,
    pub current_usage: usize,
    pub peak_usage: usize,
    pub live_allocations: usize,
}

/// Per-site aggregate for hotspot reporting.
#[derive(Debug, Clone)]
pub struct Hotspot {
    pub site: String,
    pub total_bytes: usize,
    pub count: u64,
}

struct Ledger {
    records: FxHashMap<u64, AllocationRecord>,
    // Insertion order for bounded eviction.
    order: VecDeque<u64>,
}

#[derive(Default)]
struct SiteAggregate {
    total_bytes: usize,
    count: u64,
}

/// Size distribution buckets: <1 KiB, <64 KiB, <1 MiB, and above.
const BUCKET_BOUNDS: [usize; 3] = [1024, 64 * 1024, 1024 * 1024];
pub const BUCKET_LABELS: [&str; 4] = ["<1KiB", "<64KiB", "<1MiB", ">=1MiB"];

struct TrackerShared {
    config: TrackerConfig,
    stats: TrackerStats,
    ledger: Mutex<Ledger>,
    hotspots: Mutex<FxHashMap<String, SiteAggregate>>,
    history: Mutex<VecDeque<UsageSnapshot>>,
    buckets: [AtomicU64; 4],
    alert_callback: Mutex<Option<AlertCallback>>,
    last_alert: Mutex<Option<Instant>>,
    shutdown: AtomicBool,
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

impl TrackerShared {
    fn take_snapshot(&self) -> UsageSnapshot {
        let snapshot = UsageSnapshot {
            taken_at: SystemTime::now(),
            current_usage: self.stats.current_usage.load(Ordering::Relaxed),
            peak_usage: self.stats.peak_usage.load(Ordering::Relaxed),
            live_allocations: self.ledger.lock().records.len(),
        };
        let mut history = self.history.lock();
        if history.len() >= self.config.max_history {
            history.pop_front();
        }
        history.push_back(snapshot);
        snapshot
    }
}

/// Allocation tracker with leak detection.
pub struct AllocationTracker {
    inner: Arc<TrackerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AllocationTracker {
    pub fn new(config: TrackerConfig) -> MemoryResult<Self> {
        config.validate()?;
        let inner = Arc::new(TrackerShared {
            config,
            stats: TrackerStats::default(),
            ledger: Mutex::new(Ledger {
                records: FxHashMap::default(),
                order: VecDeque::new(),
            }),
            hotspots: Mutex::new(FxHashMap::default()),
            history: Mutex::new(VecDeque::new()),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            alert_callback: Mutex::new(None),
            last_alert: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        });

        let worker = inner.config.history_interval.map(|interval| {
            let shared = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("allocation-tracker".into())
                .spawn(move || {
                    loop {
                        {
                            let mut guard = shared.wakeup_lock.lock();
                            shared.wakeup.wait_for(&mut guard, interval);
                        }
                        if shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        shared.take_snapshot();
                    }
                })
                .expect("spawn allocation tracker worker")
        });

        Ok(Self {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Record a new allocation under `id`.
    pub fn record_allocation(&self, id: u64, size: usize, site: impl Into<String>) {
        let site = site.into();
        let stats = &self.inner.stats;
        stats.allocation_count.fetch_add(1, Ordering::Relaxed);
        stats.total_allocated.fetch_add(size, Ordering::Relaxed);
        let usage = stats.current_usage.fetch_add(size, Ordering::Relaxed) + size;
        bump_peak(&stats.peak_usage, usage);

        let bucket = BUCKET_BOUNDS.iter().position(|&b| size < b).unwrap_or(3);
        self.inner.buckets[bucket].fetch_add(1, Ordering::Relaxed);

        {
            let mut hotspots = self.inner.hotspots.lock();
            let aggregate = hotspots.entry(site.clone()).or_default();
            aggregate.total_bytes += size;
            aggregate.count += 1;
        }

        if self.inner.config.enable_leak_detection {
            let mut ledger = self.inner.ledger.lock();
            if ledger.records.len() >= self.inner.config.max_allocations {
                // Bounded ledger: forget the oldest record still live.
                while let Some(oldest) = ledger.order.pop_front() {
                    if ledger.records.remove(&oldest).is_some() {
                        break;
                    }
                }
            }
            ledger.records.insert(
                id,
                AllocationRecord {
                    id,
                    size,
                    at: Instant::now(),
                    site,
                    thread: std::thread::current().id(),
                },
            );
            ledger.order.push_back(id);
        }

        self.check_alert(usage);
    }

    /// Record the matching deallocation. Returns false when `id` was never
    /// tracked (or already evicted from the bounded ledger); a duplicate or
    /// unknown id leaves every counter untouched.
    pub fn record_deallocation(&self, id: u64, size: usize) -> bool {
        let stats = &self.inner.stats;
        if !self.inner.config.enable_leak_detection {
            stats.free_count.fetch_add(1, Ordering::Relaxed);
            stats.total_freed.fetch_add(size, Ordering::Relaxed);
            stats.current_usage.fetch_sub(size, Ordering::Relaxed);
            return true;
        }

        // The ledger decides first; the stored record carries the size the
        // allocation was actually booked with.
        let Some(record) = self.inner.ledger.lock().records.remove(&id) else {
            return false;
        };
        stats.free_count.fetch_add(1, Ordering::Relaxed);
        stats.total_freed.fetch_add(record.size, Ordering::Relaxed);
        stats.current_usage.fetch_sub(record.size, Ordering::Relaxed);
        true
    }

    fn check_alert(&self, usage: usize) {
        if usage <= self.inner.config.alert_threshold {
            return;
        }
        {
            let mut last = self.inner.last_alert.lock();
            let now = Instant::now();
            if last.is_some_and(|at| now.duration_since(at) < self.inner.config.alert_cooldown) {
                return;
            }
            *last = Some(now);
        }
        warn!(usage, "tracked memory usage above alert threshold");
        // Run the callback with no tracker lock held.
        let callback = self.inner.alert_callback.lock().clone();
        if let Some(callback) = callback {
            callback(usage);
        }
    }

    pub fn set_alert_callback(&self, callback: impl Fn(usize) + Send + Sync + 'static) {
        *self.inner.alert_callback.lock() = Some(Arc::new(callback));
    }

    /// Live allocations older than `min_age`, oldest first.
    pub fn detect_leaks(&self, min_age: Duration) -> Vec<AllocationRecord> {
        let now = Instant::now();
        let ledger = self.inner.ledger.lock();
        let mut leaks: Vec<AllocationRecord> = ledger
            .records
            .values()
            .filter(|record| now.duration_since(record.at) >= min_age)
            .cloned()
            .collect();
        drop(ledger);
        leaks.sort_by_key(|record| record.at);
        self.inner
            .stats
            .leak_count
            .store(leaks.len() as u64, Ordering::Relaxed);
        if !leaks.is_empty() {
            info!(count = leaks.len(), "possible leaks detected");
        }
        leaks
    }

    /// Live allocations older than the configured leak age.
    pub fn leaks(&self) -> Vec<AllocationRecord> {
        self.detect_leaks(self.inner.config.leak_age)
    }

    /// Top allocation sites by total bytes.
    pub fn hotspots(&self, top_n: usize) -> Vec<Hotspot> {
        let hotspots = self.inner.hotspots.lock();
        let mut all: Vec<Hotspot> = hotspots
            .iter()
            .map(|(site, aggregate)| Hotspot {
                site: site.clone(),
                total_bytes: aggregate.total_bytes,
                count: aggregate.count,
            })
            .collect();
        drop(hotspots);
        all.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));
        all.truncate(top_n);
        all
    }

    /// Allocation counts per size bucket, see [`BUCKET_LABELS`].
    pub fn size_distribution(&self) -> [u64; 4] {
        std::array::from_fn(|i| self.inner.buckets[i].load(Ordering::Relaxed))
    }

    /// Take a usage snapshot now and append it to the history ring.
    pub fn take_snapshot(&self) -> UsageSnapshot {
        self.inner.take_snapshot()
    }

    pub fn history(&self) -> Vec<UsageSnapshot> {
        self.inner.history.lock().iter().copied().collect()
    }

    pub fn statistics(&self) -> TrackerStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// No live allocation is past the leak age and usage is below the alert
    /// threshold.
    pub fn is_healthy(&self) -> bool {
        self.inner.stats.current_usage.load(Ordering::Relaxed)
            <= self.inner.config.alert_threshold
            && self.detect_leaks(self.inner.config.leak_age).is_empty()
    }

    /// Forget everything tracked so far. Counters, ledger, hotspots, and
    /// history all restart from zero.
    pub fn reset(&self) {
        self.inner.stats.reset();
        let mut ledger = self.inner.ledger.lock();
        ledger.records.clear();
        ledger.order.clear();
        drop(ledger);
        self.inner.hotspots.lock().clear();
        self.inner.history.lock().clear();
        for bucket in &self.inner.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }

    pub fn report(&self) -> String {
        let stats = self.statistics();
        let mut out = String::new();
        let _ = writeln!(out, "allocation tracker");
        let _ = writeln!(
            out,
            "  usage: {} current, {} peak, {} live records",
            format_bytes(stats.current_usage),
            format_bytes(stats.peak_usage),
            self.inner.ledger.lock().records.len(),
        );
        let _ = writeln!(
            out,
            "  allocations: {}, frees: {}, avg size {}",
            stats.allocation_count,
            stats.free_count,
            format_bytes(stats.average_allocation_size() as usize),
        );
        let distribution = self.size_distribution();
        let _ = write!(out, "  sizes:");
        for (label, count) in BUCKET_LABELS.iter().zip(distribution) {
            let _ = write!(out, " {label}={count}");
        }
        let _ = writeln!(out);
        for hotspot in self.hotspots(5) {
            let _ = writeln!(
                out,
                "  hotspot {}: {} over {} allocations",
                hotspot.site,
                format_bytes(hotspot.total_bytes),
                hotspot.count
            );
        }
        out
    }

    /// Stop the history worker. Recording keeps working afterwards.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AllocationTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn quiet_config() -> TrackerConfig {
        TrackerConfig {
            history_interval: None,
            ..TrackerConfig::default()
        }
    }

    #[test]
    fn alloc_free_round_trip() {
        let tracker = AllocationTracker::new(quiet_config()).unwrap();
        tracker.record_allocation(1, 4096, "decoder");
        assert_eq!(tracker.statistics().current_usage, 4096);

        assert!(tracker.record_deallocation(1, 4096));
        assert!(!tracker.record_deallocation(1, 4096));
        let stats = tracker.statistics();
        assert_eq!(stats.current_usage, 0);
        assert_eq!(stats.peak_usage, 4096);
    }

    #[test]
    fn duplicate_free_leaves_counters_alone() {
        let tracker = AllocationTracker::new(quiet_config()).unwrap();
        tracker.record_allocation(1, 4096, "decoder");
        assert!(tracker.record_deallocation(1, 4096));

        assert!(!tracker.record_deallocation(1, 4096));
        assert!(!tracker.record_deallocation(2, 64));
        let stats = tracker.statistics();
        assert_eq!(stats.current_usage, 0);
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.total_freed, 4096);
        assert!(tracker.is_healthy());
    }

    #[test]
    fn leaks_are_age_filtered() {
        let tracker = AllocationTracker::new(quiet_config()).unwrap();
        tracker.record_allocation(1, 100, "old");
        std::thread::sleep(Duration::from_millis(20));
        tracker.record_allocation(2, 100, "fresh");

        let leaks = tracker.detect_leaks(Duration::from_millis(10));
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].site, "old");
        assert_eq!(tracker.statistics().leak_count, 1);

        tracker.record_deallocation(1, 100);
        assert!(tracker.detect_leaks(Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn ledger_is_bounded() {
        let config = TrackerConfig {
            max_allocations: 3,
            ..quiet_config()
        };
        let tracker = AllocationTracker::new(config).unwrap();
        for id in 0..5 {
            tracker.record_allocation(id, 10, "site");
        }
        // Oldest two records were evicted; their frees report untracked.
        assert!(!tracker.record_deallocation(0, 10));
        assert!(tracker.record_deallocation(4, 10));
    }

    #[test]
    fn hotspots_rank_by_bytes() {
        let tracker = AllocationTracker::new(quiet_config()).unwrap();
        tracker.record_allocation(1, 10_000, "decoder");
        tracker.record_allocation(2, 100, "muxer");
        tracker.record_allocation(3, 10_000, "decoder");

        let hotspots = tracker.hotspots(2);
        assert_eq!(hotspots[0].site, "decoder");
        assert_eq!(hotspots[0].total_bytes, 20_000);
        assert_eq!(hotspots[0].count, 2);
        assert_eq!(hotspots[1].site, "muxer");
    }

    #[test]
    fn size_distribution_buckets() {
        let tracker = AllocationTracker::new(quiet_config()).unwrap();
        tracker.record_allocation(1, 100, "a");
        tracker.record_allocation(2, 2048, "a");
        tracker.record_allocation(3, 100_000, "a");
        tracker.record_allocation(4, 5_000_000, "a");
        assert_eq!(tracker.size_distribution(), [1, 1, 1, 1]);
    }

    #[test]
    fn alert_fires_once_per_cooldown() {
        let config = TrackerConfig {
            alert_threshold: 1000,
            alert_cooldown: Duration::from_secs(60),
            ..quiet_config()
        };
        let tracker = AllocationTracker::new(config).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        tracker.set_alert_callback(move |usage| {
            assert!(usage > 1000);
            fired_in_cb.fetch_add(1, Ordering::Relaxed);
        });

        tracker.record_allocation(1, 2000, "a");
        tracker.record_allocation(2, 2000, "a");
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn history_ring_is_bounded() {
        let config = TrackerConfig {
            max_history: 2,
            ..quiet_config()
        };
        let tracker = AllocationTracker::new(config).unwrap();
        tracker.record_allocation(1, 10, "a");
        for _ in 0..5 {
            tracker.take_snapshot();
        }
        let history = tracker.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].current_usage, 10);
    }

    #[test]
    fn reset_clears_everything() {
        let tracker = AllocationTracker::new(quiet_config()).unwrap();
        tracker.record_allocation(1, 100, "a");
        tracker.take_snapshot();
        tracker.reset();

        assert_eq!(tracker.statistics().current_usage, 0);
        assert!(tracker.hotspots(10).is_empty());
        assert!(tracker.history().is_empty());
        assert_eq!(tracker.size_distribution(), [0, 0, 0, 0]);
    }
}
