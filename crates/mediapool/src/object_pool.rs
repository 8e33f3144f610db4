//! Generic object pool with RAII return-on-drop
//!
//! Objects are created by a caller-supplied factory and scrubbed by an
//! explicit reset closure before re-entering the queue. `acquire` returns
//! `None` when the pool is drained and expansion is disabled or capped.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::ObjectPoolConfig;
use crate::error::MemoryResult;
use crate::stats::{ObjectPoolStats, ObjectPoolStatsSnapshot};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

struct PoolShared<T> {
    config: ObjectPoolConfig,
    queue: Mutex<VecDeque<T>>,
    factory: Factory<T>,
    reset: Reset<T>,
    stats: ObjectPoolStats,
}

impl<T> PoolShared<T> {
    fn recycle(&self, mut obj: T) {
        (self.reset)(&mut obj);
        self.stats.record_release();
        let mut queue = self.queue.lock();
        if queue.len() < self.config.max_size {
            queue.push_back(obj);
        }
        // Over-capacity objects are simply dropped.
    }
}

/// RAII guard for a pooled object. Returns the object on drop.
pub struct PooledObject<T> {
    obj: Option<T>,
    pool: Weak<PoolShared<T>>,
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.obj.as_ref().expect("object taken")
    }
}

impl<T> DerefMut for PooledObject<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.obj.as_mut().expect("object taken")
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(obj) = self.obj.take() {
            // If the pool is gone the object just drops.
            if let Some(pool) = self.pool.upgrade() {
                pool.recycle(obj);
            }
        }
    }
}

/// Bounded pool of reusable objects.
pub struct ObjectPool<T> {
    inner: Arc<PoolShared<T>>,
}

impl<T> ObjectPool<T> {
    /// Create a pool whose objects need no scrubbing between uses.
    pub fn new(
        config: ObjectPoolConfig,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> MemoryResult<Self> {
        Self::with_reset(config, factory, |_| {})
    }

    /// Create a pool with an explicit reset closure, applied to every object
    /// exactly once before it re-enters the queue.
    pub fn with_reset(
        config: ObjectPoolConfig,
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> MemoryResult<Self> {
        config.validate()?;
        let inner = Arc::new(PoolShared {
            config,
            queue: Mutex::new(VecDeque::with_capacity(config.max_size)),
            factory: Box::new(factory),
            reset: Box::new(reset),
            stats: ObjectPoolStats::default(),
        });

        {
            let mut queue = inner.queue.lock();
            for _ in 0..config.initial_size {
                queue.push_back((inner.factory)());
                inner.stats.record_create();
            }
        }

        Ok(Self { inner })
    }

    /// Take an object from the pool.
    ///
    /// Returns `None` when the queue is empty and either expansion is
    /// disabled or `max_size` objects are already live.
    pub fn acquire(&self) -> Option<PooledObject<T>> {
        let pooled = self.inner.queue.lock().pop_front();
        let obj = match pooled {
            Some(obj) => obj,
            None => {
                // `in_use` is read outside the queue lock, so racing acquires
                // can briefly overshoot `max_size`; `recycle` enforces the
                // cap again by dropping over-capacity returns.
                if !self.inner.config.auto_expand
                    || self.inner.stats.in_use() >= self.inner.config.max_size
                {
                    return None;
                }
                self.inner.stats.record_create();
                (self.inner.factory)()
            }
        };
        self.inner.stats.record_acquire();
        Some(PooledObject {
            obj: Some(obj),
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Pre-create objects until `count` are queued (capped at `max_size`).
    pub fn warmup(&self, count: usize) {
        let mut queue = self.inner.queue.lock();
        let target = count.min(self.inner.config.max_size);
        while queue.len() < target {
            queue.push_back((self.inner.factory)());
            self.inner.stats.record_create();
        }
    }

    /// Drop every queued object. Objects currently out stay out and are
    /// re-queued normally.
    pub fn clear(&self) {
        self.inner.queue.lock().clear();
    }

    /// Objects waiting in the queue.
    pub fn available(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn statistics(&self) -> ObjectPoolStatsSnapshot {
        self.inner
            .stats
            .snapshot(self.inner.queue.lock().len())
    }
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_pool(config: ObjectPoolConfig) -> ObjectPool<Vec<u8>> {
        ObjectPool::with_reset(config, || Vec::with_capacity(64), Vec::clear).unwrap()
    }

    #[test]
    fn reset_runs_before_requeue() {
        let pool = counter_pool(ObjectPoolConfig {
            initial_size: 1,
            max_size: 4,
            auto_expand: true,
        });

        {
            let mut buf = pool.acquire().unwrap();
            buf.extend_from_slice(b"dirty");
        }
        let buf = pool.acquire().unwrap();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
    }

    #[test]
    fn exhaustion_without_expand_returns_none() {
        let pool = counter_pool(ObjectPoolConfig {
            initial_size: 2,
            max_size: 2,
            auto_expand: false,
        });

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        drop(a);
        assert!(pool.acquire().is_some());
        drop(b);
    }

    #[test]
    fn expansion_stops_at_max_size() {
        let pool = counter_pool(ObjectPoolConfig {
            initial_size: 0,
            max_size: 3,
            auto_expand: true,
        });

        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.statistics().current_in_use, 3);
        drop(held);
        assert_eq!(pool.statistics().current_in_use, 0);
    }

    #[test]
    fn warmup_fills_queue() {
        let pool = counter_pool(ObjectPoolConfig {
            initial_size: 0,
            max_size: 8,
            auto_expand: true,
        });
        pool.warmup(5);
        assert_eq!(pool.available(), 5);
        pool.warmup(100);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn hit_rate_reflects_reuse() {
        let pool = counter_pool(ObjectPoolConfig {
            initial_size: 4,
            max_size: 8,
            auto_expand: true,
        });
        for _ in 0..100 {
            let _obj = pool.acquire().unwrap();
        }
        let stats = pool.statistics();
        assert_eq!(stats.total_created, 4);
        assert_eq!(stats.total_acquired, 100);
        assert!(stats.hit_rate() > 0.9, "hit rate was {}", stats.hit_rate());
    }

    #[test]
    fn concurrent_acquire_release() {
        use std::thread;

        let pool = counter_pool(ObjectPoolConfig {
            initial_size: 8,
            max_size: 64,
            auto_expand: true,
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        if let Some(mut buf) = pool.acquire() {
                            buf.push(1);
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.statistics().current_in_use, 0);
    }
}
