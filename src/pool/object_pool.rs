//! Generic pool over values implementing [`Poolable`].
//!
//! The free list is a `crossbeam::queue::SegQueue` (unbounded, lock-free)
//! paired with an `AtomicUsize` tracking how many items are currently parked
//! in it; capacity is enforced by checking that counter before a push rather
//! than by the queue's own bound. This is what lets `set_max_capacity` raise
//! or lower the soft cap at runtime without migrating the queue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::SegQueue;

/// Capability required of values held in an [`ObjectPool`].
///
/// `reset_for_pool` runs once, right before an instance re-enters the free
/// list, and must leave it equivalent to a freshly constructed value.
pub trait Poolable: Default + Send {
    /// Clears any per-use state so the instance is indistinguishable from new.
    fn reset_for_pool(&mut self);
}

/// Point-in-time counters for an [`ObjectPool`].
#[derive(Debug, Clone, Copy)]
pub struct ObjectPoolStats {
    /// Total successful `get` calls since construction.
    pub gets: u64,
    /// Total successful `return_to_pool` calls since construction.
    pub returns: u64,
    /// Total instances constructed (preallocated + created on miss).
    pub created: u64,
    /// Seconds since the pool was constructed.
    pub uptime_secs: u64,
}

/// A bounded, thread-safe pool of reusable `T` instances.
///
/// `Get` draws from the free list or constructs a new instance on miss;
/// `Return` resets and reinserts, dropping the instance if the pool is at
/// capacity. The capacity is a soft, adjustable cap (see
/// [`Self::set_max_capacity`]), not a fixed structural bound.
pub struct ObjectPool<T: Poolable> {
    free: SegQueue<T>,
    len: AtomicUsize,
    max_capacity: AtomicUsize,
    gets: AtomicU64,
    returns: AtomicU64,
    created: AtomicU64,
    started_at: Instant,
}

impl<T: Poolable> ObjectPool<T> {
    /// Creates a pool with the given soft capacity and no preallocated items.
    pub fn new(max_capacity: usize) -> Arc<Self> {
        Self::with_preallocated(max_capacity, 0)
    }

    /// Creates a pool with `max_capacity` slots, eagerly constructing
    /// `preallocate` instances (clamped to `max_capacity`).
    pub fn with_preallocated(max_capacity: usize, preallocate: usize) -> Arc<Self> {
        let cap = max_capacity.max(1);
        let pool = Arc::new(Self {
            free: SegQueue::new(),
            len: AtomicUsize::new(0),
            max_capacity: AtomicUsize::new(cap),
            gets: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            created: AtomicU64::new(0),
            started_at: instant_now(),
        });

        for _ in 0..preallocate.min(cap) {
            pool.free.push(T::default());
            pool.len.fetch_add(1, Ordering::Relaxed);
            pool.created.fetch_add(1, Ordering::Relaxed);
        }
        pool
    }

    /// Returns a pooled instance, or a freshly constructed one if the free
    /// list was empty.
    pub fn get(&self) -> T {
        self.gets.fetch_add(1, Ordering::Relaxed);
        match self.free.pop() {
            Some(item) => {
                self.len.fetch_sub(1, Ordering::Relaxed);
                item
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                T::default()
            }
        }
    }

    /// Resets `item` and returns it to the pool. Drops it silently if the
    /// pool is already at capacity.
    pub fn return_to_pool(&self, mut item: T) {
        item.reset_for_pool();
        self.returns.fetch_add(1, Ordering::Relaxed);

        let max_capacity = self.max_capacity.load(Ordering::Relaxed);
        if self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
                (n < max_capacity).then_some(n + 1)
            })
            .is_ok()
        {
            self.free.push(item);
        }
    }

    /// Eagerly constructs and inserts up to `n` additional instances, capped
    /// by remaining free-list capacity.
    pub fn prealloc(&self, n: usize) {
        for _ in 0..n {
            let max_capacity = self.max_capacity.load(Ordering::Relaxed);
            let reserved = self
                .len
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
                    (n < max_capacity).then_some(n + 1)
                });
            if reserved.is_err() {
                break;
            }
            self.free.push(T::default());
            self.created.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops every currently pooled instance; does not affect in-use ones.
    pub fn clear(&self) {
        while self.free.pop().is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Drops a fraction of currently pooled instances, retaining
    /// `percent_to_retain` (0.0–1.0) of them.
    pub fn trim(&self, percent_to_retain: f64) {
        let percent_to_retain = percent_to_retain.clamp(0.0, 1.0);
        let current = self.len.load(Ordering::Relaxed);
        let retain = ((current as f64) * percent_to_retain).round() as usize;
        let drop_count = current.saturating_sub(retain);
        for _ in 0..drop_count {
            if self.free.pop().is_some() {
                self.len.fetch_sub(1, Ordering::Relaxed);
            } else {
                break;
            }
        }
    }

    /// The soft capacity the pool was constructed with.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity.load(Ordering::Relaxed)
    }

    /// Raises or lowers the soft capacity at runtime. Lowering it below the
    /// current free-list length immediately drops the excess.
    pub fn set_max_capacity(&self, n: usize) {
        let n = n.max(1);
        self.max_capacity.store(n, Ordering::Relaxed);
        while self.len.load(Ordering::Relaxed) > n {
            if self.free.pop().is_some() {
                self.len.fetch_sub(1, Ordering::Relaxed);
            } else {
                break;
            }
        }
    }

    /// Returns current operational counters.
    pub fn stats(&self) -> ObjectPoolStats {
        ObjectPoolStats {
            gets: self.gets.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

fn instant_now() -> Instant {
    Instant::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter(u32);

    impl Poolable for Counter {
        fn reset_for_pool(&mut self) {
            self.0 = 0;
        }
    }

    #[test]
    fn get_without_preallocation_constructs_fresh() {
        let pool: Arc<ObjectPool<Counter>> = ObjectPool::new(4);
        let item = pool.get();
        assert_eq!(item.0, 0);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn return_then_get_reuses_instance() {
        let pool: Arc<ObjectPool<Counter>> = ObjectPool::new(4);
        let mut item = pool.get();
        item.0 = 99;
        pool.return_to_pool(item);

        let reused = pool.get();
        assert_eq!(reused.0, 0, "reset_for_pool must run before reuse");
        assert_eq!(pool.stats().created, 1, "no second construction needed");
    }

    #[test]
    fn return_past_capacity_drops_silently() {
        let pool: Arc<ObjectPool<Counter>> = ObjectPool::new(1);
        pool.return_to_pool(Counter(1));
        pool.return_to_pool(Counter(2));
        assert_eq!(pool.stats().returns, 2);
        assert!(pool.free.len() <= 1);
    }

    #[test]
    fn prealloc_seeds_free_list() {
        let pool: Arc<ObjectPool<Counter>> = ObjectPool::new(8);
        pool.prealloc(5);
        assert_eq!(pool.stats().created, 5);
        assert_eq!(pool.free.len(), 5);
    }

    #[test]
    fn trim_retains_requested_fraction() {
        let pool: Arc<ObjectPool<Counter>> = ObjectPool::new(10);
        pool.prealloc(10);
        pool.trim(0.5);
        assert_eq!(pool.free.len(), 5);
    }

    #[test]
    fn clear_empties_free_list() {
        let pool: Arc<ObjectPool<Counter>> = ObjectPool::new(10);
        pool.prealloc(10);
        pool.clear();
        assert_eq!(pool.free.len(), 0);
    }

    #[test]
    fn raising_max_capacity_admits_more_returns() {
        let pool: Arc<ObjectPool<Counter>> = ObjectPool::new(1);
        pool.return_to_pool(Counter(1));
        pool.return_to_pool(Counter(2));
        assert_eq!(pool.free.len(), 1);

        pool.set_max_capacity(4);
        pool.return_to_pool(Counter(3));
        pool.return_to_pool(Counter(4));
        assert_eq!(pool.free.len(), 3);
    }

    #[test]
    fn lowering_max_capacity_drops_excess_immediately() {
        let pool: Arc<ObjectPool<Counter>> = ObjectPool::new(10);
        pool.prealloc(10);
        pool.set_max_capacity(3);
        assert_eq!(pool.free.len(), 3);
        assert_eq!(pool.max_capacity(), 3);
    }
}
