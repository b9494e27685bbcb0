//! Size-classed byte-buffer pool with adaptive capacity.
//!
//! Buffers are partitioned into fixed *size classes* declared at construction.
//! `rent` always returns a buffer at least as large as requested, drawn from
//! the smallest class that fits; `return_buffer` routes by length back to the
//! matching class (or a fallback pool, or the void).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::BufferPoolConfig;
use crate::error::CoreError;

/// A leased buffer. Returns itself to its originating class on [`Drop`].
///
/// Carries a valid length separate from its backing capacity: `len`/`as_slice`/
/// `Deref` expose only the bytes a reader actually populated, while the full
/// class capacity stays reachable through `as_mut_capacity` for filling the
/// lease in the first place.
///
/// Access after drop is impossible by construction: dropping a `PooledBuffer`
/// consumes it, there is no way to retain a reference to its bytes past that
/// point.
pub struct PooledBuffer {
    bytes: Vec<u8>,
    class_size: usize,
    valid_len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Number of valid leading bytes — the actual byte count a reader put
    /// into this lease, not the underlying class capacity. Defaults to the
    /// full buffer length; callers that read a partial frame must call
    /// [`Self::set_valid_len`] before handing the lease downstream.
    pub fn len(&self) -> usize {
        self.valid_len
    }

    /// `true` if no valid bytes are set.
    pub fn is_empty(&self) -> bool {
        self.valid_len == 0
    }

    /// Full class capacity backing this lease, independent of how many bytes
    /// are currently valid.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Marks the first `n` bytes as valid. Clamped to the buffer's capacity.
    pub fn set_valid_len(&mut self, n: usize) {
        self.valid_len = n.min(self.bytes.len());
    }

    /// Borrows the valid leading bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.valid_len]
    }

    /// Mutably borrows the valid leading bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.valid_len]
    }

    /// Mutably borrows the full backing capacity, including bytes past the
    /// current valid length — used by a reader filling the lease before
    /// calling [`Self::set_valid_len`].
    pub fn as_mut_capacity(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.valid_len]
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.valid_len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let bytes = std::mem::take(&mut self.bytes);
        self.pool.return_buffer(bytes, self.class_size);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("class_size", &self.class_size)
            .field("len", &self.len())
            .finish()
    }
}

struct Class {
    size: usize,
    ratio: f64,
    free: Mutex<Vec<Vec<u8>>>,
    total: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    growing: AtomicBool,
    shrinking: AtomicBool,
}

impl Class {
    fn free_count(&self) -> u64 {
        self.free.lock().len() as u64
    }

    fn snapshot(&self) -> ClassStats {
        let total = self.total.load(Ordering::Relaxed);
        let free = self.free_count();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        ClassStats {
            size: self.size,
            total,
            free,
            hits,
            misses,
            usage_ratio: if total > 0 {
                (total.saturating_sub(free)) as f64 / total as f64
            } else {
                0.0
            },
            miss_rate: if hits + misses > 0 {
                misses as f64 / (hits + misses) as f64
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time metrics for a single size class.
#[derive(Debug, Clone, Copy)]
pub struct ClassStats {
    /// Declared buffer length for this class.
    pub size: usize,
    /// Total buffers currently seeded in this class (free + in use).
    pub total: u64,
    /// Buffers currently sitting in the free list.
    pub free: u64,
    /// Cumulative rent hits.
    pub hits: u64,
    /// Cumulative rent misses (that triggered growth or fallback).
    pub misses: u64,
    /// `(total - free) / total`.
    pub usage_ratio: f64,
    /// `misses / (hits + misses)`.
    pub miss_rate: f64,
}

/// Aggregate snapshot across all classes plus the fallback pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Per-class metrics, ordered smallest-size-first.
    pub classes: Vec<ClassStats>,
    /// Buffers currently parked in the fallback pool.
    pub fallback_free: u64,
    /// Estimated resident bytes across all classes.
    pub resident_bytes: u64,
    /// Configured resident-byte budget.
    pub budget_bytes: u64,
}

/// A size-classed, adaptively-grown pool of byte buffers.
pub struct BufferPool {
    classes: Vec<Class>,
    fallback: Option<Mutex<Vec<Vec<u8>>>>,
    fingerprint: Mutex<Option<(usize, usize)>>,
    secure_clear: bool,
    min_increase: usize,
    max_increase: usize,
    adaptive_growth_factor: f64,
    budget_bytes: AtomicI64,
    enable_memory_trimming: bool,
    trim_interval: Duration,
    deep_trim_interval: Duration,
}

impl BufferPool {
    /// Builds a pool from `cfg`, seeding `cfg.total_buffers` proportioned by
    /// each class's declared ratio.
    pub fn new(cfg: &BufferPoolConfig) -> Arc<Self> {
        let budget = compute_budget(cfg);
        let mut classes = Vec::with_capacity(cfg.allocations.len());
        let mut ordered = cfg.allocations.clone();
        ordered.sort_by_key(|a| a.size);

        for alloc in &ordered {
            let seed = ((cfg.total_buffers as f64) * alloc.ratio).round() as usize;
            let mut free = Vec::with_capacity(seed);
            for _ in 0..seed {
                free.push(vec![0u8; alloc.size]);
            }
            classes.push(Class {
                size: alloc.size,
                ratio: alloc.ratio,
                free: Mutex::new(free),
                total: AtomicU64::new(seed as u64),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                growing: AtomicBool::new(false),
                shrinking: AtomicBool::new(false),
            });
        }

        Arc::new(Self {
            classes,
            fallback: cfg.fallback_to_generic_pool.then(|| Mutex::new(Vec::new())),
            fingerprint: Mutex::new(None),
            secure_clear: cfg.secure_clear,
            min_increase: cfg.min_increase,
            max_increase: cfg.max_increase,
            adaptive_growth_factor: cfg.adaptive_growth_factor,
            budget_bytes: AtomicI64::new(budget as i64),
            enable_memory_trimming: cfg.enable_memory_trimming,
            trim_interval: cfg.trim_interval,
            deep_trim_interval: cfg.deep_trim_interval,
        })
    }

    /// Rents a buffer at least `size` bytes long.
    ///
    /// Returns [`CoreError::BudgetExceeded`] only when `size` exceeds every
    /// declared class and no fallback pool is configured.
    pub fn rent(self: &Arc<Self>, size: usize) -> Result<PooledBuffer, CoreError> {
        if let Some(class_idx) = self.select_class(size) {
            return Ok(self.rent_from_class(class_idx));
        }

        match &self.fallback {
            Some(fallback) => {
                let bytes = fallback
                    .lock()
                    .pop()
                    .unwrap_or_else(|| vec![0u8; size]);
                let bytes = if bytes.len() < size {
                    vec![0u8; size]
                } else {
                    bytes
                };
                let valid_len = bytes.len();
                Ok(PooledBuffer {
                    bytes,
                    class_size: 0,
                    valid_len,
                    pool: Arc::clone(self),
                })
            }
            None => Err(CoreError::BudgetExceeded),
        }
    }

    fn select_class(&self, size: usize) -> Option<usize> {
        if let Some((cached_size, idx)) = *self.fingerprint.lock() {
            if cached_size == size && self.classes.get(idx).is_some() {
                return Some(idx);
            }
        }
        let idx = self.classes.iter().position(|c| c.size >= size)?;
        *self.fingerprint.lock() = Some((size, idx));
        Some(idx)
    }

    fn rent_from_class(self: &Arc<Self>, idx: usize) -> PooledBuffer {
        let class = &self.classes[idx];
        let bytes = {
            let mut free = class.free.lock();
            free.pop()
        };

        let bytes = match bytes {
            Some(b) => {
                class.hits.fetch_add(1, Ordering::Relaxed);
                b
            }
            None => {
                class.misses.fetch_add(1, Ordering::Relaxed);
                self.maybe_grow(idx);
                class.total.fetch_add(1, Ordering::Relaxed);
                vec![0u8; class.size]
            }
        };

        if class.free_count() >= (class.total.load(Ordering::Relaxed) / 2).max(1) {
            self.maybe_shrink(idx);
        }

        let valid_len = bytes.len();
        PooledBuffer {
            bytes,
            class_size: class.size,
            valid_len,
            pool: Arc::clone(self),
        }
    }

    fn return_buffer(&self, mut bytes: Vec<u8>, class_size: usize) {
        if class_size == 0 {
            if let Some(fallback) = &self.fallback {
                if self.secure_clear {
                    bytes.iter_mut().for_each(|b| *b = 0);
                }
                fallback.lock().push(bytes);
            }
            return;
        }

        let Some(class) = self.classes.iter().find(|c| c.size == class_size) else {
            tracing::warn!(len = bytes.len(), "returned buffer matches no known class; dropping");
            return;
        };

        if self.secure_clear {
            bytes.iter_mut().for_each(|b| *b = 0);
        }
        class.free.lock().push(bytes);
    }

    fn maybe_grow(&self, idx: usize) {
        let class = &self.classes[idx];
        if class
            .growing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let stats = class.snapshot();
        let resident = self.resident_bytes();
        let budget = self.budget_bytes.load(Ordering::Relaxed).max(0) as u64;

        if resident >= budget {
            tracing::warn!(class_size = class.size, "buffer pool at memory budget, refusing growth");
            class.growing.store(false, Ordering::Release);
            return;
        }

        let base = round_up_pow2((stats.total / 4).max(1));
        let usage_factor = 1.0 + stats.usage_ratio;
        let miss_factor = 1.0 + stats.miss_rate;
        let raw = (base as f64) * usage_factor * miss_factor * self.adaptive_growth_factor;
        let step = (raw.round() as i64)
            .clamp(self.min_increase as i64, self.max_increase as i64)
            .max(0) as usize;

        if step > 0 {
            let mut free = class.free.lock();
            for _ in 0..step {
                free.push(vec![0u8; class.size]);
            }
            class.total.fetch_add(step as u64, Ordering::Relaxed);
        }

        class.growing.store(false, Ordering::Release);
    }

    fn maybe_shrink(&self, idx: usize) {
        let class = &self.classes[idx];
        if class
            .shrinking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let stats = class.snapshot();
        let total_budget_buffers = (self.budget_bytes.load(Ordering::Relaxed).max(0) as u64)
            / (class.size as u64).max(1);
        let target = (total_budget_buffers as f64 * class.ratio).round() as u64;

        if stats.free >= stats.total / 2 && target < stats.total {
            let safety_margin = (20u64).min((((stats.total / 4) as f64).sqrt()) as u64);
            let step = (stats.free as i64 - target as i64 - safety_margin as i64)
                .clamp(0, self.max_increase as i64) as u64;

            if step > 0 {
                let mut free = class.free.lock();
                let remove = step.min(free.len() as u64) as usize;
                free.truncate(free.len() - remove);
                class.total.fetch_sub(remove as u64, Ordering::Relaxed);
            }
        }

        class.shrinking.store(false, Ordering::Release);
    }

    fn resident_bytes(&self) -> u64 {
        self.classes
            .iter()
            .map(|c| c.total.load(Ordering::Relaxed) * c.size as u64)
            .sum()
    }

    /// Runs one trim pass: releases excess free buffers in every over-budget
    /// class. `deep` additionally re-examines classes that aren't currently
    /// over budget.
    pub fn trim(&self, deep: bool) {
        for idx in 0..self.classes.len() {
            let stats = self.classes[idx].snapshot();
            if deep || stats.free >= stats.total / 2 {
                self.maybe_shrink(idx);
            }
        }
    }

    /// Spawns a background task that calls `trim(false)` every `trim_interval`
    /// and `trim(true)` every `deep_trim_interval`, until `shutdown` fires.
    /// Returns `None` without spawning anything if the pool was configured
    /// with `enable_memory_trimming = false`.
    pub fn spawn_periodic_trim(self: &Arc<Self>, shutdown: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        if !self.enable_memory_trimming {
            return None;
        }

        let pool = Arc::clone(self);
        let mut trim_tick = tokio::time::interval(self.trim_interval);
        let mut deep_tick = tokio::time::interval(self.deep_trim_interval);

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = trim_tick.tick() => pool.trim(false),
                    _ = deep_tick.tick() => pool.trim(true),
                }
            }
        }))
    }

    /// Returns a metrics snapshot across every class and the fallback pool.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            classes: self.classes.iter().map(Class::snapshot).collect(),
            fallback_free: self
                .fallback
                .as_ref()
                .map(|f| f.lock().len() as u64)
                .unwrap_or(0),
            resident_bytes: self.resident_bytes(),
            budget_bytes: self.budget_bytes.load(Ordering::Relaxed).max(0) as u64,
        }
    }
}

fn compute_budget(cfg: &BufferPoolConfig) -> u64 {
    let available = total_available_memory_bytes();
    let pct_budget = (available as f64 * cfg.max_memory_pct) as u64;
    pct_budget.min(cfg.max_memory_bytes)
}

/// Best-effort estimate of total system memory; falls back to 4 GiB when the
/// platform doesn't expose it cheaply.
fn total_available_memory_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn round_up_pow2(n: u64) -> u64 {
    if n <= 1 {
        return 1;
    }
    1u64 << (64 - (n - 1).leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferAllocation;

    fn single_class_config(size: usize, total: usize) -> BufferPoolConfig {
        BufferPoolConfig {
            allocations: vec![BufferAllocation { size, ratio: 1.0 }],
            total_buffers: total,
            ..BufferPoolConfig::default()
        }
    }

    #[test]
    fn rent_returns_buffer_at_least_requested_size() {
        let pool = BufferPool::new(&single_class_config(1024, 4));
        let buf = pool.rent(100).unwrap();
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn rent_zero_uses_smallest_class() {
        let pool = BufferPool::new(&single_class_config(1024, 4));
        let buf = pool.rent(0).unwrap();
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn rent_and_return_restores_free_count() {
        let pool = BufferPool::new(&single_class_config(1024, 4));
        let before = pool.stats().classes[0].free;
        let buf = pool.rent(512).unwrap();
        drop(buf);
        let after = pool.stats().classes[0].free;
        assert_eq!(before, after);
    }

    #[test]
    fn rent_over_max_class_without_fallback_errors() {
        let cfg = BufferPoolConfig {
            fallback_to_generic_pool: false,
            ..single_class_config(1024, 4)
        };
        let pool = BufferPool::new(&cfg);
        assert!(pool.rent(2048).is_err());
    }

    #[test]
    fn rent_over_max_class_with_fallback_succeeds() {
        let cfg = BufferPoolConfig {
            fallback_to_generic_pool: true,
            ..single_class_config(1024, 4)
        };
        let pool = BufferPool::new(&cfg);
        let buf = pool.rent(4096).unwrap();
        assert!(buf.len() >= 4096);
    }

    #[test]
    fn exhausting_free_list_triggers_growth_not_failure() {
        let pool = BufferPool::new(&single_class_config(64, 2));
        let _a = pool.rent(64).unwrap();
        let _b = pool.rent(64).unwrap();
        let c = pool.rent(64).unwrap();
        assert_eq!(c.len(), 64);
        assert!(pool.stats().classes[0].total >= 3);
    }

    #[test]
    fn secure_clear_zeroes_returned_buffer() {
        let cfg = BufferPoolConfig {
            secure_clear: true,
            ..single_class_config(16, 1)
        };
        let pool = BufferPool::new(&cfg);
        let mut buf = pool.rent(16).unwrap();
        buf.as_mut_slice().fill(0xAA);
        drop(buf);
        let reused = pool.rent(16).unwrap();
        assert!(reused.iter().all(|&b| b == 0));
    }
}
