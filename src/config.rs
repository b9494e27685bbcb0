//! Runtime configuration surface
//!
//! # Security-First Defaults
//!
//! As with connection limits, defaults here lean conservative: small pool
//! budgets, modest parallelism, timeouts that free resources from idle or
//! slow peers quickly.
//!
//! # Example
//!
//! ```
//! use corenet::config::{ListenerConfig, BufferPoolConfig};
//! use std::time::Duration;
//!
//! let listener = ListenerConfig {
//!     port: 7777,
//!     max_parallel: 8,
//!     ..ListenerConfig::default()
//! };
//!
//! let pools = BufferPoolConfig::parse_allocations("256,0.5;1024,0.3;4096,0.2").unwrap();
//! assert_eq!(pools.len(), 3);
//! let _ = (listener, Duration::from_secs(1));
//! ```

use std::time::Duration;

/// Bind, parallelism, and socket-tuning configuration for [`crate::listener::Listener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// TCP listen port (default: `0`, meaning "let the caller choose").
    pub port: u16,
    /// Number of parallel accept workers, must be `>= 1` (default: `4`).
    pub max_parallel: usize,
    /// Listen backlog (default: `1024`).
    pub backlog: u32,
    /// Socket send/receive buffer size in bytes, also used for the listening
    /// socket's receive buffer (default: `64 KiB`).
    pub buffer_size: usize,
    /// Whether to set `SO_REUSEADDR` before bind (default: `true`).
    pub reuse_address: bool,
    /// Prefer an IPv6 dual-stack bind, falling back to IPv4 on failure
    /// (default: `true`).
    pub enable_ipv6: bool,
    /// Disable Nagle's algorithm on accepted sockets (default: `true`).
    pub no_delay: bool,
    /// TCP keep-alive tuning; `None` disables keep-alive entirely.
    pub keep_alive: Option<KeepAliveConfig>,
    #[doc(hidden)]
    pub _priv: (),
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_parallel: 4,
            backlog: 1024,
            buffer_size: 64 * 1024,
            reuse_address: true,
            enable_ipv6: true,
            no_delay: true,
            keep_alive: Some(KeepAliveConfig::default()),
            _priv: (),
        }
    }
}

/// TCP keep-alive probe tuning (`SO_KEEPALIVE` plus OS-specific knobs).
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveConfig {
    /// Idle time before the first probe is sent (default: `75s`).
    pub time: Duration,
    /// Interval between probes (default: `15s`).
    pub interval: Duration,
    /// Number of failed probes before the connection is considered dead
    /// (default: `4`). Not honored on platforms without retry-count control.
    pub retry_count: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(75),
            interval: Duration::from_secs(15),
            retry_count: 4,
        }
    }
}

/// One declared size class of the buffer pool: a byte length and the share of
/// the total buffer budget it should claim.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferAllocation {
    /// Exact buffer length served by this class.
    pub size: usize,
    /// Share of `total_buffers` seeded into this class, in `(0, 1]`.
    pub ratio: f64,
}

/// Configuration for [`crate::pool::buffer_pool::BufferPool`].
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Declared size classes, smallest first. Ratios must lie in `(0, 1]` and
    /// sum to at most `1.1` (see [`Self::parse_allocations`]).
    pub allocations: Vec<BufferAllocation>,
    /// Total buffer count seeded across all classes on construction.
    pub total_buffers: usize,
    /// Smallest permitted growth step, in buffer count.
    pub min_increase: usize,
    /// Largest permitted growth or shrink step, in buffer count.
    pub max_increase: usize,
    /// Multiplier applied to the computed growth step.
    pub adaptive_growth_factor: f64,
    /// Fraction of `TotalAvailable` memory the pool may occupy, in `(0, 1]`.
    pub max_memory_pct: f64,
    /// Absolute memory cap in bytes; the effective budget is
    /// `min(total_available * max_memory_pct, max_memory_bytes)`.
    pub max_memory_bytes: u64,
    /// Zero returned buffers before they re-enter a free list.
    pub secure_clear: bool,
    /// Route sizes outside every declared class to a generic fallback pool
    /// instead of rejecting them.
    pub fallback_to_generic_pool: bool,
    /// Whether periodic trim runs at all.
    pub enable_memory_trimming: bool,
    /// Interval between ordinary trim passes.
    pub trim_interval: Duration,
    /// Interval between deep trim passes (re-examines every class).
    pub deep_trim_interval: Duration,
    /// Emit per-rent/return counters to the analytics sink.
    pub enable_analytics: bool,
    /// Compact the free-list queue opportunistically during trim.
    pub enable_queue_compaction: bool,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            allocations: vec![
                BufferAllocation { size: 256, ratio: 0.2 },
                BufferAllocation { size: 1024, ratio: 0.4 },
                BufferAllocation { size: 4096, ratio: 0.3 },
                BufferAllocation { size: 16384, ratio: 0.1 },
            ],
            total_buffers: 1024,
            min_increase: 8,
            max_increase: 1024,
            adaptive_growth_factor: 1.0,
            max_memory_pct: 0.25,
            max_memory_bytes: 256 * 1024 * 1024,
            secure_clear: false,
            fallback_to_generic_pool: true,
            enable_memory_trimming: true,
            trim_interval: Duration::from_secs(60),
            deep_trim_interval: Duration::from_secs(600),
            enable_analytics: false,
            enable_queue_compaction: false,
            _priv: (),
        }
    }
}

/// Error returned by [`BufferPoolConfig::parse_allocations`].
#[derive(Debug, PartialEq)]
pub enum AllocationParseError {
    /// A `<size>,<ratio>` entry was missing its comma separator.
    MalformedEntry(String),
    /// `<size>` was not a valid non-zero integer.
    InvalidSize(String),
    /// `<ratio>` was not a valid float in `(0, 1]`.
    InvalidRatio(String),
    /// The sum of all ratios exceeded `1.1`.
    RatioBudgetExceeded(f64),
    /// The string contained no entries.
    Empty,
}

impl fmt::Display for AllocationParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedEntry(s) => write!(f, "malformed allocation entry: {s:?}"),
            Self::InvalidSize(s) => write!(f, "invalid size in entry: {s:?}"),
            Self::InvalidRatio(s) => write!(f, "invalid ratio in entry: {s:?}"),
            Self::RatioBudgetExceeded(sum) => {
                write!(f, "allocation ratios sum to {sum}, exceeding the 1.1 budget")
            }
            Self::Empty => write!(f, "allocation string had no entries"),
        }
    }
}

impl std::error::Error for AllocationParseError {}

use std::fmt;

impl BufferPoolConfig {
    /// Parses a `BufferAllocations`-style string: `"<size>,<ratio>;<size>,<ratio>;..."`.
    ///
    /// Ordered by declaration order (not re-sorted); callers that need
    /// smallest-first class lookup should sort by `size` after parsing if the
    /// input string isn't already ordered. Idempotent: the same input always
    /// yields the same `Vec` in the same order.
    ///
    /// # Examples
    ///
    /// ```
    /// use corenet::config::BufferPoolConfig;
    ///
    /// let classes = BufferPoolConfig::parse_allocations("1024,1.0").unwrap();
    /// assert_eq!(classes.len(), 1);
    /// assert_eq!(classes[0].size, 1024);
    /// ```
    pub fn parse_allocations(spec: &str) -> Result<Vec<BufferAllocation>, AllocationParseError> {
        let mut out = Vec::new();
        let mut ratio_sum = 0.0;

        for entry in spec.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (size_str, ratio_str) = entry
                .split_once(',')
                .ok_or_else(|| AllocationParseError::MalformedEntry(entry.to_string()))?;

            let size: usize = size_str
                .trim()
                .parse()
                .map_err(|_| AllocationParseError::InvalidSize(size_str.to_string()))?;
            if size == 0 {
                return Err(AllocationParseError::InvalidSize(size_str.to_string()));
            }

            let ratio: f64 = ratio_str
                .trim()
                .parse()
                .map_err(|_| AllocationParseError::InvalidRatio(ratio_str.to_string()))?;
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(AllocationParseError::InvalidRatio(ratio_str.to_string()));
            }

            ratio_sum += ratio;
            out.push(BufferAllocation { size, ratio });
        }

        if out.is_empty() {
            return Err(AllocationParseError::Empty);
        }
        if ratio_sum > 1.1 {
            return Err(AllocationParseError::RatioBudgetExceeded(ratio_sum));
        }

        Ok(out)
    }
}

/// Configuration for a generic [`crate::pool::object_pool::ObjectPool`].
#[derive(Debug, Clone, Copy)]
pub struct ObjectPoolConfig {
    /// Instances eagerly constructed and pushed into the pool at startup.
    pub preallocate: usize,
    /// Soft capacity; items returned once the pool is at capacity are dropped.
    pub max_capacity: usize,
}

impl Default for ObjectPoolConfig {
    fn default() -> Self {
        Self {
            preallocate: 64,
            max_capacity: 1024,
        }
    }
}

/// Configuration for the channel-backed [`crate::dispatch::channel::ChannelDispatcher`].
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Worker count override; `None` derives `clamp(cores/2, 2, 12)`.
    pub worker_count: Option<usize>,
    /// Number of priority classes the dispatch channel maintains.
    pub priority_classes: usize,
    /// Sizing for the pool of [`crate::context::PacketContext`] instances
    /// each worker draws from for the duration of one handler invocation.
    pub context_pool: ObjectPoolConfig,

    #[doc(hidden)]
    pub _priv: (),
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            priority_classes: 2,
            context_pool: ObjectPoolConfig::default(),
            _priv: (),
        }
    }
}

impl DispatchConfig {
    /// Resolves [`Self::worker_count`] against the available parallelism,
    /// clamped to `[2, 12]` per the channel dispatcher's worker-count policy.
    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).clamp(2, 12)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_allocations_single_class() {
        let parsed = BufferPoolConfig::parse_allocations("4096,1.0").unwrap();
        assert_eq!(parsed, vec![BufferAllocation { size: 4096, ratio: 1.0 }]);
    }

    #[test]
    fn parse_allocations_is_idempotent() {
        let spec = "256,0.2;1024,0.4;4096,0.3";
        assert_eq!(
            BufferPoolConfig::parse_allocations(spec),
            BufferPoolConfig::parse_allocations(spec)
        );
    }

    #[test]
    fn parse_allocations_rejects_ratio_budget_overflow() {
        let err = BufferPoolConfig::parse_allocations("1,0.6;2,0.6").unwrap_err();
        assert!(matches!(err, AllocationParseError::RatioBudgetExceeded(_)));
    }

    #[test]
    fn parse_allocations_rejects_zero_ratio() {
        let err = BufferPoolConfig::parse_allocations("1,0.0").unwrap_err();
        assert!(matches!(err, AllocationParseError::InvalidRatio(_)));
    }

    #[test]
    fn parse_allocations_rejects_empty() {
        assert_eq!(
            BufferPoolConfig::parse_allocations(""),
            Err(AllocationParseError::Empty)
        );
    }

    #[test]
    fn resolved_worker_count_respects_override() {
        let cfg = DispatchConfig {
            worker_count: Some(7),
            ..DispatchConfig::default()
        };
        assert_eq!(cfg.resolved_worker_count(), 7);
    }

    #[test]
    fn resolved_worker_count_clamps_derived_value() {
        let cfg = DispatchConfig::default();
        let n = cfg.resolved_worker_count();
        assert!((2..=12).contains(&n));
    }
}
