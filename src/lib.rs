//! corenet - the accept/dispatch/pool core of a high-throughput TCP server runtime
//!
//! A performance-oriented TCP runtime core with comprehensive configuration
//! for memory management, connection handling, and packet dispatch. Designed
//! for services requiring fine-grained control over resources on the hot
//! path: accept a connection, read a framed packet, decode it through a
//! pluggable catalog, route it to a handler, and recycle every transient
//! resource.
//!
//! # Protocol Support
//!
//! This crate is protocol-agnostic: wire format and framing are supplied by
//! the host application through the [`catalog::PacketCatalog`] contract.
//! What's provided here is the acceptor, the dispatcher, and the pools that
//! make both fast.
//!
//! # Features
//!
//! ## 🔒 Security & Protection
//! - **Admission control hook** on every accepted socket, evaluated before a
//!   [`connection::Connection`] is ever constructed.
//! - **Fully configurable limits and timeouts** for pool sizing, parallelism,
//!   and keep-alive.
//!
//! ## 🚀 Performance & Memory
//! - **Size-classed buffer pool** with adaptive grow/shrink driven by miss
//!   rate and usage, under a hard memory budget.
//! - **Pooled accept and packet contexts** — no per-accept or per-dispatch
//!   allocation beyond what the catalog itself requires.
//!
//! ## 🏭 Production Ready
//! - **Two dispatch strategies** — [`dispatch::inline`] for callers already on
//!   a worker thread, [`dispatch::channel`] for a dedicated, priority-aware
//!   worker pool.
//! - **Panic isolation** — a handler panic is caught, logged, and never takes
//!   down a dispatch worker or an accept worker.
//! - **Orderly lifecycle** — `Activate`/`Deactivate` on [`listener::Listener`]
//!   drive a compare-and-set state machine with group-cancelled workers.
//!
//! # Quick Start
//!
//! ```
//! use corenet::catalog::{Packet, PacketCatalog};
//! use corenet::config::{BufferPoolConfig, ObjectPoolConfig};
//! use corenet::dispatch::HandlerTable;
//! use corenet::pool::{AcceptContextPool, BufferPool, ObjectPool};
//! use std::sync::Arc;
//!
//! struct Echo(u16);
//! impl Packet for Echo {
//!     fn opcode(&self) -> u16 { self.0 }
//! }
//! struct EchoCatalog;
//! impl PacketCatalog for EchoCatalog {
//!     type Output = Echo;
//!     fn try_deserialize(&self, bytes: &[u8]) -> Option<Echo> {
//!         (bytes.len() >= 2).then(|| Echo(u16::from_le_bytes([bytes[0], bytes[1]])))
//!     }
//! }
//!
//! let buffer_pool = BufferPool::new(&BufferPoolConfig::default());
//! let accept_pool: Arc<AcceptContextPool> =
//!     ObjectPool::new(ObjectPoolConfig::default().max_capacity);
//! let handlers = HandlerTable::<Echo>::builder()
//!     .register(1, |_packet, _connection| async move {})
//!     .build();
//!
//! assert_eq!(buffer_pool.stats().classes.len(), BufferPoolConfig::default().allocations.len());
//! let _ = (accept_pool, handlers);
//! ```
//!
//! See [`listener::Listener`] for how a bound socket, the pools above, and a
//! dispatcher are wired together into a running accept loop.
//!
//! # 🌐 Beyond the Documentation
//! For the data model and invariants this crate implements, see `DESIGN.md`
//! in the repository root.

pub mod catalog;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod pool;
pub mod worker_group;

pub use crate::{
    catalog::{Packet, PacketCatalog},
    connection::Connection,
    context::PacketContext,
    error::CoreError,
    listener::{Listener, ListenerReport, ListenerState},
    worker_group::WorkerGroup,
};

/// Bundles the long-lived collaborators a host application wires together
/// once at startup: the buffer pool, the accept-context pool, and the root
/// cancellation token every listener and dispatcher links its own token to.
///
/// Exists so callers have one `Arc<T>`-friendly place to hold shared services
/// instead of a global mutable singleton — every [`listener::Listener`] and
/// [`dispatch::channel::ChannelDispatcher`] is handed clones of its fields
/// explicitly rather than reaching for ambient statics.
pub struct RuntimeContext {
    pub buffer_pool: std::sync::Arc<pool::BufferPool>,
    pub accept_pool: std::sync::Arc<pool::AcceptContextPool>,
    pub shutdown: tokio_util::sync::CancellationToken,
}

impl RuntimeContext {
    pub fn new(
        buffer_pool_config: &config::BufferPoolConfig,
        accept_pool_config: &config::ObjectPoolConfig,
    ) -> Self {
        Self {
            buffer_pool: pool::BufferPool::new(buffer_pool_config),
            accept_pool: pool::ObjectPool::with_preallocated(
                accept_pool_config.max_capacity,
                accept_pool_config.preallocate,
            ),
            shutdown: tokio_util::sync::CancellationToken::new(),
        }
    }
}
