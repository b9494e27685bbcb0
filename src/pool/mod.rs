//! Pooled-resource subsystem: byte buffers, generic objects, and accept state.

pub mod accept_context;
pub mod buffer_pool;
pub mod object_pool;

pub use accept_context::{AcceptContext, AcceptContextPool, RawAcceptResult};
pub use buffer_pool::{BufferPool, BufferPoolStats, PooledBuffer};
pub use object_pool::{ObjectPool, ObjectPoolStats, Poolable};
