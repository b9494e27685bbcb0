//! Per-invocation context handed to a resolved handler.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::Packet;
use crate::connection::Connection;
use crate::pool::object_pool::ObjectPool;

const STATE_POOLED: u8 = 0;
const STATE_IN_USE: u8 = 1;
const STATE_RETURNED: u8 = 2;

/// A pooled record carrying everything a handler needs: the decoded packet,
/// the owning connection, free-form metadata, and a cancellation token linked
/// to the listener's shutdown.
///
/// State transitions are enforced with a single interlocked byte: `initialize`
/// moves Pooled → InUse, `return_to_pool` moves InUse → Returned, and is a
/// no-op from any other state — calling it twice on the same handle only ever
/// reinserts the instance into its pool once.
pub struct PacketContext<P: Packet> {
    state: AtomicU8,
    packet: Option<P>,
    connection: Option<Arc<Connection>>,
    metadata: Option<String>,
    cancellation: Option<CancellationToken>,
}

impl<P: Packet> Default for PacketContext<P> {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(STATE_POOLED),
            packet: None,
            connection: None,
            metadata: None,
            cancellation: None,
        }
    }
}

impl<P: Packet> crate::pool::object_pool::Poolable for PacketContext<P> {
    fn reset_for_pool(&mut self) {
        self.packet = None;
        self.connection = None;
        self.metadata = None;
        self.cancellation = None;
        self.state.store(STATE_POOLED, Ordering::Release);
    }
}

impl<P: Packet> PacketContext<P> {
    /// Atomically transitions Pooled → InUse and populates the context.
    ///
    /// Returns `false` (and leaves the context untouched) if called on a
    /// context that isn't currently Pooled.
    pub fn initialize(
        &mut self,
        packet: P,
        connection: Arc<Connection>,
        metadata: Option<String>,
        cancellation: CancellationToken,
    ) -> bool {
        if self
            .state
            .compare_exchange(STATE_POOLED, STATE_IN_USE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.packet = Some(packet);
        self.connection = Some(connection);
        self.metadata = metadata;
        self.cancellation = Some(cancellation);
        true
    }

    /// The decoded packet, if the context is currently InUse.
    pub fn packet(&self) -> Option<&P> {
        self.packet.as_ref()
    }

    /// The owning connection, if the context is currently InUse.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// Free-form metadata attached at `initialize` time.
    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    /// The linked cancellation token, if the context is currently InUse.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Takes ownership of the contained packet, leaving the context's own
    /// slot empty. Used by a dispatcher to hand the packet to a handler while
    /// the context itself still brackets the invocation for pooling purposes.
    pub fn take_packet(&mut self) -> Option<P> {
        self.packet.take()
    }

    /// Atomically transitions InUse → Returned and hands the instance back to
    /// `pool`. A no-op (does not reinsert) from any other state, so calling
    /// this twice never double-returns the same instance.
    pub fn return_to_pool(mut self, pool: &ObjectPool<Self>)
    where
        Self: Sized,
    {
        if self
            .state
            .compare_exchange(STATE_IN_USE, STATE_RETURNED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.packet = None;
        self.connection = None;
        self.metadata = None;
        self.cancellation = None;
        pool.return_to_pool(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Packet;
    use crate::connection::Connection;
    use crate::pool::object_pool::ObjectPool;

    struct TestPacket(u16);
    impl Packet for TestPacket {
        fn opcode(&self) -> u16 {
            self.0
        }
    }

    #[test]
    fn initialize_then_return_is_single_shot() {
        let pool: Arc<ObjectPool<PacketContext<TestPacket>>> = ObjectPool::new(4);
        let mut ctx = pool.get();
        let conn = Connection::new_for_test();
        assert!(ctx.initialize(TestPacket(42), conn, None, CancellationToken::new()));
        assert_eq!(ctx.packet().unwrap().opcode(), 42);

        ctx.return_to_pool(&pool);
        assert_eq!(pool.stats().returns, 1);
    }

    #[test]
    fn double_initialize_without_reset_fails() {
        let mut ctx: PacketContext<TestPacket> = PacketContext::default();
        let conn = Connection::new_for_test();
        assert!(ctx.initialize(TestPacket(1), conn.clone(), None, CancellationToken::new()));
        assert!(!ctx.initialize(TestPacket(2), conn, None, CancellationToken::new()));
    }
}
