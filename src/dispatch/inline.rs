//! Inline dispatcher: decodes and invokes from the caller's own task.
//!
//! Intended for callers that already run in a worker context (e.g. inside a
//! connection's own receive loop) and are prepared to block on the handler.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::{hex_preview, leading_magic, PacketCatalog};
use crate::config::ObjectPoolConfig;
use crate::connection::Connection;
use crate::context::PacketContext;
use crate::dispatch::HandlerTable;
use crate::pool::buffer_pool::PooledBuffer;
use crate::pool::object_pool::ObjectPool;

/// Decodes and dispatches a single frame, never propagating a handler
/// failure back to the caller.
///
/// Each dispatch draws a [`PacketContext`] from a small pool, initializes it
/// with the packet and connection, hands the packet to the resolved handler,
/// then returns the context — bracketing every invocation the same way
/// whether or not the handler itself ever inspects the context.
pub struct InlineDispatcher<C: PacketCatalog> {
    catalog: Arc<C>,
    handlers: Arc<HandlerTable<C::Output>>,
    context_pool: Arc<ObjectPool<PacketContext<C::Output>>>,
    shutdown: CancellationToken,
}

impl<C: PacketCatalog> InlineDispatcher<C> {
    pub fn new(
        catalog: Arc<C>,
        handlers: Arc<HandlerTable<C::Output>>,
        context_pool_config: ObjectPoolConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let context_pool = ObjectPool::with_preallocated(
            context_pool_config.max_capacity,
            context_pool_config.preallocate,
        );
        Self {
            catalog,
            handlers,
            context_pool,
            shutdown,
        }
    }

    /// Decodes `bytes` and invokes the resolved handler, if any.
    ///
    /// 1. An empty payload is logged and dropped without reaching the catalog.
    /// 2. A failed decode logs a bounded hex preview plus the leading magic
    ///    and drops the payload.
    /// 3. An opcode with no registered handler logs a warning and drops.
    /// 4. Otherwise the handler runs; this call awaits it directly.
    pub async fn handle_bytes(&self, bytes: &[u8], connection: &Arc<Connection>) {
        if bytes.is_empty() {
            tracing::debug!("dropping empty payload");
            return;
        }

        let Some(packet) = self.catalog.try_deserialize(bytes) else {
            tracing::warn!(
                magic = ?leading_magic(bytes),
                len = bytes.len(),
                preview = %hex_preview(bytes),
                "catalog failed to deserialize payload"
            );
            return;
        };

        self.handle_packet(packet, connection).await;
    }

    /// Dispatches an already-decoded packet, skipping the catalog step.
    pub async fn handle_packet(&self, packet: C::Output, connection: &Arc<Connection>) {
        let opcode = packet.opcode();
        let Some(handler) = self.handlers.try_resolve(opcode) else {
            tracing::warn!(opcode, "no handler registered for opcode");
            return;
        };

        let mut ctx = self.context_pool.get();
        ctx.initialize(packet, Arc::clone(connection), None, self.shutdown.child_token());
        if let Some(packet) = ctx.take_packet() {
            let fut = handler(packet, Arc::clone(connection));
            fut.await;
        }
        ctx.return_to_pool(&self.context_pool);
    }

    /// Convenience entry point matching the connection receive loop's
    /// process-hook shape: decode and dispatch a leased buffer's contents.
    pub async fn handle_lease(&self, lease: &PooledBuffer, connection: &Arc<Connection>) {
        self.handle_bytes(lease.as_slice(), connection).await;
    }
}
