//! Inline dispatch driven directly from a connection's own receive loop.
//!
//! No dedicated worker pool: each connection's task decodes and invokes
//! handlers itself, in the order frames arrive. Suited to callers that are
//! already running inside a worker context and are fine blocking on a
//! handler's own awaits.

use std::sync::Arc;

use corenet::catalog::{Packet, PacketCatalog};
use corenet::config::{BufferPoolConfig, ListenerConfig, ObjectPoolConfig};
use corenet::connection::Connection;
use corenet::dispatch::inline::InlineDispatcher;
use corenet::dispatch::HandlerTable;
use corenet::listener::Listener;
use corenet::pool::{AcceptContextPool, BufferPool, ObjectPool};
use tokio_util::sync::CancellationToken;

const OPCODE_ECHO: u16 = 1;

struct RawFrame(u16);

impl Packet for RawFrame {
    fn opcode(&self) -> u16 {
        self.0
    }
}

struct OpcodeOnlyCatalog;

impl PacketCatalog for OpcodeOnlyCatalog {
    type Output = RawFrame;

    fn try_deserialize(&self, bytes: &[u8]) -> Option<RawFrame> {
        (bytes.len() >= 2).then(|| RawFrame(u16::from_le_bytes([bytes[0], bytes[1]])))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let handlers = HandlerTable::<RawFrame>::builder()
        .register(OPCODE_ECHO, |_packet, connection| async move {
            tracing::info!(peer = %connection.remote_endpoint(), "handled echo frame");
        })
        .build();
    let dispatch_shutdown = CancellationToken::new();
    let dispatcher = Arc::new(InlineDispatcher::new(
        Arc::new(OpcodeOnlyCatalog),
        handlers,
        ObjectPoolConfig::default(),
        dispatch_shutdown,
    ));

    let buffer_pool = BufferPool::new(&BufferPoolConfig::default());
    let accept_pool: Arc<AcceptContextPool> =
        ObjectPool::new(ObjectPoolConfig::default().max_capacity);

    let on_accept_pool = Arc::clone(&buffer_pool);
    let on_accept = Arc::new(move |connection: Arc<Connection>, _cancel: CancellationToken| {
        let buffer_pool = Arc::clone(&on_accept_pool);
        let dispatcher = Arc::clone(&dispatcher);
        Box::pin(async move {
            connection
                .serve(&buffer_pool, 4096, move |conn, lease| {
                    let dispatcher = Arc::clone(&dispatcher);
                    async move { dispatcher.handle_lease(&lease, &conn).await }
                })
                .await;
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    });

    let root = CancellationToken::new();
    let listener = Listener::new(
        ListenerConfig {
            port: 7001,
            ..ListenerConfig::default()
        },
        buffer_pool,
        accept_pool,
        Arc::new(|_peer| true),
        on_accept,
    );

    listener.activate(&root).await.expect("bind failed");
    tracing::info!(port = listener.report().port, "listening");

    tokio::signal::ctrl_c().await.ok();

    listener.deactivate().await;
}
