//! Opcode-routed echo server over the channel dispatcher.
//!
//! Binds a listener, decodes a 2-byte little-endian opcode prefix on every
//! frame, and routes frames to a handler table through a priority-aware
//! worker pool instead of the caller's own task.

use std::sync::Arc;

use corenet::catalog::{Packet, PacketCatalog};
use corenet::config::{BufferPoolConfig, DispatchConfig, ListenerConfig, ObjectPoolConfig};
use corenet::connection::Connection;
use corenet::dispatch::channel::{no_priority, ChannelDispatcher, DispatchChannel};
use corenet::dispatch::HandlerTable;
use corenet::listener::Listener;
use corenet::pool::{AcceptContextPool, BufferPool, ObjectPool};
use tokio_util::sync::CancellationToken;

const OPCODE_PING: u16 = 1;

struct EchoPacket {
    opcode: u16,
    payload: Vec<u8>,
}

impl Packet for EchoPacket {
    fn opcode(&self) -> u16 {
        self.opcode
    }
}

struct LengthPrefixedCatalog;

impl PacketCatalog for LengthPrefixedCatalog {
    type Output = EchoPacket;

    fn try_deserialize(&self, bytes: &[u8]) -> Option<EchoPacket> {
        if bytes.len() < 2 {
            return None;
        }
        let opcode = u16::from_le_bytes([bytes[0], bytes[1]]);
        Some(EchoPacket {
            opcode,
            payload: bytes[2..].to_vec(),
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let handlers = HandlerTable::<EchoPacket>::builder()
        .register(OPCODE_PING, |packet, connection| async move {
            tracing::info!(
                peer = %connection.remote_endpoint(),
                len = packet.payload.len(),
                "echoing ping payload"
            );
        })
        .build();

    let channel = DispatchChannel::new(1, no_priority());
    let dispatcher = Arc::new(ChannelDispatcher::new(
        Arc::new(LengthPrefixedCatalog),
        handlers,
        Arc::clone(&channel),
        DispatchConfig::default(),
    ));

    let root = CancellationToken::new();
    let dispatch_group = dispatcher.activate(&root);

    let buffer_pool = BufferPool::new(&BufferPoolConfig::default());
    let accept_pool: Arc<AcceptContextPool> =
        ObjectPool::new(ObjectPoolConfig::default().max_capacity);

    let on_accept_pool = Arc::clone(&buffer_pool);
    let on_accept_channel = Arc::clone(&channel);
    let on_accept = Arc::new(move |connection: Arc<Connection>, _cancel: CancellationToken| {
        let buffer_pool = Arc::clone(&on_accept_pool);
        let channel = Arc::clone(&on_accept_channel);
        Box::pin(async move {
            connection
                .serve(&buffer_pool, 4096, move |conn, lease| {
                    let channel = Arc::clone(&channel);
                    async move { channel.push(conn, lease) }
                })
                .await;
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    });

    let listener = Listener::new(
        ListenerConfig {
            port: 7000,
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
    dispatcher.deactivate(dispatch_group).await;
}
