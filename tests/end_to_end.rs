//! End-to-end scenarios driving a real `Listener` over loopback sockets:
//! happy path, unknown opcode, garbage input, backpressure/drain, and
//! shutdown during an in-flight accept.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corenet::catalog::{Packet, PacketCatalog};
use corenet::config::{BufferAllocation, BufferPoolConfig, DispatchConfig, ListenerConfig, ObjectPoolConfig};
use corenet::connection::Connection;
use corenet::dispatch::channel::{no_priority, ChannelDispatcher, DispatchChannel};
use corenet::dispatch::inline::InlineDispatcher;
use corenet::dispatch::HandlerTable;
use corenet::listener::Listener;
use corenet::pool::{AcceptContextPool, BufferPool, ObjectPool};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct Frame(u16);

impl Packet for Frame {
    fn opcode(&self) -> u16 {
        self.0
    }
}

struct OpcodeCatalog;

impl PacketCatalog for OpcodeCatalog {
    type Output = Frame;
    fn try_deserialize(&self, bytes: &[u8]) -> Option<Frame> {
        (bytes.len() >= 2).then(|| Frame(u16::from_le_bytes([bytes[0], bytes[1]])))
    }
}

fn test_buffer_pool() -> Arc<BufferPool> {
    BufferPool::new(&BufferPoolConfig {
        allocations: vec![BufferAllocation { size: 4096, ratio: 1.0 }],
        total_buffers: 64,
        ..BufferPoolConfig::default()
    })
}

fn test_accept_pool() -> Arc<AcceptContextPool> {
    ObjectPool::new(ObjectPoolConfig::default().max_capacity)
}

/// Builds a live `Connection` over a loopback socket pair, since
/// `Connection`'s test-only constructor is crate-private and unavailable
/// from here.
async fn loopback_connection() -> Arc<Connection> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (server_side, _client_side) = tokio::join!(
        async { listener.accept().await.unwrap().0 },
        async { TcpStream::connect(addr).await.unwrap() },
    );
    let remote = server_side.peer_addr().unwrap();
    let local = server_side.local_addr().unwrap();
    Connection::new(server_side, remote, local)
}

#[tokio::test]
async fn happy_path_single_packet_reaches_its_handler() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = Arc::clone(&calls);
    let handlers = HandlerTable::<Frame>::builder()
        .register(0x0042, move |_frame, _conn| {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
            }
        })
        .build();
    let dispatcher = Arc::new(InlineDispatcher::new(
        Arc::new(OpcodeCatalog),
        handlers,
        ObjectPoolConfig::default(),
        CancellationToken::new(),
    ));

    let buffer_pool = test_buffer_pool();
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

    let listener = Listener::new(
        ListenerConfig {
            port: 0,
            max_parallel: 2,
            enable_ipv6: false,
            ..ListenerConfig::default()
        },
        buffer_pool,
        test_accept_pool(),
        Arc::new(|_peer| true),
        on_accept,
    );
    let root = CancellationToken::new();
    listener.activate(&root).await.unwrap();
    let port = listener.report().port;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&0x0042u16.to_le_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    listener.deactivate().await;
}

#[tokio::test]
async fn unknown_opcode_never_invokes_any_handler() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = Arc::clone(&calls);
    let handlers = HandlerTable::<Frame>::builder()
        .register(0x0042, move |_frame, _conn| {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
            }
        })
        .build();
    let dispatcher = Arc::new(InlineDispatcher::new(
        Arc::new(OpcodeCatalog),
        handlers,
        ObjectPoolConfig::default(),
        CancellationToken::new(),
    ));

    let buffer_pool = test_buffer_pool();
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

    let listener = Listener::new(
        ListenerConfig {
            port: 0,
            max_parallel: 1,
            enable_ipv6: false,
            ..ListenerConfig::default()
        },
        buffer_pool,
        test_accept_pool(),
        Arc::new(|_peer| true),
        on_accept,
    );
    let root = CancellationToken::new();
    listener.activate(&root).await.unwrap();
    let port = listener.report().port;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&0x9999u16.to_le_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::Relaxed), 0);
    listener.deactivate().await;
}

#[tokio::test]
async fn garbage_input_is_dropped_without_crashing_the_connection() {
    let handlers = HandlerTable::<Frame>::builder().build();
    let dispatcher = Arc::new(InlineDispatcher::new(
        Arc::new(OpcodeCatalog),
        handlers,
        ObjectPoolConfig::default(),
        CancellationToken::new(),
    ));

    let buffer_pool = test_buffer_pool();
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

    let listener = Listener::new(
        ListenerConfig {
            port: 0,
            max_parallel: 1,
            enable_ipv6: false,
            ..ListenerConfig::default()
        },
        buffer_pool,
        test_accept_pool(),
        Arc::new(|_peer| true),
        on_accept,
    );
    let root = CancellationToken::new();
    listener.activate(&root).await.unwrap();
    let port = listener.report().port;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&[0xFF]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(listener.report().connection_count, 1);
    listener.deactivate().await;
}

#[tokio::test]
async fn channel_dispatcher_drains_every_queued_frame_under_load() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = Arc::clone(&calls);
    let handlers = HandlerTable::<Frame>::builder()
        .register(0x0001, move |_frame, _conn| {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
            }
        })
        .build();
    let channel = DispatchChannel::new(1, no_priority());
    let dispatcher = Arc::new(ChannelDispatcher::new(
        Arc::new(OpcodeCatalog),
        handlers,
        Arc::clone(&channel),
        DispatchConfig {
            worker_count: Some(4),
            ..DispatchConfig::default()
        },
    ));
    let root = CancellationToken::new();
    let dispatch_group = dispatcher.activate(&root);

    let buffer_pool = test_buffer_pool();
    let conn = loopback_connection().await;
    const N: usize = 300;
    for _ in 0..N {
        let mut lease = buffer_pool.rent(2).unwrap();
        lease.as_mut_slice()[0..2].copy_from_slice(&1u16.to_le_bytes());
        channel.push(Arc::clone(&conn), lease);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::Relaxed) as usize, N);
    assert_eq!(channel.depth(), 0);

    dispatcher.deactivate(dispatch_group).await;
}

#[tokio::test]
async fn deactivate_during_pending_accept_stops_the_worker_cleanly() {
    let buffer_pool = test_buffer_pool();
    let on_accept = Arc::new(|connection: Arc<Connection>, _cancel: CancellationToken| {
        Box::pin(async move {
            connection.close();
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    });

    let listener = Listener::new(
        ListenerConfig {
            port: 0,
            max_parallel: 2,
            enable_ipv6: false,
            ..ListenerConfig::default()
        },
        buffer_pool,
        test_accept_pool(),
        Arc::new(|_peer| true),
        on_accept,
    );
    let root = CancellationToken::new();
    listener.activate(&root).await.unwrap();

    // No client ever connects; every accept worker is parked on `accept().await`.
    tokio::time::timeout(Duration::from_secs(2), listener.deactivate())
        .await
        .expect("deactivate must not hang while workers are parked on accept");

    assert_eq!(listener.state(), corenet::ListenerState::Stopped);
}

#[tokio::test]
async fn rejected_admission_closes_the_socket_without_tracking_a_connection() {
    let buffer_pool = test_buffer_pool();
    let on_accept = Arc::new(|connection: Arc<Connection>, _cancel: CancellationToken| {
        Box::pin(async move {
            connection.close();
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    });

    let listener = Listener::new(
        ListenerConfig {
            port: 0,
            max_parallel: 1,
            enable_ipv6: false,
            ..ListenerConfig::default()
        },
        buffer_pool,
        test_accept_pool(),
        Arc::new(|_peer| false),
        on_accept,
    );
    let root = CancellationToken::new();
    listener.activate(&root).await.unwrap();
    let port = listener.report().port;

    let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(listener.report().connection_count, 0);
    listener.deactivate().await;
}
