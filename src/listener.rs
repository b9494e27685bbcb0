//! TCP listener: bind, accept-worker pool, admission control, and the
//! orderly Stopped → Starting → Running → Stopping → Stopped lifecycle.
//!
//! Folds every listener responsibility (bind, accept loop, connection
//! bookkeeping, lifecycle transitions) into this one module, matching the
//! teacher's "one file per bound resource" layout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::connection::Connection;
use crate::error::CoreError;
use crate::pool::accept_context::{begin_accept, AcceptContextPool, RawAcceptResult};
use crate::pool::buffer_pool::BufferPool;
use crate::worker_group::WorkerGroup;

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;

/// Observable lifecycle state of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Outcome of one accept-worker iteration after admission control runs.
///
/// Collapses the exception-based "rejected, keep looping" control flow this
/// module is modeled on into a plain sum type matched once in the loop body.
enum AcceptOutcome {
    Accepted(Arc<Connection>),
    Rejected,
    Transient(std::io::Error),
    Shutdown,
}

/// Consulted with a peer address immediately after accept; returning `false`
/// causes the socket to be dropped without a [`Connection`] ever being created.
pub type AdmissionController = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// Invoked once per accepted, admitted connection, on a dedicated task in the
/// `tcp/{port}/process` group. Typically wires up process hooks (feeding
/// frames into a dispatcher) and then calls [`Connection::serve`].
pub type OnAccept = Arc<dyn Fn(Arc<Connection>, CancellationToken) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// A point-in-time operational snapshot. Not a stable wire format —
/// informational only, for logs and diagnostics endpoints.
#[derive(Debug, Clone)]
pub struct ListenerReport {
    pub port: u16,
    pub state: ListenerState,
    pub disposed: bool,
    pub config: ListenerConfig,
    pub connection_count: usize,
}

type ConnectionTable = Arc<SyncMutex<HashMap<u64, Arc<Connection>>>>;

/// Binds a listening socket and drives its accept-worker pool through the
/// lifecycle state machine described in the module's invariants.
pub struct Listener {
    config: ListenerConfig,
    state: AtomicU8,
    activate_lock: AsyncMutex<()>,
    bound_port: AtomicU64,
    socket: SyncMutex<Option<Arc<TokioTcpListener>>>,
    buffer_pool: Arc<BufferPool>,
    accept_pool: Arc<AcceptContextPool>,
    admission: AdmissionController,
    on_accept: OnAccept,
    connections: ConnectionTable,
    next_connection_id: AtomicU64,
    shutdown_token: SyncMutex<Option<CancellationToken>>,
    accept_group: SyncMutex<Option<WorkerGroup>>,
    process_group: SyncMutex<Option<Arc<SyncMutex<WorkerGroup>>>>,
    disposed: AtomicBool,
}

impl Listener {
    /// Builds a listener. The socket is not bound until [`Listener::activate`].
    pub fn new(
        config: ListenerConfig,
        buffer_pool: Arc<BufferPool>,
        accept_pool: Arc<AcceptContextPool>,
        admission: AdmissionController,
        on_accept: OnAccept,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: AtomicU8::new(STOPPED),
            activate_lock: AsyncMutex::new(()),
            bound_port: AtomicU64::new(0),
            socket: SyncMutex::new(None),
            buffer_pool,
            accept_pool,
            admission,
            on_accept,
            connections: Arc::new(SyncMutex::new(HashMap::new())),
            next_connection_id: AtomicU64::new(1),
            shutdown_token: SyncMutex::new(None),
            accept_group: SyncMutex::new(None),
            process_group: SyncMutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ListenerState {
        match self.state.load(Ordering::Acquire) {
            STOPPED => ListenerState::Stopped,
            STARTING => ListenerState::Starting,
            RUNNING => ListenerState::Running,
            _ => ListenerState::Stopping,
        }
    }

    /// Binds (if needed) and starts `config.max_parallel` accept workers
    /// under group `tcp/{port}`, with a `tcp/{port}/process` group ready to
    /// receive per-connection tasks.
    ///
    /// A no-op if the listener isn't currently Stopped. Returns
    /// [`CoreError::InvalidConfig`] if `max_parallel == 0`.
    pub async fn activate(self: &Arc<Self>, parent: &CancellationToken) -> Result<(), CoreError> {
        if self.config.max_parallel == 0 {
            return Err(CoreError::InvalidConfig("max_parallel must be >= 1"));
        }
        if self
            .state
            .compare_exchange(STOPPED, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let _guard = self.activate_lock.lock().await;

        if let Err(err) = self.ensure_bound().await {
            self.state.store(STOPPED, Ordering::Release);
            return Err(err);
        }

        let token = parent.child_token();
        *self.shutdown_token.lock() = Some(token.clone());

        let port = self.bound_port.load(Ordering::Relaxed);
        let process_token = token.child_token();
        let process_group = Arc::new(SyncMutex::new(WorkerGroup::new(
            format!("tcp/{port}/process"),
            &process_token,
        )));
        *self.process_group.lock() = Some(Arc::clone(&process_group));

        let mut accept_group = WorkerGroup::new(format!("tcp/{port}"), &token);
        for _ in 0..self.config.max_parallel {
            let listener = Arc::clone(self);
            let process_group = Arc::clone(&process_group);
            accept_group.spawn(move |worker_token| async move {
                listener.run_accept_worker(worker_token, process_group).await;
            });
        }
        if let Some(handle) = self.buffer_pool.spawn_periodic_trim(accept_group.token()) {
            accept_group.adopt(handle);
        }
        *self.accept_group.lock() = Some(accept_group);

        self.state.store(RUNNING, Ordering::Release);
        Ok(())
    }

    async fn ensure_bound(&self) -> Result<(), CoreError> {
        if self.socket.lock().is_some() {
            return Ok(());
        }

        let port = self.config.port;
        let std_socket = if self.config.enable_ipv6 {
            match bind_dual_stack(port, &self.config) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(error = %err, "dual-stack bind failed, falling back to IPv4");
                    bind_ipv4(port, &self.config).map_err(CoreError::Bind)?
                }
            }
        } else {
            bind_ipv4(port, &self.config).map_err(CoreError::Bind)?
        };

        std_socket.set_nonblocking(true).map_err(CoreError::Bind)?;
        let tokio_listener = TokioTcpListener::from_std(std_socket).map_err(CoreError::Bind)?;
        let actual_port = tokio_listener.local_addr().map_err(CoreError::Bind)?.port();
        self.bound_port.store(actual_port as u64, Ordering::Relaxed);
        *self.socket.lock() = Some(Arc::new(tokio_listener));
        Ok(())
    }

    async fn run_accept_worker(
        self: Arc<Self>,
        cancel: CancellationToken,
        process_group: Arc<SyncMutex<WorkerGroup>>,
    ) {
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => AcceptOutcome::Shutdown,
                outcome = self.try_accept_one() => outcome,
            };

            match outcome {
                AcceptOutcome::Accepted(connection) => {
                    self.register_connection(&connection);
                    let on_accept = Arc::clone(&self.on_accept);
                    process_group.lock().spawn(move |worker_token| async move {
                        on_accept(connection, worker_token).await;
                    });
                }
                AcceptOutcome::Rejected => {}
                AcceptOutcome::Transient(err) => {
                    tracing::debug!(error = %err, "transient accept error, backing off");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                AcceptOutcome::Shutdown => break,
            }
        }
    }

    async fn try_accept_one(&self) -> AcceptOutcome {
        let listener = {
            let guard = self.socket.lock();
            match guard.as_ref() {
                Some(l) => Arc::clone(l),
                None => return AcceptOutcome::Shutdown,
            }
        };

        match begin_accept(&self.accept_pool, &listener).await {
            RawAcceptResult::Accepted(stream, peer) => {
                if !(self.admission)(peer) {
                    drop(stream);
                    return AcceptOutcome::Rejected;
                }
                if let Err(err) = configure_socket(&stream, &self.config) {
                    tracing::debug!(error = %err, "failed to tune accepted socket");
                }
                let local = stream.local_addr().unwrap_or(peer);
                AcceptOutcome::Accepted(Connection::new(stream, peer, local))
            }
            RawAcceptResult::Transient(err) => AcceptOutcome::Transient(err),
            RawAcceptResult::Fatal(_) => AcceptOutcome::Shutdown,
        }
    }

    fn register_connection(&self, connection: &Arc<Connection>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(id, Arc::clone(connection));

        let connections = Arc::clone(&self.connections);
        connection.subscribe_close(move |_conn| {
            connections.lock().remove(&id);
        });
    }

    /// Cancels the accept and process worker groups, closes the listening
    /// socket, and closes every tracked connection. A no-op if the listener
    /// isn't currently Running or Starting.
    pub async fn deactivate(self: &Arc<Self>) {
        let prior = self.state.swap(STOPPING, Ordering::AcqRel);
        if prior != RUNNING && prior != STARTING {
            self.state.store(prior, Ordering::Release);
            return;
        }

        let _guard = self.activate_lock.lock().await;

        if let Some(token) = self.shutdown_token.lock().take() {
            token.cancel();
        }

        if let Some(group) = self.accept_group.lock().take() {
            group.shutdown().await;
        }
        if let Some(shared) = self.process_group.lock().take() {
            match Arc::try_unwrap(shared) {
                Ok(inner) => inner.into_inner().shutdown().await,
                Err(shared) => shared.lock().cancel(),
            }
        }

        self.socket.lock().take();

        let connections: Vec<Arc<Connection>> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.close();
        }

        self.state.store(STOPPED, Ordering::Release);
    }

    /// Marks the listener as permanently retired and releases its bound
    /// socket and tracked connections. Idempotent.
    pub async fn dispose(self: &Arc<Self>) {
        self.deactivate().await;
        self.disposed.store(true, Ordering::Release);
    }

    /// Produces a textual operational snapshot. Informational only.
    pub fn report(&self) -> ListenerReport {
        ListenerReport {
            port: self.bound_port.load(Ordering::Relaxed) as u16,
            state: self.state(),
            disposed: self.disposed.load(Ordering::Relaxed),
            config: self.config.clone(),
            connection_count: self.connections.lock().len(),
        }
    }
}

fn bind_dual_stack(port: u16, cfg: &ListenerConfig) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    if cfg.reuse_address {
        socket.set_reuse_address(true)?;
    }
    let addr: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    socket.listen(cfg.backlog as i32)?;
    Ok(socket.into())
}

fn bind_ipv4(port: u16, cfg: &ListenerConfig) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    if cfg.reuse_address {
        socket.set_reuse_address(true)?;
    }
    let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    socket.listen(cfg.backlog as i32)?;
    Ok(socket.into())
}

fn configure_socket(stream: &tokio::net::TcpStream, cfg: &ListenerConfig) -> std::io::Result<()> {
    stream.set_nodelay(cfg.no_delay)?;

    if let Some(ka) = &cfg.keep_alive {
        let sock_ref = socket2::SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(ka.time)
            .with_interval(ka.interval);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let keepalive = keepalive.with_retries(ka.retry_count);
        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}
