//! Accepted-connection lifecycle: hook subscription, idempotent close, and
//! the per-connection receive loop that feeds the dispatcher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::pool::buffer_pool::{BufferPool, PooledBuffer};

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Observable lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Opaque handle returned by `subscribe_*`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type ProcessHook = Box<dyn Fn(&Connection, &PooledBuffer) + Send + Sync>;
type PostProcessHook = Box<dyn Fn(&Connection) + Send + Sync>;
type CloseHook = Box<dyn Fn(&Connection) + Send + Sync>;

/// An accepted TCP connection.
///
/// Holds an optional [`Weak`] back-reference to whatever owns it (the
/// listener, in production use) so the listener and its connections never
/// form a strong reference cycle: the listener's own `OnClose` handling drops
/// its strong reference table entry, letting the weak reference expire.
pub struct Connection {
    socket: Mutex<Option<TcpStream>>,
    remote: SocketAddr,
    local: SocketAddr,
    state: AtomicU8,
    next_hook_id: AtomicU64,
    process_hooks: Mutex<Vec<(HookId, ProcessHook)>>,
    post_process_hooks: Mutex<Vec<(HookId, PostProcessHook)>>,
    close_hooks: Mutex<Vec<(HookId, CloseHook)>>,
    owner: Mutex<Option<Weak<dyn std::any::Any + Send + Sync>>>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Wraps an accepted socket. `remote`/`local` are cached at construction
    /// since `TcpStream::peer_addr`/`local_addr` can fail once the socket is
    /// torn down.
    pub fn new(socket: TcpStream, remote: SocketAddr, local: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            socket: Mutex::new(Some(socket)),
            remote,
            local,
            state: AtomicU8::new(STATE_OPEN),
            next_hook_id: AtomicU64::new(1),
            process_hooks: Mutex::new(Vec::new()),
            post_process_hooks: Mutex::new(Vec::new()),
            close_hooks: Mutex::new(Vec::new()),
            owner: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Records a weak back-reference to this connection's owning listener.
    pub fn set_owner(&self, owner: Weak<dyn std::any::Any + Send + Sync>) {
        *self.owner.lock() = Some(owner);
    }

    /// The owning listener, if it is still alive and one was recorded.
    pub fn owner(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Peer address, cached from accept time.
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    /// Local (listener-side) address, cached from accept time.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn next_id(&self) -> HookId {
        HookId(self.next_hook_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribes a callback invoked once per received frame, with the
    /// leased buffer holding that frame's bytes. No-op (returns `None`) once
    /// the connection has left the Open state — the hook list is append-only
    /// while open and frozen thereafter.
    pub fn subscribe_process<F>(&self, f: F) -> Option<HookId>
    where
        F: Fn(&Connection, &PooledBuffer) + Send + Sync + 'static,
    {
        if self.state() != ConnectionState::Open {
            return None;
        }
        let id = self.next_id();
        self.process_hooks.lock().push((id, Box::new(f)));
        Some(id)
    }

    /// Subscribes a callback invoked after every `on_process` dispatch completes.
    pub fn subscribe_post_process<F>(&self, f: F) -> Option<HookId>
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        if self.state() != ConnectionState::Open {
            return None;
        }
        let id = self.next_id();
        self.post_process_hooks.lock().push((id, Box::new(f)));
        Some(id)
    }

    /// Subscribes a callback invoked exactly once when the connection closes.
    pub fn subscribe_close<F>(&self, f: F) -> Option<HookId>
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        if self.state() != ConnectionState::Open {
            return None;
        }
        let id = self.next_id();
        self.close_hooks.lock().push((id, Box::new(f)));
        Some(id)
    }

    /// Removes a previously registered hook by identity, searching all three
    /// lists. A no-op if the id is unknown or already removed.
    pub fn unsubscribe(&self, id: HookId) {
        self.process_hooks.lock().retain(|(hid, _)| *hid != id);
        self.post_process_hooks.lock().retain(|(hid, _)| *hid != id);
        self.close_hooks.lock().retain(|(hid, _)| *hid != id);
    }

    /// Idempotent close: the first caller to observe `Open` runs every close
    /// hook (most-recently-registered first) and releases the socket;
    /// subsequent calls from any thread are no-ops.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        for (_, hook) in hooks.into_iter().rev() {
            hook(self);
        }
        self.process_hooks.lock().clear();
        self.post_process_hooks.lock().clear();

        self.socket.lock().take();
        self.shutdown.cancel();
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Runs the receive loop until EOF, an I/O error, or `close()` is called
    /// from any thread.
    ///
    /// Each successfully read frame is leased from `buffer_pool`, handed to
    /// `on_frame` (the connection's primary dispatch sink — typically an
    /// inline decode-and-invoke or a non-blocking push into a dispatch
    /// channel), then to every `on_process`/`on_post_process` subscriber in
    /// registration order. Always closes the connection before returning.
    ///
    /// Takes ownership of the socket for the duration of the loop instead of
    /// re-locking per iteration, so a concurrent `close()` never blocks on an
    /// in-flight read.
    pub async fn serve<F, Fut>(
        self: &Arc<Self>,
        buffer_pool: &Arc<BufferPool>,
        frame_size: usize,
        on_frame: F,
    ) where
        F: Fn(Arc<Connection>, PooledBuffer) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let Some(mut stream) = self.socket.lock().take() else {
            return;
        };

        loop {
            let mut lease = match buffer_pool.rent(frame_size) {
                Ok(lease) => lease,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to rent receive buffer");
                    break;
                }
            };

            let n = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = stream.read(lease.as_mut_capacity()) => result,
            };

            let n = match n {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(error = %err, peer = %self.remote, "connection read error");
                    break;
                }
            };
            lease.set_valid_len(n);

            for (_, hook) in self.process_hooks.lock().iter() {
                hook(self, &lease);
            }
            on_frame(Arc::clone(self), lease).await;
            for (_, hook) in self.post_process_hooks.lock().iter() {
                hook(self);
            }
        }

        drop(stream);
        self.close();
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<Self> {
        Arc::new(Self {
            socket: Mutex::new(None),
            remote: ([127, 0, 0, 1], 0).into(),
            local: ([127, 0, 0, 1], 0).into(),
            state: AtomicU8::new(STATE_OPEN),
            next_hook_id: AtomicU64::new(1),
            process_hooks: Mutex::new(Vec::new()),
            post_process_hooks: Mutex::new(Vec::new()),
            close_hooks: Mutex::new(Vec::new()),
            owner: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_is_idempotent_and_runs_hooks_once() {
        let conn = Connection::new_for_test();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        conn.subscribe_close(move |_| {
            calls2.fetch_add(1, Ordering::Relaxed);
        });

        conn.close();
        conn.close();
        conn.close();

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn close_hooks_run_in_reverse_registration_order() {
        let conn = Connection::new_for_test();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            conn.subscribe_close(move |_| order.lock().push(i));
        }
        conn.close();

        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn subscribe_after_close_is_rejected() {
        let conn = Connection::new_for_test();
        conn.close();
        assert!(conn.subscribe_close(|_| {}).is_none());
        assert!(conn.subscribe_process(|_, _| {}).is_none());
    }

    #[test]
    fn unsubscribe_removes_hook_before_close() {
        let conn = Connection::new_for_test();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let id = conn.subscribe_close(move |_| {
            calls2.fetch_add(1, Ordering::Relaxed);
        }).unwrap();

        conn.unsubscribe(id);
        conn.close();

        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }
}
