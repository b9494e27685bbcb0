//! Accept context: per-accept kernel-state wrapper, pooled across calls.
//!
//! Tokio's `TcpListener::accept` doesn't expose separate "arm" and "poll"
//! steps the way an IOCP-style accept does, so there is no OS handle to hold
//! between accepts. What's left to pool is the bookkeeping an accept worker
//! needs per attempt (a resettable slot for admission-control state and
//! per-attempt diagnostics), which still benefits from the same pool-and-reset
//! discipline the other pooled resources use.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};

use crate::pool::object_pool::{ObjectPool, Poolable};

/// Pooled per-accept state, rented before each accept attempt and returned
/// once the attempt resolves (success, rejection, or error).
#[derive(Default)]
pub struct AcceptContext {
    /// Wall-clock time the accept was issued, for back-off and latency logs.
    pub issued_at: Option<Instant>,
    /// Peer address of the most recently completed accept, if any.
    pub last_peer: Option<SocketAddr>,
}

impl Poolable for AcceptContext {
    fn reset_for_pool(&mut self) {
        self.issued_at = None;
        self.last_peer = None;
    }
}

/// Outcome of one `begin_accept` call.
pub enum RawAcceptResult {
    /// A socket was accepted from `peer`.
    Accepted(TcpStream, SocketAddr),
    /// The accept failed with an error outside the ignorable set: the worker
    /// logs it, backs off 50ms, and continues accepting.
    Transient(std::io::Error),
    /// The accept failed with an error in the ignorable set, or the worker
    /// should otherwise stop; the accept loop exits without further logging.
    Fatal(std::io::Error),
}

pub type AcceptContextPool = ObjectPool<AcceptContext>;

/// Rents a context, issues the accept, and classifies the result.
///
/// The context is always handed back to `pool` before returning, mirroring
/// the "context returns when the accept completes or fails" lifecycle even
/// though tokio's accept has no separate re-arm step to drive explicitly.
pub async fn begin_accept(
    pool: &Arc<AcceptContextPool>,
    listener: &TcpListener,
) -> RawAcceptResult {
    let mut ctx = pool.get();
    ctx.issued_at = Some(Instant::now());

    let outcome = match listener.accept().await {
        Ok((stream, peer)) => {
            ctx.last_peer = Some(peer);
            RawAcceptResult::Accepted(stream, peer)
        }
        Err(err) => {
            if is_ignorable(&err) {
                RawAcceptResult::Fatal(err)
            } else {
                RawAcceptResult::Transient(err)
            }
        }
    };

    pool.return_to_pool(ctx);
    outcome
}

/// Error kinds the accept worker treats as terminal: on a match, the worker
/// exits its loop instead of logging and backing off.
fn is_ignorable(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        Interrupted | WouldBlock | TimedOut | NotConnected | ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_last_peer_and_timestamp() {
        let mut ctx = AcceptContext {
            issued_at: Some(Instant::now()),
            last_peer: Some(([127, 0, 0, 1], 8080).into()),
        };
        ctx.reset_for_pool();
        assert!(ctx.issued_at.is_none());
        assert!(ctx.last_peer.is_none());
    }

    #[tokio::test]
    async fn begin_accept_returns_accepted_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool: Arc<AcceptContextPool> = ObjectPool::new(4);

        let client = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            TcpStream::connect(addr).await.unwrap()
        });

        let outcome = begin_accept(&pool, &listener).await;
        assert!(matches!(outcome, RawAcceptResult::Accepted(_, _)));
        let _ = client.await.unwrap();
        assert_eq!(pool.stats().returns, 1);
    }
}
