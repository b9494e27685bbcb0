//! Packet dispatch: resolving a decoded packet's opcode to a handler and
//! invoking it, in either the inline or channel-backed variant.

pub mod channel;
pub mod inline;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::catalog::Packet;
use crate::connection::Connection;

/// A resolved handler's invocation signature: takes the decoded packet and
/// the connection it arrived on, returns a future that never itself errors —
/// handler-side failures are the handler's responsibility to report through
/// its own counters, never the dispatcher's.
pub type BoxedHandler<P> =
    Arc<dyn Fn(P, Arc<Connection>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Read-only opcode → handler map, built once at startup.
///
/// No synchronization is needed on the read path: once constructed, the
/// table is never mutated, only shared via `Arc`.
pub struct HandlerTable<P: Packet> {
    handlers: HashMap<u16, BoxedHandler<P>>,
}

impl<P: Packet> HandlerTable<P> {
    pub fn builder() -> HandlerTableBuilder<P> {
        HandlerTableBuilder::default()
    }

    pub fn try_resolve(&self, opcode: u16) -> Option<&BoxedHandler<P>> {
        self.handlers.get(&opcode)
    }
}

pub struct HandlerTableBuilder<P: Packet> {
    handlers: HashMap<u16, BoxedHandler<P>>,
}

impl<P: Packet> Default for HandlerTableBuilder<P> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<P: Packet> HandlerTableBuilder<P> {
    /// Registers `handler` for `opcode`. Later registrations for the same
    /// opcode replace earlier ones.
    pub fn register<F, Fut>(mut self, opcode: u16, handler: F) -> Self
    where
        F: Fn(P, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(move |packet: P, conn: Arc<Connection>| {
            Box::pin(handler(packet, conn)) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        self.handlers.insert(opcode, handler);
        self
    }

    pub fn build(self) -> Arc<HandlerTable<P>> {
        Arc::new(HandlerTable {
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pkt(u16);
    impl Packet for Pkt {
        fn opcode(&self) -> u16 {
            self.0
        }
    }

    #[test]
    fn resolves_registered_opcode() {
        let table = HandlerTable::<Pkt>::builder()
            .register(0x42, |_p, _c| async {})
            .build();
        assert!(table.try_resolve(0x42).is_some());
        assert!(table.try_resolve(0x99).is_none());
    }
}
