//! Channel dispatcher: a priority-aware queue drained by a fixed worker pool.
//!
//! Priority classes are plain `crossbeam::queue::SegQueue` instances, one per
//! class, indexed low-to-high; a `tokio::sync::Semaphore` counts pending
//! items across every class so workers can block without polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::catalog::PacketCatalog;
use crate::config::DispatchConfig;
use crate::connection::Connection;
use crate::context::PacketContext;
use crate::dispatch::HandlerTable;
use crate::pool::buffer_pool::PooledBuffer;
use crate::pool::object_pool::ObjectPool;
use crate::worker_group::WorkerGroup;

type QueueItem = (Arc<Connection>, PooledBuffer);

/// Derives a pending item's priority class index (`0` = lowest).
///
/// The source system's exact priority derivation isn't part of this
/// contract; callers provide one. A connection-blind default that always
/// returns class `0` is supplied by [`DispatchChannel::new`] when the caller
/// doesn't need differentiated priority.
pub type PriorityFn = Arc<dyn Fn(&Connection, &PooledBuffer) -> usize + Send + Sync>;

/// Priority-aware MPMC queue of `(connection, leased buffer)` pairs.
///
/// Safe for many concurrent pushers and many concurrent pullers. Ordering is
/// FIFO within a priority class and strictly priority-ordered across classes;
/// no ordering is implied between items pushed from different connections in
/// the same class beyond arrival order.
pub struct DispatchChannel {
    classes: Vec<SegQueue<QueueItem>>,
    priority_of: PriorityFn,
    semaphore: Semaphore,
    depth: AtomicU64,
}

impl DispatchChannel {
    /// Builds a channel with `priority_classes` queues (class `0` lowest,
    /// `priority_classes - 1` highest), using `priority_of` to route pushes.
    pub fn new(priority_classes: usize, priority_of: PriorityFn) -> Arc<Self> {
        let classes = (0..priority_classes.max(1)).map(|_| SegQueue::new()).collect();
        Arc::new(Self {
            classes,
            priority_of,
            semaphore: Semaphore::new(0),
            depth: AtomicU64::new(0),
        })
    }

    /// Pushes an item and releases one semaphore permit.
    pub fn push(&self, connection: Arc<Connection>, lease: PooledBuffer) {
        let class = (self.priority_of)(&connection, &lease).min(self.classes.len() - 1);
        self.classes[class].push((connection, lease));
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.semaphore.add_permits(1);
    }

    /// Pops the highest-priority pending item, if any.
    ///
    /// Called after a semaphore permit was acquired; a `None` result means
    /// another worker won the race for that permit's item, which callers
    /// treat as a harmless no-op.
    pub fn pull(&self) -> Option<QueueItem> {
        for queue in self.classes.iter().rev() {
            if let Some(item) = queue.pop() {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                return Some(item);
            }
        }
        None
    }

    /// Total items currently queued across all classes.
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Lightweight per-worker counters, advanced once per processed item.
#[derive(Default)]
struct WorkerAccounting {
    processed: AtomicU64,
}

impl WorkerAccounting {
    fn advance(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }
}

/// Drains a [`DispatchChannel`] with a fixed pool of worker tasks, each
/// decoding via the catalog and invoking the resolved handler.
pub struct ChannelDispatcher<C: PacketCatalog> {
    catalog: Arc<C>,
    handlers: Arc<HandlerTable<C::Output>>,
    channel: Arc<DispatchChannel>,
    context_pool: Arc<ObjectPool<PacketContext<C::Output>>>,
    config: DispatchConfig,
}

impl<C: PacketCatalog> ChannelDispatcher<C> {
    pub fn new(
        catalog: Arc<C>,
        handlers: Arc<HandlerTable<C::Output>>,
        channel: Arc<DispatchChannel>,
        config: DispatchConfig,
    ) -> Self {
        let context_pool = ObjectPool::with_preallocated(
            config.context_pool.max_capacity,
            config.context_pool.preallocate,
        );
        Self {
            catalog,
            handlers,
            channel,
            context_pool,
            config,
        }
    }

    pub fn channel(&self) -> &Arc<DispatchChannel> {
        &self.channel
    }

    /// Starts `clamp(cores/2, 2, 12)` (or the configured override) workers in
    /// a `packet-dispatch` group linked to `parent`.
    pub fn activate(&self, parent: &CancellationToken) -> WorkerGroup {
        let worker_count = self.config.resolved_worker_count();
        let mut group = WorkerGroup::new("packet-dispatch", parent);

        for _ in 0..worker_count {
            let catalog = Arc::clone(&self.catalog);
            let handlers = Arc::clone(&self.handlers);
            let channel = Arc::clone(&self.channel);
            let context_pool = Arc::clone(&self.context_pool);

            group.spawn(move |token| async move {
                run_worker(catalog, handlers, channel, context_pool, token).await;
            });
        }

        group
    }

    /// Cancels and awaits `group`, releasing `max(workers, 1)` extra permits
    /// first so any worker currently blocked on the semaphore wakes and
    /// observes cancellation instead of waiting indefinitely.
    pub async fn deactivate(&self, group: WorkerGroup) {
        let wake = self.config.resolved_worker_count().max(1);
        self.channel.semaphore.add_permits(wake);
        group.shutdown().await;
    }
}

async fn run_worker<C: PacketCatalog>(
    catalog: Arc<C>,
    handlers: Arc<HandlerTable<C::Output>>,
    channel: Arc<DispatchChannel>,
    context_pool: Arc<ObjectPool<PacketContext<C::Output>>>,
    cancel: CancellationToken,
) {
    let accounting = WorkerAccounting::default();

    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = channel.semaphore.acquire() => permit,
        };
        let Ok(permit) = permit else { break };
        permit.forget();

        let Some((connection, lease)) = channel.pull() else {
            tracing::trace!("semaphore permit observed with no pulled item");
            continue;
        };

        if let Some(packet) = catalog.try_deserialize(lease.as_slice()) {
            dispatch_one(&handlers, &context_pool, &cancel, packet, &connection).await;
        } else {
            tracing::warn!(
                len = lease.len(),
                preview = %crate::catalog::hex_preview(lease.as_slice()),
                "catalog failed to deserialize queued payload"
            );
        }
        drop(lease);

        accounting.advance(1);
    }
}

/// Brackets one handler invocation with a pooled [`PacketContext`]: the
/// context is initialized with the packet and connection, the packet is
/// taken back out to hand to the handler by value, and the context returns
/// to its pool once the handler (run in its own spawned task for panic
/// isolation) completes.
async fn dispatch_one<P: crate::catalog::Packet>(
    handlers: &Arc<HandlerTable<P>>,
    context_pool: &Arc<ObjectPool<PacketContext<P>>>,
    cancel: &CancellationToken,
    packet: P,
    connection: &Arc<Connection>,
) {
    let opcode = packet.opcode();
    let Some(handler) = handlers.try_resolve(opcode) else {
        tracing::warn!(opcode, "no handler registered for opcode");
        return;
    };

    let mut ctx = context_pool.get();
    ctx.initialize(packet, Arc::clone(connection), None, cancel.child_token());
    if let Some(packet) = ctx.take_packet() {
        let fut = handler(packet, Arc::clone(connection));
        if let Err(panic) = tokio::spawn(fut).await {
            tracing::error!(opcode, error = %panic, "handler panicked; worker continues");
        }
    }
    ctx.return_to_pool(context_pool);
}

/// A [`PriorityFn`] that assigns every item the lowest class, for callers
/// with no priority distinction to make.
pub fn no_priority() -> PriorityFn {
    Arc::new(|_: &Connection, _: &PooledBuffer| 0)
}
