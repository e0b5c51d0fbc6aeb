//! In-process broker.
//!
//! Queues live in the broker, not in a link, so they survive link loss just
//! like durable queues on a real server. Unacknowledged deliveries go back
//! to the head of their queue (flagged redelivered) when the link that
//! received them closes. A link's channel can also be closed on its own,
//! leaving the connection up. Failure injection and counters make it the fake
//! used throughout the test suites; `memory://` URLs select it at runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transport::{
    Acker, BoxFuture, DeliveryStream, Link, RawDelivery, Transport, TransportError,
};
use crate::types::{OutboundMessage, QueueInfo, QueueSpec};

/// A message at rest in a memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
    pub redelivered: bool,
}

/// Snapshot of the broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connects: u64,
    pub connect_failures: u64,
    /// Links closed by their owner (not severed).
    pub closes: u64,
    pub severs: u64,
    /// Channels closed by the broker under a live connection.
    pub channel_closes: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    pub expired: u64,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    closes: AtomicU64,
    severs: AtomicU64,
    channel_closes: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    requeued: AtomicU64,
    expired: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Decrements `counter` if positive; `true` when a failure should be injected.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

struct Stored {
    message: QueuedMessage,
    enqueued_at: Instant,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Stored>,
    /// delivery tag -> (link id, message)
    unacked: HashMap<u64, (u64, Stored)>,
    /// consumer id -> link id
    consumers: HashMap<u64, u64>,
    ttl: Option<Duration>,
}

impl Queue {
    fn expire(&mut self, counters: &Counters) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let before = self.ready.len();
        self.ready.retain(|stored| stored.enqueued_at.elapsed() < ttl);
        for _ in self.ready.len()..before {
            bump(&counters.expired);
        }
    }

    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            pending_message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    fn requeue_link(&mut self, link_id: u64, counters: &Counters) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == link_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so the oldest ends up at the head.
        let mut tags = tags;
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some((_, mut stored)) = self.unacked.remove(&tag) {
                stored.message.redelivered = true;
                self.ready.push_front(stored);
                bump(&counters.requeued);
            }
        }
        self.consumers.retain(|_, owner| *owner != link_id);
    }
}

struct LinkHandle {
    /// Connection lifetime.
    token: CancellationToken,
    /// Channel lifetime; a child of `token`.
    channel: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl LinkHandle {
    fn new() -> Self {
        let token = CancellationToken::new();
        let channel = token.child_token();
        Self {
            token,
            channel,
            reason: Mutex::new(None),
        }
    }

    fn channel_open(&self) -> bool {
        !self.channel.is_cancelled()
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    links: HashMap<u64, Arc<LinkHandle>>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Notify,
    counters: Counters,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the link from the live set and requeues what it held.
    /// Returns `false` if the link was already gone.
    fn detach_link(&self, link_id: u64, reason: &str) -> bool {
        let handle = {
            let mut state = self.lock();
            let Some(handle) = state.links.remove(&link_id) else {
                return false;
            };
            for queue in state.queues.values_mut() {
                queue.requeue_link(link_id, &self.counters);
            }
            handle
        };
        if let Ok(mut slot) = handle.reason.lock() {
            slot.get_or_insert_with(|| reason.to_string());
        }
        handle.token.cancel();
        self.wake.notify_waiters();
        true
    }

    /// Closes the link's channel only; the connection stays up.
    fn close_channel(&self, link_id: u64) -> bool {
        let handle = {
            let mut state = self.lock();
            let Some(handle) = state.links.get(&link_id).cloned() else {
                return false;
            };
            if !handle.channel_open() {
                return false;
            }
            for queue in state.queues.values_mut() {
                queue.requeue_link(link_id, &self.counters);
            }
            handle
        };
        handle.channel.cancel();
        self.wake.notify_waiters();
        true
    }

    fn channel_open(&self, state: &State, link_id: u64) -> bool {
        state.links.get(&link_id).is_some_and(|h| h.channel_open())
    }

    /// Moves the head of `queue` to the unacked set on behalf of `link_id`.
    fn take_ready(&self, queue: &str, link_id: u64) -> Option<(u64, QueuedMessage)> {
        let mut state = self.lock();
        if !self.channel_open(&state, link_id) {
            return None;
        }
        let tag = state.next_id();
        let q = state.queues.get_mut(queue)?;
        q.expire(&self.counters);
        let stored = q.ready.pop_front()?;
        let message = stored.message.clone();
        q.unacked.insert(tag, (link_id, stored));
        Some((tag, message))
    }
}

/// In-process broker shared by every link it hands out. Cloning is cheap
/// and yields a handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_connects.store(n, Ordering::Release);
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.fail_publishes.store(n, Ordering::Release);
    }

    /// Simulates a broker-side disconnect of every live link.
    pub fn sever(&self) {
        let ids: Vec<u64> = self.shared.lock().links.keys().copied().collect();
        for id in ids {
            if self.shared.detach_link(id, "connection severed by broker") {
                bump(&self.shared.counters.severs);
            }
        }
        debug!("memory broker severed all links");
    }

    /// Simulates the broker closing every link's channel while the
    /// connections stay up (e.g. a channel-level protocol error). Link
    /// closure is not signalled; consumer streams end and channel
    /// operations fail.
    pub fn close_channels(&self) {
        let ids: Vec<u64> = self.shared.lock().links.keys().copied().collect();
        for id in ids {
            if self.shared.close_channel(id) {
                bump(&self.shared.counters.channel_closes);
            }
        }
        debug!("memory broker closed all channels");
    }

    /// Ready messages in `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<QueuedMessage> {
        let mut state = self.shared.lock();
        match state.queues.get_mut(queue) {
            Some(q) => {
                q.expire(&self.shared.counters);
                q.ready.iter().map(|s| s.message.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.peek(queue).len()
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn consumers(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn live_links(&self) -> usize {
        self.shared.lock().links.len()
    }

    pub fn stats(&self) -> MemoryStats {
        let c = &self.shared.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MemoryStats {
            connects: load(&c.connects),
            connect_failures: load(&c.connect_failures),
            closes: load(&c.closes),
            severs: load(&c.severs),
            channel_closes: load(&c.channel_closes),
            published: load(&c.published),
            publish_failures: load(&c.publish_failures),
            acked: load(&c.acked),
            nacked: load(&c.nacked),
            requeued: load(&c.requeued),
            expired: load(&c.expired),
        }
    }
}

impl Transport for MemoryBroker {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Link>, TransportError>> {
        Box::pin(async move {
            if take_failure(&self.shared.fail_connects) {
                bump(&self.shared.counters.connect_failures);
                return Err(TransportError::new("connection refused"));
            }
            let handle = Arc::new(LinkHandle::new());
            let id = {
                let mut state = self.shared.lock();
                let id = state.next_id();
                state.links.insert(id, Arc::clone(&handle));
                id
            };
            bump(&self.shared.counters.connects);
            trace!(link = id, "memory link opened");
            let link: Arc<dyn Link> = Arc::new(MemoryLink {
                id,
                shared: Arc::clone(&self.shared),
                handle,
            });
            Ok(link)
        })
    }

    fn describe(&self) -> String {
        "memory://".into()
    }
}

struct MemoryLink {
    id: u64,
    shared: Arc<Shared>,
    handle: Arc<LinkHandle>,
}

impl MemoryLink {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if !self.handle.channel_open() {
            Err(TransportError::new("channel closed"))
        } else {
            Ok(())
        }
    }
}

impl Link for MemoryLink {
    fn declare_queue<'a>(
        &'a self,
        spec: &'a QueueSpec,
    ) -> BoxFuture<'a, Result<QueueInfo, TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.shared.lock();
            let queue = state.queues.entry(spec.name.clone()).or_insert_with(|| Queue {
                ttl: spec.message_ttl_ms.map(|ms| Duration::from_millis(ms.into())),
                ..Queue::default()
            });
            queue.expire(&self.shared.counters);
            Ok(queue.info(&spec.name))
        })
    }

    fn publish<'a>(
        &'a self,
        queue: &'a str,
        message: &'a OutboundMessage,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            if take_failure(&self.shared.fail_publishes) {
                bump(&self.shared.counters.publish_failures);
                return Err(TransportError::new("publish rejected"));
            }
            {
                let mut state = self.shared.lock();
                let q = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| TransportError::new(format!("no queue '{queue}'")))?;
                q.ready.push_back(Stored {
                    message: QueuedMessage {
                        payload: message.payload.clone(),
                        content_type: message.content_type.clone(),
                        persistent: message.persistent,
                        redelivered: false,
                    },
                    enqueued_at: Instant::now(),
                });
            }
            bump(&self.shared.counters.published);
            self.shared.wake.notify_waiters();
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<DeliveryStream, TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let consumer_id = {
                let mut state = self.shared.lock();
                let id = state.next_id();
                let q = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| TransportError::new(format!("no queue '{queue}'")))?;
                q.consumers.insert(id, self.id);
                id
            };
            trace!(link = self.id, consumer_tag, "memory consumer registered");

            let prefetch = usize::from(prefetch.max(1));
            let (tx, rx) = mpsc::channel(prefetch);
            tokio::spawn(dispatch(
                Arc::clone(&self.shared),
                self.id,
                consumer_id,
                queue.to_string(),
                self.handle.channel.clone(),
                Arc::new(Semaphore::new(prefetch)),
                tx,
            ));

            let deliveries = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|delivery| (delivery, rx))
            });
            let deliveries: DeliveryStream = Box::pin(deliveries);
            Ok(deliveries)
        })
    }

    fn inspect_queue<'a>(
        &'a self,
        queue: &'a str,
    ) -> BoxFuture<'a, Result<QueueInfo, TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.shared.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::new(format!("no queue '{queue}'")))?;
            q.expire(&self.shared.counters);
            Ok(q.info(queue))
        })
    }

    fn closed(&self) -> BoxFuture<'_, String> {
        Box::pin(async move {
            self.handle.token.cancelled().await;
            self.handle
                .reason
                .lock()
                .ok()
                .and_then(|reason| reason.clone())
                .unwrap_or_else(|| "link closed".into())
        })
    }

    fn is_open(&self) -> bool {
        self.handle.channel_open()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.shared.detach_link(self.id, "closed by application") {
                bump(&self.shared.counters.closes);
                trace!(link = self.id, "memory link closed");
            }
            Ok(())
        })
    }
}

/// Feeds one consumer, keeping at most `prefetch` deliveries unsettled.
async fn dispatch(
    shared: Arc<Shared>,
    link_id: u64,
    consumer_id: u64,
    queue: String,
    closed: CancellationToken,
    prefetch: Arc<Semaphore>,
    tx: mpsc::Sender<RawDelivery>,
) {
    'outer: loop {
        let permit = tokio::select! {
            _ = closed.cancelled() => break,
            _ = tx.closed() => break,
            permit = Arc::clone(&prefetch).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (tag, message) = loop {
            let notified = shared.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = shared.take_ready(&queue, link_id) {
                break next;
            }
            tokio::select! {
                _ = closed.cancelled() => break 'outer,
                _ = tx.closed() => break 'outer,
                _ = notified => {}
            }
        };

        let delivery = RawDelivery {
            payload: message.payload,
            redelivered: message.redelivered,
            acker: Box::new(MemoryAcker {
                shared: Arc::clone(&shared),
                queue: queue.clone(),
                tag,
                link_id,
                _permit: permit,
            }),
        };
        if tx.send(delivery).await.is_err() {
            break;
        }
    }

    if let Some(q) = shared.lock().queues.get_mut(&queue) {
        q.consumers.remove(&consumer_id);
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
    link_id: u64,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn settle(self, requeue: Option<bool>) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        if !self.shared.channel_open(&state, self.link_id) {
            return Err(TransportError::new("channel closed"));
        }
        let q = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| TransportError::new("queue deleted"))?;
        let Some((_, mut stored)) = q.unacked.remove(&self.tag) else {
            return Err(TransportError::new(format!("unknown delivery tag {}", self.tag)));
        };
        let counters = &self.shared.counters;
        match requeue {
            None => bump(&counters.acked),
            Some(requeue) => {
                bump(&counters.nacked);
                if requeue {
                    stored.message.redelivered = true;
                    stored.enqueued_at = Instant::now();
                    q.ready.push_front(stored);
                    bump(&counters.requeued);
                }
            }
        }
        drop(state);
        self.shared.wake.notify_waiters();
        Ok(())
    }
}

impl Acker for MemoryAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move { self.settle(None) })
    }

    fn nack(self: Box<Self>, requeue: bool) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move { self.settle(Some(requeue)) })
    }
}
