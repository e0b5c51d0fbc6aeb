//! Hub control loop and handles.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stockpulse_protocol::constants::{
    MAILBOX_CAPACITY, WS_MAX_READ_SIZE, WS_PING_PERIOD, WS_WRITE_WAIT,
};

use crate::HubError;

/// An immutable broadcast frame, shared by every mailbox it lands in.
pub type Payload = Arc<[u8]>;

/// Hub and subscriber-session tunables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames a subscriber may have queued before it is evicted.
    pub mailbox_capacity: usize,
    /// Deadline for writing one frame to a subscriber socket.
    pub write_wait: Duration,
    pub ping_period: Duration,
    /// Inbound message/frame limit on subscriber sockets.
    pub max_read_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: MAILBOX_CAPACITY,
            write_wait: WS_WRITE_WAIT,
            ping_period: WS_PING_PERIOD,
            max_read_size: WS_MAX_READ_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a subscriber's mailbox.
///
/// `recv` yields queued frames in broadcast order and returns `None` once
/// the hub has dropped the subscriber (unregistered, evicted, or shut down)
/// and the queue is drained.
pub struct Mailbox {
    id: SubscriberId,
    rx: mpsc::Receiver<Payload>,
    alive: Arc<AtomicBool>,
}

impl Mailbox {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// `false` once the hub has let go of this subscriber.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct Subscriber {
    tx: mpsc::Sender<Payload>,
    alive: Arc<AtomicBool>,
}

impl Subscriber {
    fn retire(self) {
        self.alive.store(false, Ordering::Release);
    }
}

enum Command {
    Register(SubscriberId, Subscriber),
    Unregister(SubscriberId),
    Broadcast(Payload),
    ClientCount(oneshot::Sender<usize>),
}

/// Cloneable handle to the control loop. Every method is a non-blocking
/// hand-off; none waits on subscriber I/O.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    config: Arc<HubConfig>,
}

impl HubHandle {
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Creates a subscriber with a fresh mailbox and registers it.
    pub fn register(&self) -> Result<Mailbox, HubError> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let alive = Arc::new(AtomicBool::new(true));
        let subscriber = Subscriber {
            tx,
            alive: Arc::clone(&alive),
        };
        self.send(Command::Register(id, subscriber))?;
        Ok(Mailbox { id, rx, alive })
    }

    pub fn unregister(&self, id: SubscriberId) -> Result<(), HubError> {
        self.send(Command::Unregister(id))
    }

    /// Queues `payload` for every subscriber registered when the control
    /// loop handles it.
    pub fn broadcast(&self, payload: impl Into<Payload>) -> Result<(), HubError> {
        self.send(Command::Broadcast(payload.into()))
    }

    pub async fn client_count(&self) -> Result<usize, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ClientCount(tx))?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, cmd: Command) -> Result<(), HubError> {
        self.tx.send(cmd).map_err(|_| HubError::Stopped)
    }
}

/// The control loop. Owns the subscriber set exclusively.
pub struct Hub {
    rx: mpsc::UnboundedReceiver<Command>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    cancel: CancellationToken,
}

impl Hub {
    /// Spawns the control loop; it stops when `cancel` fires.
    pub fn spawn(config: HubConfig, cancel: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Hub {
            rx,
            subscribers: HashMap::new(),
            cancel,
        };
        let handle = HubHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
            config: Arc::new(config),
        };
        (handle, tokio::spawn(hub.run()))
    }

    async fn run(mut self) {
        debug!("hub control loop started");
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }

        // Refuse new commands, but deliver the ones already accepted.
        self.rx.close();
        while let Ok(cmd) = self.rx.try_recv() {
            self.handle(cmd);
        }

        // Dropping the senders lets every write pump drain what is queued
        // and then close.
        let count = self.subscribers.len();
        for (_, subscriber) in self.subscribers.drain() {
            subscriber.retire();
        }
        info!(subscribers = count, "hub stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register(id, subscriber) => {
                self.subscribers.insert(id, subscriber);
                debug!(subscriber = %id, total = self.subscribers.len(), "subscriber registered");
            }
            Command::Unregister(id) => {
                if let Some(subscriber) = self.subscribers.remove(&id) {
                    subscriber.retire();
                    debug!(subscriber = %id, total = self.subscribers.len(), "subscriber unregistered");
                }
            }
            Command::Broadcast(payload) => self.broadcast(payload),
            Command::ClientCount(reply) => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn broadcast(&mut self, payload: Payload) {
        let mut dropped = Vec::new();
        for (id, subscriber) in &self.subscribers {
            match subscriber.tx.try_send(Arc::clone(&payload)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "subscriber mailbox full, evicting");
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = %id, "subscriber mailbox closed, removing");
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            if let Some(subscriber) = self.subscribers.remove(&id) {
                subscriber.retire();
            }
        }
    }
}
