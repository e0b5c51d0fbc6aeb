//! Connection manager: owns the single physical broker link.
//!
//! The current link, queue snapshot, and logical state live behind one
//! `RwLock`. Readers (publisher, consumer pipeline, health probes) take
//! short read locks to obtain a [`LinkLease`]; the manager takes the write
//! lock only while swapping links or shutting down.
//!
//! Every successful establishment bumps the connection epoch. Leases and
//! delivery handles remember the epoch they were issued under, so work
//! started on a superseded link can be told apart from the current one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::transport::{Link, Transport};
use crate::types::{BrokerConfig, ConnectionState, Health, HealthReport, QueueInfo};

/// Short-lived borrow of the current link.
///
/// Never hold a lease across a sleep: re-lease after waiting so a reconnect
/// in between is picked up.
#[derive(Clone)]
pub struct LinkLease {
    pub link: Arc<dyn Link>,
    pub epoch: u64,
    pub queue: String,
}

struct Inner {
    link: Option<Arc<dyn Link>>,
    queue: Option<QueueInfo>,
    state: ConnectionState,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    inner: RwLock<Inner>,
    epoch: Arc<AtomicU64>,
    state_tx: watch::Sender<ConnectionState>,
    /// Latest `(epoch, reason)` reported through `report_link_failure`.
    link_failure: watch::Sender<Option<(u64, String)>>,
    shutdown: CancellationToken,
    closing: AtomicBool,
    /// Serializes connection cycles (caller-driven and monitor-driven).
    connect_lock: Mutex<()>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: BrokerConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (link_failure, _) = watch::channel(None);
        Arc::new(Self {
            transport,
            config,
            inner: RwLock::new(Inner {
                link: None,
                queue: None,
                state: ConnectionState::Disconnected,
            }),
            epoch: Arc::new(AtomicU64::new(0)),
            state_tx,
            link_failure,
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
            monitor: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Current logical state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current connection epoch (0 before the first successful connect).
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub(crate) fn epoch_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.epoch)
    }

    /// Token cancelled when [`close`](Self::close) runs.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Runs one bounded connection cycle and starts the closure monitor.
    ///
    /// Returns [`BrokerError::Exhausted`] once `connect_attempts` attempts
    /// have failed. Calling it while already connected is a no-op. Once the
    /// monitor owns reconnection, this waits for it to reach `Connected`
    /// instead of running a cycle of its own.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BrokerError> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShutdownInProgress);
        }
        if self.monitor_running() {
            return self.wait_for_monitor().await;
        }
        let guard = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(BrokerError::ShutdownInProgress),
            guard = self.connect_lock.lock() => guard,
        };
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        if self.monitor_running() {
            drop(guard);
            return self.wait_for_monitor().await;
        }

        let result = self.connect_with_retry(ConnectionState::Connecting).await;
        match result {
            Ok(()) => {
                self.ensure_monitor();
                Ok(())
            }
            Err(e) => {
                let _ = self.transition(ConnectionState::Disconnected).await;
                Err(e)
            }
        }
    }

    /// Retries [`connect`](Self::connect) every `interval` until it succeeds
    /// or the manager shuts down.
    pub fn connect_in_background(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match this.connect().await {
                    Ok(()) => {
                        info!("background broker connection established");
                        return;
                    }
                    Err(BrokerError::ShutdownInProgress) => return,
                    Err(e) => warn!(error = %e, retry_in = ?interval, "background broker connect failed"),
                }
            }
        })
    }

    /// Marks the link issued under `epoch` as unusable so the monitor
    /// replaces it. Covers failures the transport does not report as a
    /// closure, such as a channel closed under a live connection. Reports
    /// for a superseded epoch are ignored.
    pub fn report_link_failure(&self, epoch: u64, reason: impl Into<String>) {
        if !self.is_current(epoch) || self.is_shutting_down() {
            return;
        }
        let reason = reason.into();
        warn!(epoch, %reason, "broker link reported unusable");
        self.link_failure.send_replace(Some((epoch, reason)));
    }

    /// Borrows the current link, failing fast unless `Connected`.
    pub async fn lease(&self) -> Result<LinkLease, BrokerError> {
        let inner = self.inner.read().await;
        match (&inner.link, inner.state) {
            (Some(link), ConnectionState::Connected) => Ok(LinkLease {
                link: Arc::clone(link),
                epoch: self.epoch(),
                queue: self.config.queue.clone(),
            }),
            (_, ConnectionState::Closed) => Err(BrokerError::ShutdownInProgress),
            (_, state) => Err(BrokerError::NotConnected(state)),
        }
    }

    /// Polls every `poll` until the manager reports `Connected`.
    pub async fn wait_until_connected(&self, poll: Duration) -> Result<(), BrokerError> {
        loop {
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(BrokerError::ShutdownInProgress),
                _ => {}
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(BrokerError::ShutdownInProgress),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    pub async fn health_check(&self) -> Health {
        let inner = self.inner.read().await;
        match (inner.state, &inner.link) {
            (ConnectionState::Connected, Some(link)) if link.is_open() => Health::Healthy,
            (ConnectionState::Reconnecting, _) => {
                Health::Unhealthy("connection is reconnecting".into())
            }
            (ConnectionState::Connecting, _) => Health::Unhealthy("connection is connecting".into()),
            _ => Health::Unhealthy("connection is closed".into()),
        }
    }

    /// Inspects the live queue on the broker.
    pub async fn queue_info(&self) -> Result<QueueInfo, BrokerError> {
        let lease = self.lease().await?;
        Ok(lease.link.inspect_queue(&lease.queue).await?)
    }

    /// Queue snapshot taken at the last successful declaration.
    pub async fn declared_queue(&self) -> Option<QueueInfo> {
        self.inner.read().await.queue.clone()
    }

    pub async fn health_report(&self) -> HealthReport {
        let health = self.health_check().await;
        let queue = if health.is_healthy() {
            self.queue_info().await.ok()
        } else {
            None
        };
        HealthReport {
            state: self.state(),
            health,
            queue,
        }
    }

    /// Tears everything down. Only the first call does work; later and
    /// concurrent calls return immediately.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();

        let link = {
            let mut inner = self.inner.write().await;
            inner.state = ConnectionState::Closed;
            inner.queue = None;
            self.state_tx.send_replace(ConnectionState::Closed);
            inner.link.take()
        };
        info!(state = %ConnectionState::Closed, "broker connection state changed");

        if let Ok(mut slot) = self.monitor.lock() {
            slot.take();
        }

        if let Some(link) = link {
            link.close().await?;
        }
        info!(broker = %self.transport.describe(), "broker connection closed");
        Ok(())
    }

    async fn transition(&self, next: ConnectionState) -> Result<(), BrokerError> {
        let mut inner = self.inner.write().await;
        if inner.state == ConnectionState::Closed {
            return Err(BrokerError::ShutdownInProgress);
        }
        if inner.state != next {
            inner.state = next;
            self.state_tx.send_replace(next);
            info!(state = %next, "broker connection state changed");
        }
        Ok(())
    }

    async fn connect_with_retry(&self, phase: ConnectionState) -> Result<(), BrokerError> {
        self.transition(phase).await?;

        let attempts = self.config.connect_attempts.max(1);
        let mut last = String::new();
        for attempt in 0..attempts {
            if self.is_shutting_down() {
                return Err(BrokerError::ShutdownInProgress);
            }
            match self.establish().await {
                Ok(epoch) => {
                    info!(
                        broker = %self.transport.describe(),
                        queue = %self.config.queue,
                        epoch,
                        attempt = attempt + 1,
                        "connected to broker"
                    );
                    return Ok(());
                }
                Err(BrokerError::ShutdownInProgress) => return Err(BrokerError::ShutdownInProgress),
                Err(e) => {
                    last = e.to_string();
                    if attempt + 1 == attempts {
                        break;
                    }
                    let delay = self.config.backoff.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "broker connection attempt failed"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(BrokerError::ShutdownInProgress),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        Err(BrokerError::Exhausted { attempts, last })
    }

    /// One attempt: open a link, declare the queue, publish it as current.
    async fn establish(&self) -> Result<u64, BrokerError> {
        let stale = {
            let mut inner = self.inner.write().await;
            inner.queue = None;
            inner.link.take()
        };
        if let Some(stale) = stale
            && let Err(e) = stale.close().await
        {
            debug!(error = %e, "closing superseded link failed");
        }

        let link = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(BrokerError::ShutdownInProgress),
            link = self.transport.connect() => link?,
        };

        let spec = self.config.queue_spec();
        let queue = match link.declare_queue(&spec).await {
            Ok(queue) => queue,
            Err(e) => {
                let _ = link.close().await;
                return Err(e.into());
            }
        };

        let mut inner = self.inner.write().await;
        if inner.state == ConnectionState::Closed || self.is_shutting_down() {
            drop(inner);
            let _ = link.close().await;
            return Err(BrokerError::ShutdownInProgress);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        inner.link = Some(link);
        inner.queue = Some(queue);
        inner.state = ConnectionState::Connected;
        self.state_tx.send_replace(ConnectionState::Connected);
        Ok(epoch)
    }

    fn monitor_running(&self) -> bool {
        self.monitor
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    async fn wait_for_monitor(&self) -> Result<(), BrokerError> {
        let mut rx = self.state_tx.subscribe();
        let reached = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(BrokerError::ShutdownInProgress),
            reached = rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed)) => {
                reached.map(|state| *state)
            }
        };
        match reached {
            Ok(ConnectionState::Connected) => Ok(()),
            _ => Err(BrokerError::ShutdownInProgress),
        }
    }

    fn ensure_monitor(self: &Arc<Self>) {
        let Ok(mut slot) = self.monitor.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { this.monitor_loop().await }));
    }

    /// Watches the current link and reconnects after unsolicited closure
    /// or a reported failure.
    async fn monitor_loop(self: Arc<Self>) {
        loop {
            let (current, epoch) = {
                let inner = self.inner.read().await;
                (inner.link.clone(), self.epoch())
            };
            if let Some(link) = current {
                let mut failures = self.link_failure.subscribe();
                let reason = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    reason = link.closed() => reason,
                    reported = failures.wait_for(|f| f.as_ref().is_some_and(|(e, _)| *e == epoch)) => {
                        match reported {
                            Ok(failure) => failure.as_ref().map(|(_, r)| r.clone()).unwrap_or_default(),
                            Err(_) => return,
                        }
                    }
                };
                if self.is_shutting_down() {
                    return;
                }
                let stale = {
                    let mut inner = self.inner.write().await;
                    if inner.state == ConnectionState::Closed {
                        return;
                    }
                    let stale = if inner.link.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, &link)) {
                        inner.queue = None;
                        inner.link.take()
                    } else {
                        None
                    };
                    inner.state = ConnectionState::Reconnecting;
                    self.state_tx.send_replace(ConnectionState::Reconnecting);
                    stale
                };
                warn!(%reason, epoch, "broker connection lost");
                // A reported failure can leave the connection itself open.
                if let Some(stale) = stale
                    && let Err(e) = stale.close().await
                {
                    debug!(error = %e, "closing failed link failed");
                }
            }

            if !self.reconnect().await {
                debug!("connection monitor stopped");
                return;
            }
        }
    }

    /// Runs bounded cycles until one succeeds. Returns `false` on shutdown.
    async fn reconnect(&self) -> bool {
        loop {
            {
                let _guard = tokio::select! {
                    _ = self.shutdown.cancelled() => return false,
                    guard = self.connect_lock.lock() => guard,
                };
                match self.connect_with_retry(ConnectionState::Reconnecting).await {
                    Ok(()) => return true,
                    Err(BrokerError::ShutdownInProgress) => return false,
                    Err(e) => error!(
                        error = %e,
                        pause_secs = self.config.reconnect_pause.as_secs_f64(),
                        "reconnection cycle exhausted, pausing"
                    ),
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.config.reconnect_pause) => {}
            }
        }
    }
}
