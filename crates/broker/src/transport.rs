//! Capability traits over the concrete broker client.
//!
//! The connection manager only ever talks to a [`Transport`] (to open
//! links) and a [`Link`] (one physical connection plus channel). Swapping
//! the implementation changes nothing in the retry or reconnect logic.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;

use crate::types::{OutboundMessage, QueueInfo, QueueSpec};

/// A boxed future returned by transport methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Deliveries for one consumer registration. Ends when the channel closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = RawDelivery> + Send>>;

/// Error reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Acknowledgment capability for a single delivery.
///
/// Both methods take `self` by box so a delivery is settled at most once.
pub trait Acker: Send + 'static {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>>;

    fn nack(self: Box<Self>, requeue: bool) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// A delivery as produced by the transport, before the pipeline scopes it
/// to a connection epoch.
pub struct RawDelivery {
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub acker: Box<dyn Acker>,
}

/// One physical connection with an open channel.
pub trait Link: Send + Sync + 'static {
    /// Declares the queue if absent and returns its current statistics.
    fn declare_queue<'a>(
        &'a self,
        spec: &'a QueueSpec,
    ) -> BoxFuture<'a, Result<QueueInfo, TransportError>>;

    /// Publishes to the default exchange, routed by queue name.
    fn publish<'a>(
        &'a self,
        queue: &'a str,
        message: &'a OutboundMessage,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Registers a manual-ack consumer limited to `prefetch` unacked deliveries.
    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<DeliveryStream, TransportError>>;

    fn inspect_queue<'a>(&'a self, queue: &'a str)
    -> BoxFuture<'a, Result<QueueInfo, TransportError>>;

    /// Resolves with a reason once the link has closed.
    fn closed(&self) -> BoxFuture<'_, String>;

    fn is_open(&self) -> bool;

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Opens links to the broker.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Link>, TransportError>>;

    /// Human-readable target for logs (credentials stripped).
    fn describe(&self) -> String;
}
