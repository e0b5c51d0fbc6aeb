//! Resilient connector to the durable telemetry queue.
//!
//! [`ConnectionManager`] owns the single physical broker link and keeps it
//! alive with bounded, jittered retries. [`Publisher`] and
//! [`ConsumerPipeline`] borrow the current link through short-lived leases
//! and never cache it across a reconnect.
//!
//! The broker client itself sits behind the [`Transport`] / [`Link`]
//! capability traits: [`MemoryBroker`] is an in-process implementation and
//! the `amqp` feature provides [`AmqpTransport`].

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod backoff;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod manager;
pub mod memory;
pub mod publisher;
pub mod transport;
pub mod types;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use backoff::BackoffPolicy;
pub use consumer::{ConsumerPipeline, Subscription};
pub use delivery::{AckHandle, Delivery, InboundMessage};
pub use error::BrokerError;
pub use manager::{ConnectionManager, LinkLease};
pub use memory::{MemoryBroker, MemoryStats, QueuedMessage};
pub use publisher::Publisher;
pub use transport::{Acker, BoxFuture, DeliveryStream, Link, RawDelivery, Transport, TransportError};
pub use types::{
    BrokerConfig, ConnectionState, Health, HealthReport, OutboundMessage, QueueInfo, QueueSpec,
};
