//! Public types for the broker connector.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use stockpulse_protocol::constants::{
    CONSUMER_PREFETCH, CONTENT_TYPE_JSON, DEFAULT_PUBLISH_DEADLINE, DELIVERY_HANDOFF_TIMEOUT,
    QUEUE_MESSAGE_TTL_MS,
};

use crate::backoff::BackoffPolicy;

/// Lifecycle of the physical broker connection.
///
/// Only the [`ConnectionManager`](crate::ConnectionManager) moves between
/// states; everything else observes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// First connection cycle in progress.
    Connecting,
    /// Link up and queue declared.
    Connected,
    /// Link lost, retrying in the background.
    Reconnecting,
    /// Shut down explicitly; terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Declaration parameters for the durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub message_ttl_ms: Option<u32>,
}

/// Snapshot of the queue as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub pending_message_count: u32,
    pub consumer_count: u32,
}

/// A message handed to the [`Publisher`](crate::Publisher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
}

impl OutboundMessage {
    /// A persistent `application/json` message.
    pub fn json(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            content_type: CONTENT_TYPE_JSON.into(),
            persistent: true,
        }
    }
}

/// Result of a health probe against the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Health and queue statistics bundled for the external HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: ConnectionState,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueInfo>,
}

/// Tunables for the connection manager, publisher, and consumer pipeline.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Name of the durable queue.
    pub queue: String,
    /// Tag used when registering the consumer.
    pub consumer_tag: String,
    /// Attempts per connection cycle before the cycle reports exhaustion.
    pub connect_attempts: u32,
    /// Delay policy between connection attempts.
    pub backoff: BackoffPolicy,
    /// Pause between exhausted reconnection cycles.
    pub reconnect_pause: Duration,
    pub message_ttl_ms: Option<u32>,
    pub prefetch: u16,
    /// Bounded wait when handing a delivery to the ingestion loop.
    pub handoff_timeout: Duration,
    /// Capacity of the hand-off channel between pipeline and ingestion loop.
    pub handoff_buffer: usize,
    /// Poll interval while waiting for the manager to reconnect.
    pub reconnect_poll: Duration,
    /// Pause after a failed consumer registration.
    pub resubscribe_delay: Duration,
    pub publish_attempts: u32,
    /// Linear step between publish attempts (1x, 2x, ...).
    pub publish_step: Duration,
    /// Deadline applied when the caller gives none.
    pub publish_deadline: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue: "device_telemetry".into(),
            consumer_tag: default_consumer_tag(),
            connect_attempts: 30,
            backoff: BackoffPolicy::default(),
            reconnect_pause: Duration::from_secs(5),
            message_ttl_ms: Some(QUEUE_MESSAGE_TTL_MS),
            prefetch: CONSUMER_PREFETCH,
            handoff_timeout: DELIVERY_HANDOFF_TIMEOUT,
            handoff_buffer: 1,
            reconnect_poll: Duration::from_secs(1),
            resubscribe_delay: Duration::from_secs(5),
            publish_attempts: 3,
            publish_step: Duration::from_secs(1),
            publish_deadline: DEFAULT_PUBLISH_DEADLINE,
        }
    }
}

impl BrokerConfig {
    pub fn queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.queue.clone(),
            durable: true,
            message_ttl_ms: self.message_ttl_ms,
        }
    }
}

/// `consumer-<unix seconds>`, unique enough per process start.
pub fn default_consumer_tag() -> String {
    format!("consumer-{}", chrono::Utc::now().timestamp())
}
