//! Constants shared across the broker, hub, and ingestion crates.

use std::time::Duration;

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Per-message TTL applied when declaring the durable queue (1 hour).
pub const QUEUE_MESSAGE_TTL_MS: u32 = 3_600_000;

/// Maximum unacknowledged deliveries per consumer.
pub const CONSUMER_PREFETCH: u16 = 1;

/// Bounded wait when handing a delivery to the ingestion loop before it is
/// nacked with requeue.
pub const DELIVERY_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on external processing of a single telemetry message.
pub const PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline applied to a publish when the caller supplies none.
pub const DEFAULT_PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

/// Write deadline for a single frame to a dashboard subscriber.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Interval between keepalive pings sent to dashboard subscribers.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(30);

/// Read-size limit on subscriber sockets (the read side is liveness-only).
pub const WS_MAX_READ_SIZE: usize = 512;

/// Default capacity of a subscriber mailbox.
pub const MAILBOX_CAPACITY: usize = 256;
