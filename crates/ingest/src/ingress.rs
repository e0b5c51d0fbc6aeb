//! Hand-off point for device-source connectors.

use std::time::Duration;

use tracing::{trace, warn};

use stockpulse_broker::{OutboundMessage, Publisher};
use stockpulse_protocol::TelemetryMessage;

use crate::IngestError;

/// Validates device readings and publishes them onto the durable queue.
#[derive(Clone)]
pub struct TelemetryIngress {
    publisher: Publisher,
    deadline: Option<Duration>,
}

impl TelemetryIngress {
    /// Uses the publisher's default deadline.
    pub fn new(publisher: Publisher) -> Self {
        Self {
            publisher,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Forwards a raw payload. It must decode as a [`TelemetryMessage`];
    /// the original bytes are what gets published.
    pub async fn forward(&self, payload: &[u8]) -> Result<(), IngestError> {
        let reading = TelemetryMessage::decode(payload)?;
        self.publish(&reading.device_id, payload.to_vec()).await
    }

    pub async fn forward_reading(&self, reading: &TelemetryMessage) -> Result<(), IngestError> {
        let payload = reading.to_json()?;
        self.publish(&reading.device_id, payload).await
    }

    async fn publish(&self, device_id: &str, payload: Vec<u8>) -> Result<(), IngestError> {
        let message = OutboundMessage::json(payload);
        match self.publisher.publish(&message, self.deadline).await {
            Ok(()) => {
                trace!(device = %device_id, "telemetry forwarded");
                Ok(())
            }
            Err(e) => {
                let health = self.publisher.manager().health_check().await;
                warn!(device = %device_id, error = %e, ?health, "failed to forward telemetry");
                Err(e.into())
            }
        }
    }
}
