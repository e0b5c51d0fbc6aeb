//! Publishing with bounded, linearly spaced retries.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::BrokerError;
use crate::manager::ConnectionManager;
use crate::types::OutboundMessage;

/// Publishes onto the managed queue through the current link.
#[derive(Clone)]
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    attempts: u32,
    step: Duration,
    default_deadline: Duration,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let config = manager.config();
        let (attempts, step, default_deadline) = (
            config.publish_attempts.max(1),
            config.publish_step,
            config.publish_deadline,
        );
        Self {
            manager,
            attempts,
            step,
            default_deadline,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Publishes `message`, failing fast unless connected.
    ///
    /// Failed attempts are retried after `step`, `2 * step`, ... on a fresh
    /// lease. The whole call is bounded by `deadline` (the configured
    /// default when `None`) and aborts on shutdown.
    pub async fn publish(
        &self,
        message: &OutboundMessage,
        deadline: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let deadline = Instant::now() + deadline.unwrap_or(self.default_deadline);
        let shutdown = self.manager.shutdown_signal();
        let mut lease = self.manager.lease().await?;
        let mut last = String::new();

        for attempt in 0..self.attempts {
            if attempt > 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(BrokerError::ShutdownInProgress),
                    _ = tokio::time::sleep_until(deadline) => return Err(BrokerError::DeadlineElapsed),
                    _ = tokio::time::sleep(self.step * attempt) => {}
                }
                lease = match self.manager.lease().await {
                    Ok(lease) => lease,
                    Err(BrokerError::ShutdownInProgress) => {
                        return Err(BrokerError::ShutdownInProgress);
                    }
                    Err(e) => {
                        last = e.to_string();
                        continue;
                    }
                };
            }

            match tokio::time::timeout_at(deadline, lease.link.publish(&lease.queue, message)).await
            {
                Ok(Ok(())) => {
                    trace!(queue = %lease.queue, epoch = lease.epoch, bytes = message.payload.len(), "published");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        attempt = attempt + 1,
                        attempts = self.attempts,
                        error = %e,
                        "publish attempt failed"
                    );
                    last = e.to_string();
                }
                Err(_) => return Err(BrokerError::DeadlineElapsed),
            }
        }

        Err(BrokerError::PublishExhausted {
            attempts: self.attempts,
            last,
        })
    }

    /// Serializes `value` as JSON and publishes it persistently.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        deadline: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(&OutboundMessage::json(payload), deadline).await
    }
}
