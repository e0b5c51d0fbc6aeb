//! The ingestion loop: deliveries in, inventory updates out to the hub.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stockpulse_broker::{InboundMessage, Subscription};
use stockpulse_hub::HubHandle;
use stockpulse_protocol::TelemetryMessage;
use stockpulse_protocol::constants::PROCESS_TIMEOUT;

use crate::IngestError;
use crate::processor::Processor;

/// Counters shared between the loop and whoever reports on it.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    processed: AtomicU64,
    decode_failed: AtomicU64,
    process_failed: AtomicU64,
    broadcast: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub decode_failed: u64,
    pub process_failed: u64,
    pub broadcast: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            processed: load(&self.processed),
            decode_failed: load(&self.decode_failed),
            process_failed: load(&self.process_failed),
            broadcast: load(&self.broadcast),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Consumes a [`Subscription`] until it ends or `cancel` fires.
///
/// A single bad message never stops the loop: decode failures, processing
/// errors, and timeouts are logged and counted, then skipped.
pub struct IngestionLoop<P: Processor> {
    subscription: Subscription,
    processor: Arc<P>,
    hub: HubHandle,
    process_timeout: Duration,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
}

impl<P: Processor> IngestionLoop<P> {
    pub fn new(
        subscription: Subscription,
        processor: Arc<P>,
        hub: HubHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            subscription,
            processor,
            hub,
            process_timeout: PROCESS_TIMEOUT,
            stats: Arc::new(IngestStats::default()),
            cancel,
        }
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub async fn run(mut self) {
        info!("ingestion loop started");
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = self.subscription.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            bump(&self.stats.received);
            if let Err(e) = self.handle(message).await {
                match e {
                    IngestError::Protocol(_) => bump(&self.stats.decode_failed),
                    _ => bump(&self.stats.process_failed),
                }
                warn!(error = %e, "skipping telemetry message");
            }
        }
        let stats = self.stats.snapshot();
        info!(processed = stats.processed, failed = stats.decode_failed + stats.process_failed, "ingestion loop stopped");
    }

    async fn handle(&self, message: InboundMessage) -> Result<(), IngestError> {
        let reading = TelemetryMessage::decode(&message.payload)?;
        debug!(device = %reading.device_id, weight = reading.weight, redelivered = message.redelivered, "telemetry received");

        let update = tokio::time::timeout(self.process_timeout, self.processor.process(reading))
            .await
            .map_err(|_| IngestError::Timeout)??;
        bump(&self.stats.processed);

        let frame = update.to_frame()?;
        match self.hub.broadcast(frame) {
            Ok(()) => bump(&self.stats.broadcast),
            Err(e) => warn!(device = %update.device_id, error = %e, "broadcast dropped"),
        }
        Ok(())
    }
}
