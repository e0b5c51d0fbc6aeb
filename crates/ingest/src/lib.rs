//! Telemetry ingestion for StockPulse.
//!
//! Devices hand readings to [`TelemetryIngress`], which publishes them onto
//! the durable queue. The [`IngestionLoop`] drains the consumer pipeline,
//! runs every reading through a [`Processor`], and broadcasts the resulting
//! [`InventoryUpdate`](stockpulse_protocol::InventoryUpdate) to the hub.

mod history;
mod ingestion;
mod ingress;
mod inventory;
mod processor;

pub use history::History;
pub use ingestion::{IngestStats, IngestionLoop, StatsSnapshot};
pub use ingress::TelemetryIngress;
pub use inventory::{DEFAULT_HISTORY_LEN, Device, InventoryProcessor, Reading, default_devices};
pub use processor::{ProcessFuture, Processor};

use stockpulse_broker::BrokerError;
use stockpulse_protocol::ProtocolError;

/// Errors produced while ingesting telemetry.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("device not found: {0}")]
    UnknownDevice(String),

    #[error("invalid device {device_id}: {reason}")]
    InvalidDevice { device_id: String, reason: String },

    #[error("processing timed out")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
