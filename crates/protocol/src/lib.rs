//! Wire types shared by the StockPulse pipeline.
//!
//! Devices publish [`TelemetryMessage`] JSON onto the durable queue; the
//! ingestion loop turns each one into an [`InventoryUpdate`] which is
//! broadcast verbatim to dashboard subscribers.

pub mod constants;
pub mod telemetry;

pub use telemetry::{InventoryUpdate, TelemetryMessage};

/// Errors produced while decoding wire payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid telemetry: {0}")]
    Invalid(String),
}
