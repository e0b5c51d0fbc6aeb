use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Weight reading reported by a shelf device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub device_id: String,
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryMessage {
    /// Decodes and validates a raw queue payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_slice(payload)?;
        if msg.device_id.is_empty() {
            return Err(ProtocolError::Invalid("empty device_id".into()));
        }
        if !msg.weight.is_finite() {
            return Err(ProtocolError::Invalid(format!(
                "non-finite weight for {}",
                msg.device_id
            )));
        }
        Ok(msg)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Processed inventory change pushed to every dashboard subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUpdate {
    pub device_id: String,
    pub client_id: String,
    pub weight: f64,
    pub item_count: i64,
    pub prev_weight: f64,
    pub weight_delta: f64,
    pub timestamp: DateTime<Utc>,
    pub location: String,
}

impl InventoryUpdate {
    /// Serializes the update into the text frame sent to subscribers.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}
