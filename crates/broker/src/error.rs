//! Broker connector error types.

use crate::transport::TransportError;
use crate::types::ConnectionState;

/// Errors produced by the connection manager, publisher, and delivery handles.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(#[from] TransportError),

    #[error("failed to connect after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("failed to publish after {attempts} attempts: {last}")]
    PublishExhausted { attempts: u32, last: String },

    #[error("publish deadline elapsed")]
    DeadlineElapsed,

    #[error("delivery belongs to superseded connection epoch {epoch}")]
    StaleDelivery { epoch: u64 },

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether retrying later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected(_) | Self::ConnectionUnavailable(_) | Self::Exhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_state() {
        let err = BrokerError::NotConnected(ConnectionState::Reconnecting);
        assert_eq!(err.to_string(), "broker not connected (state: reconnecting)");
    }

    #[test]
    fn transient_classification() {
        assert!(BrokerError::NotConnected(ConnectionState::Connecting).is_transient());
        assert!(!BrokerError::ShutdownInProgress.is_transient());
        assert!(!BrokerError::StaleDelivery { epoch: 1 }.is_transient());
    }
}
