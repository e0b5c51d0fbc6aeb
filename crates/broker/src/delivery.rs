//! Inbound deliveries scoped to the connection epoch that produced them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::BrokerError;
use crate::transport::{Acker, RawDelivery};

/// Settles one delivery. Consumed by [`ack`](Self::ack) or
/// [`nack`](Self::nack), so a delivery is never settled twice.
pub struct AckHandle {
    acker: Box<dyn Acker>,
    epoch: u64,
    current_epoch: Arc<AtomicU64>,
}

impl AckHandle {
    pub(crate) fn new(acker: Box<dyn Acker>, epoch: u64, current_epoch: Arc<AtomicU64>) -> Self {
        Self {
            acker,
            epoch,
            current_epoch,
        }
    }

    /// Epoch of the connection this delivery arrived on.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the connection that produced this delivery is still current.
    pub fn is_current(&self) -> bool {
        self.current_epoch.load(Ordering::Acquire) == self.epoch
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.check_epoch()?;
        self.acker.ack().await?;
        Ok(())
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.check_epoch()?;
        self.acker.nack(requeue).await?;
        Ok(())
    }

    fn check_epoch(&self) -> Result<(), BrokerError> {
        if self.is_current() {
            Ok(())
        } else {
            debug!(epoch = self.epoch, "ignoring settlement of stale delivery");
            Err(BrokerError::StaleDelivery { epoch: self.epoch })
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// A delivery with its acknowledgment handle.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub handle: AckHandle,
}

impl Delivery {
    pub(crate) fn from_raw(raw: RawDelivery, epoch: u64, current_epoch: Arc<AtomicU64>) -> Self {
        Self {
            payload: raw.payload,
            redelivered: raw.redelivered,
            handle: AckHandle::new(raw.acker, epoch, current_epoch),
        }
    }

    /// Splits the application-visible message from its handle.
    pub fn into_parts(self) -> (InboundMessage, AckHandle) {
        let epoch = self.handle.epoch;
        (
            InboundMessage {
                payload: self.payload,
                redelivered: self.redelivered,
                epoch,
            },
            self.handle,
        )
    }
}

/// What the ingestion loop sees: the pipeline settles the delivery itself
/// once the hand-off succeeds or times out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub epoch: u64,
}
