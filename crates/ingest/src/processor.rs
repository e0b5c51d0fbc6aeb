//! Processing capability invoked by the ingestion loop.

use std::future::Future;
use std::pin::Pin;

use stockpulse_protocol::{InventoryUpdate, TelemetryMessage};

use crate::IngestError;

/// A boxed future returned by [`Processor::process`].
pub type ProcessFuture<'a> =
    Pin<Box<dyn Future<Output = Result<InventoryUpdate, IngestError>> + Send + 'a>>;

/// Turns a decoded reading into the update broadcast to subscribers.
///
/// The loop bounds each call with its processing timeout, so an
/// implementation may await external storage.
pub trait Processor: Send + Sync + 'static {
    fn process(&self, reading: TelemetryMessage) -> ProcessFuture<'_>;
}
