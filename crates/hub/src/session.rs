//! Per-subscriber socket session: a write pump draining the mailbox and a
//! read pump that only watches for disconnection.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::{HubHandle, Mailbox, Payload, SubscriberId};

/// Handle to a running session.
pub struct SessionHandle {
    pub id: SubscriberId,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SessionHandle {
    /// Stops both pumps without waiting for the mailbox to drain.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

/// Runs the pumps for an upgraded subscriber socket.
///
/// Whichever pump stops first cancels the other; the subscriber is then
/// unregistered from the hub.
pub fn spawn_session<S>(ws: S, mailbox: Mailbox, hub: HubHandle, peer: String) -> SessionHandle
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Send + 'static,
{
    let id = mailbox.id();
    let cancel = CancellationToken::new();
    let (sink, stream) = ws.split();

    let writer = tokio::spawn(write_pump(sink, mailbox, hub.clone(), cancel.clone()));

    let read_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        read_pump(stream, read_cancel.clone()).await;
        read_cancel.cancel();
        let _ = hub.unregister(id);
        info!(subscriber = %id, %peer, "subscriber disconnected");
    });

    SessionHandle {
        id,
        cancel,
        reader,
        writer,
    }
}

fn frame(payload: &Payload) -> WsMessage {
    match std::str::from_utf8(payload) {
        Ok(text) => WsMessage::text(text.to_owned()),
        Err(_) => WsMessage::binary(payload.to_vec()),
    }
}

async fn write_pump<S>(mut sink: S, mut mailbox: Mailbox, hub: HubHandle, cancel: CancellationToken)
where
    S: Sink<WsMessage, Error = WsError> + Send + Unpin,
{
    let id = mailbox.id();
    let write_wait = hub.config().write_wait;
    let mut ping_interval = tokio::time::interval(hub.config().ping_period);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.reset();

    let mut send_close = true;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,

            payload = mailbox.recv() => match payload {
                Some(payload) => frame(&payload),
                // Unregistered, evicted, or hub shut down.
                None => break,
            },

            _ = ping_interval.tick() => WsMessage::Ping(Vec::new().into()),
        };

        match tokio::time::timeout(write_wait, sink.send(next)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(subscriber = %id, "write error: {e}");
                send_close = false;
                break;
            }
            Err(_) => {
                warn!(subscriber = %id, timeout = ?write_wait, "write deadline exceeded");
                send_close = false;
                break;
            }
        }
    }

    if send_close {
        let _ = tokio::time::timeout(write_wait, sink.send(WsMessage::Close(None))).await;
    }
    let _ = tokio::time::timeout(write_wait, sink.close()).await;
    cancel.cancel();
    let _ = hub.unregister(id);
}

/// Discards inbound frames; returns on close, error, or cancellation.
async fn read_pump<S>(mut stream: S, cancel: CancellationToken)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("read error: {e}");
                    break;
                }
            },
        }
    }
}
