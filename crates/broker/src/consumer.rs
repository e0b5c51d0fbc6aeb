//! Consumer pipeline: a reconnect-transparent stream of deliveries.
//!
//! One background task registers a consumer on the current link, hands
//! each delivery to the ingestion side through a bounded channel, and
//! settles it: ack once the hand-off succeeds, nack with requeue when the
//! hand-off times out. When the delivery stream ends the task waits for
//! the manager to reconnect and subscribes again on the new link. If the
//! manager still considers that link current, the pipeline reports it as
//! failed so the manager replaces it.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::delivery::{AckHandle, Delivery, InboundMessage};
use crate::error::BrokerError;
use crate::manager::ConnectionManager;
use crate::transport::DeliveryStream;

pub struct ConsumerPipeline {
    manager: Arc<ConnectionManager>,
}

impl ConsumerPipeline {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Starts consuming. The returned subscription only ends after the
    /// manager shuts down.
    pub fn subscribe(&self) -> Subscription {
        let buffer = self.manager.config().handoff_buffer.max(1);
        let (tx, rx) = mpsc::channel(buffer);
        let task = tokio::spawn(run(Arc::clone(&self.manager), tx));
        Subscription { rx, task }
    }
}

/// Output side of a [`ConsumerPipeline`].
///
/// Dropping it stops the background task; any delivery it was holding is
/// nacked with requeue.
pub struct Subscription {
    rx: mpsc::Receiver<InboundMessage>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    /// Stops the pipeline and waits for its task to finish.
    pub async fn close(self) {
        let Self { rx, task } = self;
        drop(rx);
        let _ = task.await;
    }
}

impl Stream for Subscription {
    type Item = InboundMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

enum Drained {
    /// The transport stream ended (link lost or consumer cancelled).
    StreamEnded,
    /// Shutdown or the subscription was dropped.
    Stop,
}

enum Handoff {
    Delivered,
    TimedOut,
    Stopped,
}

async fn run(manager: Arc<ConnectionManager>, tx: mpsc::Sender<InboundMessage>) {
    let config = manager.config().clone();
    let shutdown = manager.shutdown_signal();
    let epochs = manager.epoch_counter();

    loop {
        if tx.is_closed() {
            break;
        }
        let waited = tokio::select! {
            _ = tx.closed() => break,
            waited = manager.wait_until_connected(config.reconnect_poll) => waited,
        };
        if waited.is_err() {
            break;
        }
        let lease = match manager.lease().await {
            Ok(lease) => lease,
            Err(BrokerError::ShutdownInProgress) => break,
            Err(_) => continue,
        };

        let stream = match lease
            .link
            .consume(&lease.queue, &config.consumer_tag, config.prefetch)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    queue = %lease.queue,
                    error = %e,
                    retry_in = ?config.resubscribe_delay,
                    "consumer registration failed"
                );
                manager.report_link_failure(lease.epoch, format!("consume failed: {e}"));
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.resubscribe_delay) => continue,
                }
            }
        };
        info!(
            queue = %lease.queue,
            consumer_tag = %config.consumer_tag,
            epoch = lease.epoch,
            "consumer subscribed"
        );

        let drained = drain(
            stream,
            lease.epoch,
            &epochs,
            &tx,
            &shutdown,
            config.handoff_timeout,
        )
        .await;
        match drained {
            Drained::Stop => break,
            Drained::StreamEnded => {
                info!(epoch = lease.epoch, "delivery stream closed, resubscribing");
                // The manager may not have noticed the closure yet.
                if manager.is_current(lease.epoch) {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(config.reconnect_poll) => {}
                    }
                    // Still current: the channel died under a live connection.
                    manager.report_link_failure(lease.epoch, "delivery stream ended");
                }
            }
        }
    }
    debug!("consumer pipeline stopped");
}

async fn drain(
    mut stream: DeliveryStream,
    epoch: u64,
    epochs: &Arc<AtomicU64>,
    tx: &mpsc::Sender<InboundMessage>,
    shutdown: &CancellationToken,
    handoff_timeout: std::time::Duration,
) -> Drained {
    loop {
        let raw = tokio::select! {
            _ = shutdown.cancelled() => return Drained::Stop,
            _ = tx.closed() => return Drained::Stop,
            next = stream.next() => match next {
                Some(raw) => raw,
                None => return Drained::StreamEnded,
            },
        };
        let (message, handle) = Delivery::from_raw(raw, epoch, Arc::clone(epochs)).into_parts();

        let handoff = tokio::select! {
            _ = shutdown.cancelled() => Handoff::Stopped,
            sent = tx.send_timeout(message, handoff_timeout) => match sent {
                Ok(()) => Handoff::Delivered,
                Err(SendTimeoutError::Timeout(_)) => Handoff::TimedOut,
                Err(SendTimeoutError::Closed(_)) => Handoff::Stopped,
            },
        };

        match handoff {
            Handoff::Delivered => settle(handle, Settle::Ack).await,
            Handoff::TimedOut => {
                warn!(
                    epoch,
                    timeout = ?handoff_timeout,
                    "delivery hand-off timed out, requeueing"
                );
                settle(handle, Settle::Requeue).await;
            }
            Handoff::Stopped => {
                settle(handle, Settle::Requeue).await;
                return Drained::Stop;
            }
        }
    }
}

enum Settle {
    Ack,
    Requeue,
}

async fn settle(handle: AckHandle, how: Settle) {
    let epoch = handle.epoch();
    let result = match how {
        Settle::Ack => handle.ack().await,
        Settle::Requeue => handle.nack(true).await,
    };
    match result {
        Ok(()) => {}
        // The broker already requeued it when the old link went away.
        Err(BrokerError::StaleDelivery { .. }) => {
            debug!(epoch, "delivery from superseded link left to broker redelivery");
        }
        Err(e) => warn!(epoch, error = %e, "failed to settle delivery"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::memory::MemoryBroker;
    use crate::publisher::Publisher;
    use crate::types::{BrokerConfig, OutboundMessage};

    fn config(handoff: Duration) -> BrokerConfig {
        BrokerConfig {
            queue: "consume_queue".into(),
            handoff_timeout: handoff,
            reconnect_poll: Duration::from_millis(10),
            resubscribe_delay: Duration::from_millis(10),
            backoff: crate::BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
            ..BrokerConfig::default()
        }
    }

    async fn setup(handoff: Duration) -> (MemoryBroker, Arc<ConnectionManager>, Publisher) {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), config(handoff));
        manager.connect().await.unwrap();
        let publisher = Publisher::new(Arc::clone(&manager));
        (broker, manager, publisher)
    }

    async fn publish(publisher: &Publisher, body: &str) {
        publisher
            .publish(&OutboundMessage::json(body.as_bytes().to_vec()), None)
            .await
            .unwrap();
    }

    async fn next(sub: &mut Subscription) -> InboundMessage {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("no delivery in time")
            .expect("subscription ended")
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn deliveries_are_handed_off_in_order_and_acked() {
        let (broker, manager, publisher) = setup(Duration::from_secs(5)).await;
        for i in 0..3 {
            publish(&publisher, &format!("m{i}")).await;
        }

        let mut sub = ConsumerPipeline::new(Arc::clone(&manager)).subscribe();
        for i in 0..3 {
            let msg = next(&mut sub).await;
            assert_eq!(msg.payload, format!("m{i}").into_bytes());
            assert!(!msg.redelivered);
        }
        eventually(|| broker.stats().acked == 3).await;
        assert_eq!(broker.pending("consume_queue"), 0);

        manager.close().await.unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn handoff_timeout_nacks_with_requeue() {
        let (broker, manager, publisher) = setup(Duration::from_millis(30)).await;
        publish(&publisher, "first").await;
        publish(&publisher, "second").await;

        let mut sub = ConsumerPipeline::new(Arc::clone(&manager)).subscribe();
        // Nobody reads: "first" fills the hand-off buffer, "second" times out.
        eventually(|| broker.stats().requeued >= 1).await;

        assert_eq!(next(&mut sub).await.payload, b"first");
        let second = next(&mut sub).await;
        assert_eq!(second.payload, b"second");
        assert!(second.redelivered);

        eventually(|| broker.stats().acked == 2).await;
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn resubscribes_after_link_loss() {
        let (broker, manager, publisher) = setup(Duration::from_secs(5)).await;
        let mut sub = ConsumerPipeline::new(Arc::clone(&manager)).subscribe();

        publish(&publisher, "before").await;
        assert_eq!(next(&mut sub).await.payload, b"before");
        eventually(|| broker.stats().acked == 1).await;
        let first_epoch = manager.epoch();

        broker.sever();
        eventually(|| manager.epoch() > first_epoch && broker.consumers("consume_queue") == 1)
            .await;

        publish(&publisher, "after").await;
        let msg = next(&mut sub).await;
        assert_eq!(msg.payload, b"after");
        assert!(msg.epoch > first_epoch);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_channel_only_close() {
        let (broker, manager, publisher) = setup(Duration::from_secs(5)).await;
        let mut sub = ConsumerPipeline::new(Arc::clone(&manager)).subscribe();

        publish(&publisher, "before").await;
        assert_eq!(next(&mut sub).await.payload, b"before");
        eventually(|| broker.stats().acked == 1).await;
        let first_epoch = manager.epoch();

        // The connection stays up, so only the pipeline can notice.
        broker.close_channels();
        eventually(|| manager.epoch() > first_epoch && broker.consumers("consume_queue") == 1)
            .await;
        assert_eq!(manager.state(), crate::types::ConnectionState::Connected);

        publish(&publisher, "after").await;
        let msg = next(&mut sub).await;
        assert_eq!(msg.payload, b"after");
        assert!(msg.epoch > first_epoch);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_subscription_stops_pipeline() {
        let (broker, manager, _publisher) = setup(Duration::from_secs(5)).await;
        let sub = ConsumerPipeline::new(Arc::clone(&manager)).subscribe();
        eventually(|| broker.consumers("consume_queue") == 1).await;

        tokio::time::timeout(Duration::from_secs(5), sub.close())
            .await
            .expect("pipeline did not stop");
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn subscription_is_a_stream() {
        let (_broker, manager, publisher) = setup(Duration::from_secs(5)).await;
        publish(&publisher, "a").await;
        publish(&publisher, "b").await;

        let sub = ConsumerPipeline::new(Arc::clone(&manager)).subscribe();
        let got: Vec<_> = tokio::time::timeout(Duration::from_secs(5), sub.take(2).collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(got[0].payload, b"a");
        assert_eq!(got[1].payload, b"b");
        manager.close().await.unwrap();
    }
}
