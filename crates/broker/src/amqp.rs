//! AMQP 0-9-1 transport backed by `lapin`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::transport::{
    Acker, BoxFuture, DeliveryStream, Link, RawDelivery, Transport, TransportError,
};
use crate::types::{OutboundMessage, QueueInfo, QueueSpec};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;
/// How often `closed()` checks the channel; the broker can close it while
/// the connection stays up, and only connection errors are pushed.
const CHANNEL_CHECK_PERIOD: Duration = Duration::from_secs(1);

impl From<lapin::Error> for TransportError {
    fn from(e: lapin::Error) -> Self {
        TransportError::new(e.to_string())
    }
}

/// Opens one connection plus channel per [`Transport::connect`].
pub struct AmqpTransport {
    uri: String,
}

impl AmqpTransport {
    /// Accepts `amqp://` and `amqps://` URIs.
    pub fn new(uri: impl Into<String>) -> Result<Self, BrokerError> {
        let uri = uri.into();
        if uri.starts_with("amqp://") || uri.starts_with("amqps://") {
            Ok(Self { uri })
        } else {
            Err(BrokerError::InvalidUrl(redact(&uri)))
        }
    }
}

/// Hides the userinfo part of a URI.
fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &uri[..scheme_end], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}

impl Transport for AmqpTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Link>, TransportError>> {
        Box::pin(async move {
            let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;

            let (closed_tx, closed_rx) = watch::channel(None::<String>);
            connection.on_error(move |e| {
                closed_tx.send_replace(Some(e.to_string()));
            });

            let channel = connection.create_channel().await?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
            debug!(broker = %redact(&self.uri), "amqp channel opened");

            let link: Arc<dyn Link> = Arc::new(AmqpLink {
                connection,
                channel,
                closed: closed_rx,
            });
            Ok(link)
        })
    }

    fn describe(&self) -> String {
        redact(&self.uri)
    }
}

struct AmqpLink {
    connection: Connection,
    channel: Channel,
    closed: watch::Receiver<Option<String>>,
}

fn declare_args(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = spec.message_ttl_ms {
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt(i32::try_from(ttl).unwrap_or(i32::MAX)),
        );
    }
    args
}

impl Link for AmqpLink {
    fn declare_queue<'a>(
        &'a self,
        spec: &'a QueueSpec,
    ) -> BoxFuture<'a, Result<QueueInfo, TransportError>> {
        Box::pin(async move {
            let options = QueueDeclareOptions {
                durable: spec.durable,
                ..QueueDeclareOptions::default()
            };
            let queue = self
                .channel
                .queue_declare(&spec.name, options, declare_args(spec))
                .await?;
            Ok(QueueInfo {
                name: queue.name().as_str().to_string(),
                pending_message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            })
        })
    }

    fn publish<'a>(
        &'a self,
        queue: &'a str,
        message: &'a OutboundMessage,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut properties = BasicProperties::default()
                .with_content_type(message.content_type.clone().into())
                .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64);
            if message.persistent {
                properties = properties.with_delivery_mode(PERSISTENT);
            }
            let confirm = self
                .channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    &message.payload,
                    properties,
                )
                .await?
                .await?;
            if confirm.is_nack() {
                return Err(TransportError::new("publish nacked by broker"));
            }
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        consumer_tag: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<DeliveryStream, TransportError>> {
        Box::pin(async move {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            // A consumer error means the channel is gone; end the stream so the
            // pipeline resubscribes.
            let deliveries = consumer
                .take_while(|item| {
                    if let Err(e) = item {
                        warn!(error = %e, "amqp consumer error");
                    }
                    std::future::ready(item.is_ok())
                })
                .filter_map(|item| std::future::ready(item.ok()))
                .map(|delivery| RawDelivery {
                    payload: delivery.data,
                    redelivered: delivery.redelivered,
                    acker: Box::new(AmqpAcker(delivery.acker)),
                });
            let deliveries: DeliveryStream = Box::pin(deliveries);
            Ok(deliveries)
        })
    }

    fn inspect_queue<'a>(
        &'a self,
        queue: &'a str,
    ) -> BoxFuture<'a, Result<QueueInfo, TransportError>> {
        Box::pin(async move {
            let options = QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            };
            let info = self
                .channel
                .queue_declare(queue, options, FieldTable::default())
                .await?;
            Ok(QueueInfo {
                name: info.name().as_str().to_string(),
                pending_message_count: info.message_count(),
                consumer_count: info.consumer_count(),
            })
        })
    }

    fn closed(&self) -> BoxFuture<'_, String> {
        let mut rx = self.closed.clone();
        Box::pin(async move {
            let mut check = tokio::time::interval(CHANNEL_CHECK_PERIOD);
            loop {
                tokio::select! {
                    reason = rx.wait_for(Option::is_some) => {
                        return match reason {
                            Ok(reason) => reason.clone().unwrap_or_default(),
                            Err(_) => "connection dropped".into(),
                        };
                    }
                    _ = check.tick() => {
                        if !self.channel.status().connected() {
                            return "channel closed by broker".into();
                        }
                    }
                }
            }
        })
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.channel.status().connected() {
                self.channel.close(REPLY_SUCCESS, "closing").await?;
            }
            if self.connection.status().connected() {
                self.connection.close(REPLY_SUCCESS, "closing").await?;
            }
            Ok(())
        })
    }
}

struct AmqpAcker(lapin::acker::Acker);

impl Acker for AmqpAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            self.0
                .ack(BasicAckOptions::default())
                .await
                .map(|_| ())
                .map_err(TransportError::from)
        })
    }

    fn nack(self: Box<Self>, requeue: bool) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            let options = BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            };
            self.0
                .nack(options)
                .await
                .map(|_| ())
                .map_err(TransportError::from)
        })
    }
}
