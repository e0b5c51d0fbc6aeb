fn main() {
    println!("Run `cargo test -p end-to-end` to execute the end-to-end scenarios.");
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use futures_util::StreamExt;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use tokio_util::sync::CancellationToken;

    use stockpulse_broker::{
        BackoffPolicy, BrokerConfig, ConnectionManager, ConnectionState, ConsumerPipeline,
        MemoryBroker, OutboundMessage, Publisher,
    };
    use stockpulse_hub::{Hub, HubConfig, HubHandle, ServerConfig, SubscriberServer};
    use stockpulse_ingest::{Device, IngestionLoop, InventoryProcessor, TelemetryIngress};
    use stockpulse_protocol::{InventoryUpdate, TelemetryMessage};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const QUEUE: &str = "e2e_telemetry";

    // -- Fixtures --

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Integer-valued numbers (`45`) and floats (`45.0`) compare equal.
    fn normalize(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => n.as_f64().map_or_else(|| v.clone(), |f| serde_json::json!(f)),
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), normalize(v))).collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize).collect())
            }
            _ => v.clone(),
        }
    }

    fn assert_wire_shape<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert_eq!(
            normalize(&fixture),
            normalize(&reserialized),
            "wire shape mismatch for {name}"
        );
    }

    // -- Harness --

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            queue: QUEUE.into(),
            backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
            reconnect_pause: Duration::from_millis(20),
            reconnect_poll: Duration::from_millis(10),
            resubscribe_delay: Duration::from_millis(10),
            ..BrokerConfig::default()
        }
    }

    fn dev001() -> Device {
        Device {
            device_id: "DEV001".into(),
            client_id: uuid::Uuid::parse_str("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11").unwrap(),
            location: "New York".into(),
            item_weight: 1.0,
            max_capacity: 100.0,
        }
    }

    fn reading(weight: f64) -> TelemetryMessage {
        TelemetryMessage {
            device_id: "DEV001".into(),
            weight,
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    /// Broker, ingestion loop, hub and subscriber listener wired like the
    /// server binary, on an in-process broker and an OS-assigned port.
    struct Stack {
        broker: MemoryBroker,
        manager: Arc<ConnectionManager>,
        ingress: TelemetryIngress,
        hub: HubHandle,
        server: Arc<SubscriberServer>,
        cancel: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    }

    impl Stack {
        async fn start(hub_config: HubConfig) -> Self {
            let broker = MemoryBroker::new();
            let manager = ConnectionManager::new(Arc::new(broker.clone()), broker_config());
            manager.connect().await.unwrap();

            let processor = Arc::new(InventoryProcessor::default());
            processor.register_device(dev001());

            let cancel = CancellationToken::new();
            let (hub, hub_task) = Hub::spawn(hub_config, cancel.clone());

            let subscription = ConsumerPipeline::new(Arc::clone(&manager)).subscribe();
            let ingestion = IngestionLoop::new(subscription, processor, hub.clone(), cancel.clone());
            let ingestion_task = tokio::spawn(ingestion.run());

            let server = SubscriberServer::new(
                ServerConfig {
                    bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    port: 0,
                },
                hub.clone(),
            );
            let server_run = Arc::clone(&server);
            let server_task = tokio::spawn(async move {
                server_run.run().await.unwrap();
            });
            for _ in 0..100 {
                if server.port().await != 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            let ingress = TelemetryIngress::new(Publisher::new(Arc::clone(&manager)));
            Self {
                broker,
                manager,
                ingress,
                hub,
                server,
                cancel,
                tasks: vec![hub_task, ingestion_task, server_task],
            }
        }

        async fn connect_clients(&self, n: usize) -> Vec<Client> {
            let url = format!("ws://127.0.0.1:{}/ws", self.server.port().await);
            let mut clients = Vec::with_capacity(n);
            for _ in 0..n {
                let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
                clients.push(ws);
            }
            self.wait_for_clients(n).await;
            clients
        }

        async fn wait_for_clients(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.hub.client_count().await.unwrap() != n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("subscribers did not register");
        }

        async fn stop(self) {
            self.cancel.cancel();
            self.manager.close().await.unwrap();
            self.server.shutdown();
            for task in self.tasks {
                task.await.unwrap();
            }
        }
    }

    async fn next_text(ws: &mut Client, wait: Duration) -> String {
        loop {
            let msg = tokio::time::timeout(wait, ws.next())
                .await
                .expect("no frame in time")
                .expect("socket closed")
                .expect("socket error");
            match msg {
                WsMessage::Text(text) => return text.as_str().to_owned(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    // -- Wire shapes --

    #[test]
    fn telemetry_message_wire_shape() {
        assert_wire_shape::<TelemetryMessage>("telemetry_message.json");
    }

    #[test]
    fn inventory_update_wire_shape() {
        assert_wire_shape::<InventoryUpdate>("inventory_update.json");
    }

    // -- Scenarios --

    #[tokio::test]
    async fn reading_reaches_websocket_subscribers_as_update() {
        let stack = Stack::start(HubConfig::default()).await;
        let mut clients = stack.connect_clients(1).await;

        stack.ingress.forward_reading(&reading(50.0)).await.unwrap();
        stack.ingress.forward_reading(&reading(45.0)).await.unwrap();

        let first = next_text(&mut clients[0], Duration::from_secs(5)).await;
        let second = next_text(&mut clients[0], Duration::from_secs(5)).await;

        let first: InventoryUpdate = serde_json::from_str(&first).unwrap();
        assert_eq!(first.prev_weight, 0.0);
        assert_eq!(first.item_count, 50);

        let expected: InventoryUpdate =
            serde_json::from_value(load_fixture("inventory_update.json")).unwrap();
        assert_eq!(second.as_bytes(), expected.to_frame().unwrap().as_slice());
        let update: InventoryUpdate = serde_json::from_str(&second).unwrap();
        assert_eq!(update.item_count, 45);
        assert_eq!(update.weight_delta, 5.0);

        stack.stop().await;
    }

    #[tokio::test]
    async fn subscribers_receive_identical_frames_in_order() {
        let stack = Stack::start(HubConfig::default()).await;
        let mut clients = stack.connect_clients(3).await;

        let weights = [90.0, 84.0, 80.0, 79.0, 75.0];
        for w in weights {
            stack.ingress.forward_reading(&reading(w)).await.unwrap();
        }

        let mut streams = Vec::new();
        for ws in &mut clients {
            let mut frames = Vec::new();
            for _ in 0..weights.len() {
                frames.push(next_text(ws, Duration::from_secs(5)).await);
            }
            streams.push(frames);
        }

        assert_eq!(streams[0], streams[1]);
        assert_eq!(streams[1], streams[2]);
        let received: Vec<f64> = streams[0]
            .iter()
            .map(|f| serde_json::from_str::<InventoryUpdate>(f).unwrap().weight)
            .collect();
        assert_eq!(received, weights);

        stack.stop().await;
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_while_others_keep_up() {
        let config = HubConfig {
            mailbox_capacity: 4,
            ..HubConfig::default()
        };
        let stack = Stack::start(config).await;
        let mut fast = stack.connect_clients(2).await;
        // Registered directly and never drained.
        let slow = stack.hub.register().unwrap();
        stack.wait_for_clients(3).await;

        for i in 0..10u32 {
            let frame = format!("{{\"seq\":{i}}}");
            let sent = Instant::now();
            stack.hub.broadcast(frame.clone().into_bytes()).unwrap();
            for ws in &mut fast {
                assert_eq!(next_text(ws, Duration::from_secs(1)).await, frame);
                assert!(
                    sent.elapsed() < Duration::from_millis(50),
                    "fast subscriber delayed by {:?}",
                    sent.elapsed()
                );
            }
        }

        assert!(!slow.is_alive());
        assert_eq!(stack.hub.client_count().await.unwrap(), 2);

        stack.stop().await;
    }

    #[tokio::test]
    async fn every_publish_lands_as_one_persistent_message() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), broker_config());
        manager.connect().await.unwrap();
        let publisher = Publisher::new(Arc::clone(&manager));

        for i in 0..25 {
            let body = serde_json::to_vec(&reading(f64::from(i))).unwrap();
            publisher
                .publish(&OutboundMessage::json(body), None)
                .await
                .unwrap();
        }

        let queued = broker.peek(QUEUE);
        assert_eq!(queued.len(), 25);
        assert!(queued.iter().all(|m| m.persistent && m.content_type == "application/json"));
        assert_eq!(broker.stats().published, 25);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn sever_mid_stream_settles_every_delivery_once() {
        const TOTAL: usize = 20;

        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), broker_config());
        manager.connect().await.unwrap();
        let publisher = Publisher::new(Arc::clone(&manager));
        for i in 0..TOTAL {
            publisher
                .publish(&OutboundMessage::json(format!("{{\"n\":{i}}}").into_bytes()), None)
                .await
                .unwrap();
        }

        let mut subscription = ConsumerPipeline::new(Arc::clone(&manager)).subscribe();
        let mut seen = HashSet::new();
        let mut received = 0;
        let epoch_before = manager.epoch();

        tokio::time::timeout(Duration::from_secs(10), async {
            while seen.len() < TOTAL {
                let message = subscription.recv().await.expect("subscription ended");
                received += 1;
                seen.insert(message.payload.clone());
                if received == 5 {
                    broker.sever();
                }
            }
        })
        .await
        .expect("not every message was delivered");

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.stats().acked < TOTAL as u64 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("not every message was acknowledged");

        let stats = broker.stats();
        assert_eq!(stats.acked, TOTAL as u64);
        assert_eq!(stats.severs, 1);
        assert!(received >= TOTAL);
        assert_eq!(broker.pending(QUEUE), 0);
        assert_eq!(broker.unacked(QUEUE), 0);
        assert!(manager.epoch() > epoch_before);
        assert_eq!(manager.state(), ConnectionState::Connected);

        subscription.close().await;
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_close_tears_down_once() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), broker_config());
        manager.connect().await.unwrap();

        let closers: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.close().await })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap().unwrap();
        }

        assert_eq!(broker.stats().closes, 1);
        assert_eq!(broker.live_links(), 0);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.lease().await.is_err());
    }
}
