//! Application orchestrator: wires the broker connector, ingestion loop,
//! broadcast hub and subscriber listener together.

use std::sync::Arc;
use std::time::Duration;

use stockpulse_broker::{ConnectionManager, ConsumerPipeline, Publisher};
use stockpulse_hub::{Hub, SubscriberServer};
use stockpulse_ingest::{IngestionLoop, InventoryProcessor, TelemetryIngress, default_devices};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::simulator;

/// How long tasks get to finish after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs the server until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Broker --
    let transport = config.broker.transport()?;
    tracing::info!(broker = %transport.describe(), queue = %config.broker.queue, "using broker");
    let manager = ConnectionManager::new(transport, config.broker.broker_config());

    let background_connect = match manager.connect().await {
        Ok(()) => None,
        Err(e) => {
            tracing::warn!(
                error = %e,
                retry_secs = config.broker.background_retry_secs,
                "broker unavailable at startup, retrying in background"
            );
            Some(manager.connect_in_background(config.broker.background_retry()))
        }
    };

    // -- Inventory --
    let processor = Arc::new(InventoryProcessor::new(config.ingest.history_len));
    let fleet = if config.ingest.seed_devices {
        let fleet = default_devices();
        processor.seed(fleet.iter().cloned());
        fleet
    } else {
        Vec::new()
    };
    tracing::info!(devices = processor.device_count(), "inventory ready");

    // -- Hub --
    let (hub, hub_task) = Hub::spawn(config.hub.hub_config(), cancel.clone());

    // -- Ingestion --
    let subscription = ConsumerPipeline::new(Arc::clone(&manager)).subscribe();
    let ingestion = IngestionLoop::new(
        subscription,
        Arc::clone(&processor),
        hub.clone(),
        cancel.clone(),
    )
    .with_process_timeout(config.ingest.process_timeout());
    let stats = ingestion.stats();
    let ingestion_task = tokio::spawn(ingestion.run());

    // -- Subscriber listener --
    let server = SubscriberServer::new(config.hub.server_config(), hub.clone());
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    let port = tokio::select! {
        port = wait_for_port(&server) => port,
        result = &mut server_task => {
            cancel.cancel();
            let _ = manager.close().await;
            return Err(match result {
                Ok(Err(e)) => e.into(),
                Ok(Ok(())) => anyhow::anyhow!("subscriber listener stopped before binding"),
                Err(e) => e.into(),
            });
        }
    };
    tracing::info!(port, "subscriber WebSocket server listening");

    // -- Simulation --
    let simulators = if config.simulation.enabled {
        if fleet.is_empty() {
            tracing::warn!("simulation enabled but no devices are seeded, skipping");
            Vec::new()
        } else {
            let ingress = TelemetryIngress::new(Publisher::new(Arc::clone(&manager)));
            simulator::spawn(&config.simulation, &fleet, ingress, cancel.clone())
        }
    } else {
        Vec::new()
    };

    tracing::info!("server ready");

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("shutdown signal received");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("failed to listen for Ctrl-C: {e}");
            }
            tracing::info!("SIGINT received, shutting down");
        }
    }

    // -- Graceful shutdown --
    tracing::info!("stopping services...");
    cancel.cancel();
    if let Some(task) = background_connect {
        task.abort();
    }
    if let Err(e) = manager.close().await {
        tracing::warn!(error = %e, "broker close reported an error");
    }
    server.shutdown();

    let drain = async {
        for task in simulators {
            let _ = task.await;
        }
        let _ = ingestion_task.await;
        let _ = hub_task.await;
        match server_task.await {
            Ok(Err(e)) => tracing::error!("server error: {e}"),
            Err(e) => tracing::error!("server task failed: {e}"),
            Ok(Ok(())) => {}
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "tasks still running after grace period"
        );
    }

    let stats = stats.snapshot();
    tracing::info!(
        processed = stats.processed,
        broadcast = stats.broadcast,
        decode_failed = stats.decode_failed,
        process_failed = stats.process_failed,
        "ingestion summary"
    );
    Ok(())
}

async fn wait_for_port(server: &SubscriberServer) -> u16 {
    loop {
        let port = server.port().await;
        if port > 0 {
            return port;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
