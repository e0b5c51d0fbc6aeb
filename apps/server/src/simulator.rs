//! Simulated shelf devices.
//!
//! Each device starts with 50-100 units of weight on the shelf, reports it
//! once, then on a fixed per-device interval sells 1-5 items and reports the
//! new weight. A sale that would take the shelf below zero is skipped.

use std::ops::RangeInclusive;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stockpulse_ingest::{Device, TelemetryIngress};
use stockpulse_protocol::TelemetryMessage;

use crate::config::SimulationSection;

#[derive(Debug, Clone)]
pub struct DeviceSimulator {
    device_id: String,
    weight: f64,
    item_weight: f64,
    period: Duration,
}

impl DeviceSimulator {
    pub fn new<R: Rng + ?Sized>(device: &Device, interval_secs: RangeInclusive<u64>, rng: &mut R) -> Self {
        Self {
            device_id: device.device_id.clone(),
            weight: 50.0 + rng.gen_range(0.0..1.0) * 50.0,
            item_weight: device.item_weight,
            period: Duration::from_secs(rng.gen_range(interval_secs)),
        }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Sells 1-5 items. Returns the number sold, or `None` when the shelf
    /// does not hold that many.
    pub fn sell<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<u32> {
        let items = rng.gen_range(1..=5u32);
        let remaining = self.weight - f64::from(items) * self.item_weight;
        if remaining < 0.0 {
            return None;
        }
        self.weight = remaining;
        Some(items)
    }

    fn reading(&self) -> TelemetryMessage {
        TelemetryMessage {
            device_id: self.device_id.clone(),
            weight: self.weight,
            timestamp: Utc::now(),
        }
    }

    async fn report(&self, ingress: &TelemetryIngress) {
        // Failures are already logged by the ingress with the broker health.
        if ingress.forward_reading(&self.reading()).await.is_ok() {
            debug!(device = %self.device_id, weight = self.weight, "reported weight");
        }
    }

    pub async fn run(mut self, ingress: TelemetryIngress, cancel: CancellationToken) {
        let mut rng = StdRng::from_entropy();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);

        self.report(&ingress).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(items) = self.sell(&mut rng) {
                        debug!(device = %self.device_id, items, "items sold");
                        self.report(&ingress).await;
                    }
                }
            }
        }
    }
}

/// Spawns one task per simulated device, drawn from the front of `devices`.
pub fn spawn(
    config: &SimulationSection,
    devices: &[Device],
    ingress: TelemetryIngress,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    if devices.len() < config.devices {
        warn!(
            requested = config.devices,
            available = devices.len(),
            "fewer devices registered than requested for simulation"
        );
    }

    let interval = config.min_interval_secs..=config.max_interval_secs;
    let mut rng = StdRng::from_entropy();
    let tasks: Vec<_> = devices
        .iter()
        .take(config.devices)
        .map(|device| {
            let sim = DeviceSimulator::new(device, interval.clone(), &mut rng);
            tokio::spawn(sim.run(ingress.clone(), cancel.clone()))
        })
        .collect();

    info!(devices = tasks.len(), "device simulation started");
    tasks
}
