//! In-memory inventory: device registry, last-known weights, and bounded
//! reading history per device.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use stockpulse_protocol::{InventoryUpdate, TelemetryMessage};

use crate::IngestError;
use crate::history::History;
use crate::processor::{ProcessFuture, Processor};

/// Readings kept per device.
pub const DEFAULT_HISTORY_LEN: usize = 100;

const SEED_CLIENTS: [&str; 5] = [
    "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11",
    "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a12",
    "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a13",
    "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a14",
    "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a15",
];
const SEED_LOCATIONS: [&str; 5] = ["New York", "Los Angeles", "Chicago", "Houston", "Phoenix"];
const SEED_DEVICES_PER_CLIENT: usize = 100;

/// A registered shelf device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub device_id: String,
    pub client_id: Uuid,
    pub location: String,
    /// Weight of a single item, in the same unit as readings.
    pub item_weight: f64,
    pub max_capacity: f64,
}

/// One processed reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub weight: f64,
    pub item_count: i64,
    pub timestamp: DateTime<Utc>,
}

/// The 5 clients x 100 devices fleet (`device-<client>-<nnn>`), one city
/// per client, item weight 1.0, capacity 100.
pub fn default_devices() -> Vec<Device> {
    let mut devices = Vec::with_capacity(SEED_CLIENTS.len() * SEED_DEVICES_PER_CLIENT);
    for (i, (client, location)) in SEED_CLIENTS.iter().zip(SEED_LOCATIONS).enumerate() {
        let client_id = Uuid::parse_str(client).unwrap_or_else(|_| Uuid::nil());
        for j in 0..SEED_DEVICES_PER_CLIENT {
            devices.push(Device {
                device_id: format!("device-{}-{:03}", i + 1, j + 1),
                client_id,
                location: location.to_string(),
                item_weight: 1.0,
                max_capacity: 100.0,
            });
        }
    }
    devices
}

#[derive(Debug)]
struct DeviceState {
    last_weight: f64,
    history: History<Reading>,
}

/// [`Processor`] backed by process memory.
///
/// A device with no cached weight reports `prev_weight = 0`.
#[derive(Debug)]
pub struct InventoryProcessor {
    devices: RwLock<HashMap<String, Device>>,
    state: Mutex<HashMap<String, DeviceState>>,
    history_len: usize,
}

impl Default for InventoryProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl InventoryProcessor {
    pub fn new(history_len: usize) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            state: Mutex::new(HashMap::new()),
            history_len,
        }
    }

    /// A processor pre-loaded with [`default_devices`].
    pub fn seeded() -> Self {
        let processor = Self::default();
        processor.seed(default_devices());
        processor
    }

    /// Registers devices that are not known yet; existing entries are kept.
    /// Returns how many were added.
    pub fn seed(&self, devices: impl IntoIterator<Item = Device>) -> usize {
        let mut registry = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for device in devices {
            if !registry.contains_key(&device.device_id) {
                registry.insert(device.device_id.clone(), device);
                added += 1;
            }
        }
        debug!(added, total = registry.len(), "devices seeded");
        added
    }

    /// Inserts or replaces a device.
    pub fn register_device(&self, device: Device) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.device_id.clone(), device);
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Last weight processed for a device.
    pub fn cached_weight(&self, device_id: &str) -> Option<f64> {
        self.lock_state().get(device_id).map(|s| s.last_weight)
    }

    pub fn latest_reading(&self, device_id: &str) -> Option<Reading> {
        self.lock_state()
            .get(device_id)
            .and_then(|s| s.history.latest().cloned())
    }

    /// Up to `limit` readings, newest first.
    pub fn history(&self, device_id: &str, limit: usize) -> Vec<Reading> {
        self.lock_state()
            .get(device_id)
            .map(|s| s.history.recent(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Applies a reading synchronously.
    pub fn apply(&self, reading: &TelemetryMessage) -> Result<InventoryUpdate, IngestError> {
        let device = self
            .device(&reading.device_id)
            .ok_or_else(|| IngestError::UnknownDevice(reading.device_id.clone()))?;
        if !(device.item_weight.is_finite() && device.item_weight > 0.0) {
            return Err(IngestError::InvalidDevice {
                device_id: device.device_id,
                reason: format!("item weight {} is not positive", device.item_weight),
            });
        }

        let item_count = (reading.weight / device.item_weight).round() as i64;

        let prev_weight = {
            let mut state = self.lock_state();
            let entry = state
                .entry(device.device_id.clone())
                .or_insert_with(|| DeviceState {
                    last_weight: 0.0,
                    history: History::new(self.history_len),
                });
            let prev = entry.last_weight;
            entry.last_weight = reading.weight;
            entry.history.push(Reading {
                weight: reading.weight,
                item_count,
                timestamp: reading.timestamp,
            });
            prev
        };

        Ok(InventoryUpdate {
            device_id: device.device_id,
            client_id: device.client_id.to_string(),
            weight: reading.weight,
            item_count,
            prev_weight,
            weight_delta: prev_weight - reading.weight,
            timestamp: reading.timestamp,
            location: device.location,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, HashMap<String, DeviceState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Processor for InventoryProcessor {
    fn process(&self, reading: TelemetryMessage) -> ProcessFuture<'_> {
        Box::pin(async move { self.apply(&reading) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device_id: &str, weight: f64) -> TelemetryMessage {
        TelemetryMessage {
            device_id: device_id.into(),
            weight,
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    fn dev001(item_weight: f64) -> Device {
        Device {
            device_id: "DEV001".into(),
            client_id: Uuid::parse_str(SEED_CLIENTS[2]).unwrap(),
            location: "Chicago".into(),
            item_weight,
            max_capacity: 100.0,
        }
    }

    #[test]
    fn default_fleet_shape() {
        let devices = default_devices();
        assert_eq!(devices.len(), 500);
        assert_eq!(devices[0].device_id, "device-1-001");
        assert_eq!(devices[0].location, "New York");
        assert_eq!(devices[499].device_id, "device-5-100");
        assert_eq!(devices[499].location, "Phoenix");
        assert_eq!(
            devices[499].client_id.to_string(),
            "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a15"
        );
        assert!(devices.iter().all(|d| d.item_weight == 1.0 && d.max_capacity == 100.0));
    }

    #[test]
    fn first_reading_has_zero_prev_weight() {
        let processor = InventoryProcessor::default();
        processor.register_device(dev001(1.0));

        let update = processor.apply(&reading("DEV001", 45.0)).unwrap();
        assert_eq!(update.item_count, 45);
        assert_eq!(update.prev_weight, 0.0);
        assert_eq!(update.weight_delta, -45.0);
        assert_eq!(update.location, "Chicago");
        assert_eq!(update.client_id, SEED_CLIENTS[2]);
    }

    #[test]
    fn delta_uses_cached_weight() {
        let processor = InventoryProcessor::default();
        processor.register_device(dev001(1.0));

        processor.apply(&reading("DEV001", 50.0)).unwrap();
        let update = processor.apply(&reading("DEV001", 45.0)).unwrap();
        assert_eq!(update.prev_weight, 50.0);
        assert_eq!(update.weight_delta, 5.0);
        assert_eq!(processor.cached_weight("DEV001"), Some(45.0));
    }

    #[test]
    fn item_count_rounds_to_nearest() {
        let processor = InventoryProcessor::default();
        processor.register_device(dev001(2.5));

        assert_eq!(processor.apply(&reading("DEV001", 11.0)).unwrap().item_count, 4);
        assert_eq!(processor.apply(&reading("DEV001", 11.4)).unwrap().item_count, 5);
        assert_eq!(processor.apply(&reading("DEV001", 0.0)).unwrap().item_count, 0);
    }

    #[test]
    fn unknown_device_is_an_error() {
        let processor = InventoryProcessor::default();
        let err = processor.apply(&reading("nope", 1.0)).unwrap_err();
        assert!(matches!(err, IngestError::UnknownDevice(id) if id == "nope"));
        assert!(processor.latest_reading("nope").is_none());
    }

    #[test]
    fn zero_item_weight_is_rejected() {
        let processor = InventoryProcessor::default();
        processor.register_device(dev001(0.0));
        let err = processor.apply(&reading("DEV001", 1.0)).unwrap_err();
        assert!(matches!(err, IngestError::InvalidDevice { .. }));
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let processor = InventoryProcessor::new(3);
        processor.register_device(dev001(1.0));
        for w in [10.0, 9.0, 8.0, 7.0] {
            processor.apply(&reading("DEV001", w)).unwrap();
        }

        let weights: Vec<f64> = processor.history("DEV001", 10).iter().map(|r| r.weight).collect();
        assert_eq!(weights, vec![7.0, 8.0, 9.0]);
        assert_eq!(processor.history("DEV001", 1).len(), 1);
        assert_eq!(processor.latest_reading("DEV001").unwrap().item_count, 7);
    }

    #[test]
    fn seeding_keeps_existing_devices() {
        let processor = InventoryProcessor::seeded();
        assert_eq!(processor.device_count(), 500);

        let mut custom = processor.device("device-1-001").unwrap();
        custom.item_weight = 2.0;
        processor.register_device(custom);

        assert_eq!(processor.seed(default_devices()), 0);
        assert_eq!(processor.device("device-1-001").unwrap().item_weight, 2.0);
    }

    #[tokio::test]
    async fn processor_trait_delegates_to_apply() {
        let processor = InventoryProcessor::seeded();
        let update = processor.process(reading("device-3-042", 17.2)).await.unwrap();
        assert_eq!(update.item_count, 17);
        assert_eq!(update.location, "Chicago");
    }
}
