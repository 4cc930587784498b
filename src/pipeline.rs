//! Ingestion: raw device message in, stored readings and push events out.

use crate::broadcast::{Hub, PushEvent};
use crate::metadata::Enricher;
use crate::models::{NewReading, Reading};
use crate::normalizer::normalize;
use crate::storage::Storage;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// The identity of the device a message arrived for.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub id: i64,
    pub owner_id: String,
}

pub struct IngestionPipeline {
    storage: Arc<dyn Storage>,
    enricher: Enricher,
    hub: Arc<Hub>,
}

impl IngestionPipeline {
    pub fn new(storage: Arc<dyn Storage>, enricher: Enricher, hub: Arc<Hub>) -> Self {
        Self {
            storage,
            enricher,
            hub,
        }
    }

    /// Processes one inbound message and returns the readings that were stored.
    /// Never fails: bad payloads and storage errors are logged and skipped.
    pub async fn handle_message(&self, device: &DeviceContext, payload: &[u8]) -> Vec<Reading> {
        let data: Value = match serde_json::from_slice(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(device = device.id, "Error parsing MQTT payload: {}", e);
                return Vec::new();
            }
        };

        let owner = Some(device.owner_id.as_str());
        let normalized = normalize(&data);
        self.hub.broadcast(&PushEvent::raw(device.id, data), owner);

        let mut stored = Vec::with_capacity(normalized.len());
        for item in normalized {
            if item.value.is_nan() {
                warn!(
                    device = device.id,
                    kind = %item.kind,
                    "Dropping reading with non-numeric value"
                );
                continue;
            }

            self.enricher.discover(&item.kind, Value::from(item.value));

            let reading = match self
                .storage
                .add_reading(NewReading {
                    device_id: device.id,
                    kind: item.kind,
                    value: item.value,
                    unit: item.unit,
                })
                .await
            {
                Ok(reading) => reading,
                Err(e) => {
                    error!(device = device.id, "Failed to store reading: {}", e);
                    continue;
                }
            };

            debug!(device = device.id, kind = %reading.kind, value = reading.value, "reading stored");
            self.hub.broadcast(&PushEvent::reading(reading.clone()), owner);
            stored.push(reading);
        }
        stored
    }
}
