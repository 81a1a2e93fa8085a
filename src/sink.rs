// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Telemetry sink boundary
//!
//! Completed polls leave the engine as [`SinkMessage`]s on a bounded channel.
//! The consumer (a dashboard client, a logger) owns delivery; the engine never
//! waits on it: when the queue is full the record is dropped and counted.

use crate::config::{SensorDefinition, SensorKind};
use crate::reading::{MeasurementValue, Quality, Reading};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// One successful poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub sensor_id: String,
    pub kind: SensorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub primary_value: f64,
    pub unit: String,
    pub measurements: BTreeMap<String, MeasurementValue>,
    pub timestamp_millis: i64,
    pub quality: Quality,
    /// Passthrough of the sensor's configured metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl TelemetryRecord {
    /// Build a record from a reading; `None` when the reading has no value
    pub fn from_reading(sensor: &SensorDefinition, reading: &Reading) -> Option<Self> {
        let primary_value = reading.primary_value?;
        Some(Self {
            sensor_id: reading.sensor_id.clone(),
            kind: reading.kind,
            name: sensor.name.clone(),
            location: sensor.location.clone(),
            primary_value,
            unit: reading.unit.clone(),
            measurements: reading.metadata.clone(),
            timestamp_millis: reading.timestamp_millis,
            quality: reading.quality,
            metadata: sensor.metadata.clone(),
        })
    }

    /// Flat `<sensorId>_<key>` map used by dashboard clients
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut flat = BTreeMap::new();
        flat.insert(
            format!("{}_{}", self.sensor_id, self.kind),
            json!(self.primary_value),
        );
        for (key, value) in &self.measurements {
            flat.insert(format!("{}_{}", self.sensor_id, key), json!(value));
        }
        flat
    }

    /// Nested `<sensorId>_data` document with sensor info and measurements
    pub fn structured(&self) -> Value {
        let mut measurements = serde_json::Map::new();
        measurements.insert(self.kind.to_string(), json!(self.primary_value));
        for (key, value) in &self.measurements {
            measurements.insert(key.clone(), json!(value));
        }
        json!({
            (format!("{}_data", self.sensor_id)): {
                "info": {
                    "id": self.sensor_id,
                    "name": self.name,
                    "location": self.location,
                    "type": self.kind,
                },
                "metadata": self.metadata,
                "measurements": measurements,
                "timestamp": self.timestamp_millis,
                "status": "active",
                "quality": self.quality,
                "unit": self.unit,
            }
        })
    }
}

/// One failed poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub sensor_id: String,
    pub kind: SensorKind,
    pub error_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub message: String,
    pub timestamp_millis: i64,
}

impl ErrorRecord {
    pub fn from_reading(reading: &Reading) -> Self {
        let (error_kind, cause, message) = match &reading.error {
            Some(err) => (err.kind.clone(), err.cause.clone(), err.message.clone()),
            None => (
                "unknown".to_string(),
                None,
                format!("reading with quality {}", reading.quality),
            ),
        };
        Self {
            sensor_id: reading.sensor_id.clone(),
            kind: reading.kind,
            error_kind,
            cause,
            message,
            timestamp_millis: reading.timestamp_millis,
        }
    }
}

/// Message published by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkMessage {
    Telemetry(TelemetryRecord),
    Error(ErrorRecord),
}

impl SinkMessage {
    /// Route a reading to telemetry or to the error channel
    pub fn from_reading(sensor: &SensorDefinition, reading: &Reading) -> Self {
        match TelemetryRecord::from_reading(sensor, reading) {
            Some(record) if !reading.is_bad() => SinkMessage::Telemetry(record),
            _ => SinkMessage::Error(ErrorRecord::from_reading(reading)),
        }
    }

    pub fn sensor_id(&self) -> &str {
        match self {
            SinkMessage::Telemetry(r) => &r.sensor_id,
            SinkMessage::Error(r) => &r.sensor_id,
        }
    }
}

/// Non-blocking producer side of the sink queue
#[derive(Clone)]
pub struct TelemetrySink {
    tx: mpsc::Sender<SinkMessage>,
    dropped: Arc<AtomicU64>,
}

impl TelemetrySink {
    /// Create a sink and the receiver the consumer reads from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue `message`. Returns false when it was dropped.
    pub fn emit(&self, message: SinkMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Telemetry queue full, dropping record for sensor {}",
                    message.sensor_id()
                );
                false
            }
            Err(TrySendError::Closed(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Telemetry consumer gone, dropping record for sensor {}",
                    message.sensor_id()
                );
                false
            }
        }
    }

    /// Number of records dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::ReadingError;

    fn flow_reading() -> Reading {
        let mut reading = Reading::new("flow_1", SensorKind::Flow, 12.5, "m³");
        reading.set("total_flow", 65536.0);
        reading.set("flow_unit", "m³");
        reading
    }

    #[test]
    fn test_flatten_prefixes_keys() {
        let sensor = SensorDefinition::new("flow_1", SensorKind::Flow, 3);
        let record = TelemetryRecord::from_reading(&sensor, &flow_reading()).unwrap();
        let flat = record.flatten();
        assert_eq!(flat["flow_1_flow"], json!(12.5));
        assert_eq!(flat["flow_1_total_flow"], json!(65536.0));
        assert_eq!(flat["flow_1_flow_unit"], json!("m³"));
    }

    #[test]
    fn test_structured_document() {
        let mut sensor = SensorDefinition::new("flow_1", SensorKind::Flow, 3);
        sensor.location = Some("inlet".to_string());
        let record = TelemetryRecord::from_reading(&sensor, &flow_reading()).unwrap();
        let doc = record.structured();
        assert_eq!(doc["flow_1_data"]["info"]["location"], "inlet");
        assert_eq!(doc["flow_1_data"]["measurements"]["flow"], json!(12.5));
        assert_eq!(doc["flow_1_data"]["status"], "active");
    }

    #[test]
    fn test_bad_reading_routes_to_error() {
        let sensor = SensorDefinition::new("ph_1", SensorKind::Ph, 1);
        let reading = Reading::bad(
            "ph_1",
            SensorKind::Ph,
            "pH",
            ReadingError {
                kind: "mandatory_register_failed".into(),
                cause: Some("timeout".into()),
                message: "mandatory register ph_value failed".into(),
            },
        );
        match SinkMessage::from_reading(&sensor, &reading) {
            SinkMessage::Error(record) => {
                assert_eq!(record.error_kind, "mandatory_register_failed");
                assert_eq!(record.cause.as_deref(), Some("timeout"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (sink, mut rx) = TelemetrySink::channel(1);
        let sensor = SensorDefinition::new("flow_1", SensorKind::Flow, 3);
        let message = SinkMessage::from_reading(&sensor, &flow_reading());
        assert!(sink.emit(message.clone()));
        assert!(!sink.emit(message.clone()));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.recv().await, Some(message));
    }
}
