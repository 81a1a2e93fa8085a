// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Sensor readings

use crate::config::SensorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Confidence attached to a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
        };
        f.write_str(s)
    }
}

/// A measurement or metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl MeasurementValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MeasurementValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MeasurementValue::Flag(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for MeasurementValue {
    fn from(value: f64) -> Self {
        MeasurementValue::Number(value)
    }
}

impl From<bool> for MeasurementValue {
    fn from(value: bool) -> Self {
        MeasurementValue::Flag(value)
    }
}

impl From<String> for MeasurementValue {
    fn from(value: String) -> Self {
        MeasurementValue::Text(value)
    }
}

impl From<&str> for MeasurementValue {
    fn from(value: &str) -> Self {
        MeasurementValue::Text(value.to_string())
    }
}

/// Why a reading could not produce a primary value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingError {
    pub kind: String,
    /// Kind of the underlying link or decode error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub message: String,
}

/// Outcome of one poll of one sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub kind: SensorKind,
    /// Calibrated primary value, absent when quality is bad
    pub primary_value: Option<f64>,
    pub unit: String,
    pub timestamp_millis: i64,
    pub quality: Quality,
    /// Bytes of the primary register as received
    pub raw_bytes: Vec<u8>,
    pub metadata: BTreeMap<String, MeasurementValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReadingError>,
}

impl Reading {
    pub fn new(sensor_id: &str, kind: SensorKind, value: f64, unit: &str) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            kind,
            primary_value: Some(value),
            unit: unit.to_string(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            quality: Quality::Good,
            raw_bytes: Vec::new(),
            metadata: BTreeMap::new(),
            error: None,
        }
    }

    /// A reading whose mandatory register could not be obtained
    pub fn bad(sensor_id: &str, kind: SensorKind, unit: &str, error: ReadingError) -> Self {
        Self {
            primary_value: None,
            quality: Quality::Bad,
            error: Some(error),
            ..Self::new(sensor_id, kind, 0.0, unit)
        }
    }

    pub fn with_raw_bytes(mut self, raw: Vec<u8>) -> Self {
        self.raw_bytes = raw;
        self
    }

    pub fn set<V: Into<MeasurementValue>>(&mut self, key: &str, value: V) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MeasurementValue> {
        self.metadata.get(key)
    }

    pub fn is_bad(&self) -> bool {
        self.quality == Quality::Bad
    }
}
