// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Sensor definitions
//!
//! A [`SensorDefinition`] is loaded once from the configuration file and never
//! changes for the lifetime of the process. Field names follow the gateway
//! configuration format; the legacy names `type`, `device_id` and
//! `read_interval_seconds` are accepted as aliases.

use crate::decoder::{ByteOrder, DataType};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Configuration problems that never block a reading
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid geometry value for {field}: {value}")]
    InvalidGeometry { field: &'static str, value: f64 },
}

/// Sensor family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    #[serde(alias = "pH", alias = "PH")]
    Ph,
    Turbidity,
    Flow,
    Radar,
    /// Any kind this engine has no driver for
    #[serde(other)]
    Unsupported,
}

impl SensorKind {
    /// Poll interval used when none (or an invalid one) is configured
    pub fn default_poll_interval(self) -> Duration {
        match self {
            SensorKind::Ph | SensorKind::Turbidity => Duration::from_secs(15),
            SensorKind::Flow => Duration::from_secs(10),
            SensorKind::Radar => Duration::from_secs(20),
            SensorKind::Unsupported => Duration::from_secs(30),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Ph => "ph",
            SensorKind::Turbidity => "turbidity",
            SensorKind::Flow => "flow",
            SensorKind::Radar => "radar",
            SensorKind::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linear correction `value * scale + offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            scale: 1.0,
        }
    }
}

impl Calibration {
    pub fn apply(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }
}

/// Tank geometry for radar level sensors, all lengths in millimetres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerGeometry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_water_level_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_water_level_mm: Option<f64>,
    /// Air distance measured by the radar when the tank is at its maximum level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air_distance_max_mm: Option<f64>,
}

/// Geometry with every field resolved to a usable value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedGeometry {
    pub width_mm: f64,
    pub length_mm: f64,
    pub max_water_level_mm: f64,
    pub normal_water_level_mm: f64,
    pub air_distance_max_mm: f64,
}

impl Default for ResolvedGeometry {
    fn default() -> Self {
        Self {
            width_mm: 2500.0,
            length_mm: 4000.0,
            max_water_level_mm: 1500.0,
            normal_water_level_mm: 800.0,
            air_distance_max_mm: 5500.0,
        }
    }
}

impl ContainerGeometry {
    /// Resolve missing or unusable fields to the installation defaults.
    /// The second element lists the values that were rejected.
    pub fn resolve(&self) -> (ResolvedGeometry, Vec<ConfigError>) {
        let defaults = ResolvedGeometry::default();
        let mut errors = Vec::new();
        let mut pick = |field: &'static str, value: Option<f64>, default: f64, allow_zero: bool| {
            match value {
                None => default,
                Some(v) if v.is_finite() && (v > 0.0 || (allow_zero && v == 0.0)) => v,
                Some(v) => {
                    errors.push(ConfigError::InvalidGeometry { field, value: v });
                    default
                }
            }
        };
        let resolved = ResolvedGeometry {
            width_mm: pick("width_mm", self.width_mm, defaults.width_mm, false),
            length_mm: pick("length_mm", self.length_mm, defaults.length_mm, false),
            max_water_level_mm: pick(
                "max_water_level_mm",
                self.max_water_level_mm,
                defaults.max_water_level_mm,
                false,
            ),
            normal_water_level_mm: pick(
                "normal_water_level_mm",
                self.normal_water_level_mm,
                defaults.normal_water_level_mm,
                true,
            ),
            air_distance_max_mm: pick(
                "air_distance_max_mm",
                self.air_distance_max_mm,
                defaults.air_distance_max_mm,
                false,
            ),
        };
        (resolved, errors)
    }
}

/// Override of one register of a driver's default map
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RegisterOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_order: Option<ByteOrder>,
}

/// One sensor attached to the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDefinition {
    /// Unique identifier, also used as telemetry key prefix
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(alias = "type")]
    pub kind: SensorKind,

    /// Modbus slave address, 1 to 247
    #[serde(alias = "device_id")]
    pub slave_address: u8,

    /// Poll interval in seconds. Values below 1 s or too large for a `Duration`
    /// fall back to the kind default.
    #[serde(
        default,
        alias = "read_interval_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub poll_interval_secs: Option<f64>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub calibration: Calibration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_geometry: Option<ContainerGeometry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Opaque key/value passthrough into telemetry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Per-register overrides keyed by logical register name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub registers: BTreeMap<String, RegisterOverride>,

    /// Uniform override of the driver's inter-step delays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_delay_ms: Option<u64>,

    /// Turbidity only: add the cosmetic display jitter of the legacy firmware
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub display_jitter: bool,
}

fn default_enabled() -> bool {
    true
}

impl SensorDefinition {
    /// Minimal definition with every optional field at its default
    pub fn new(id: &str, kind: SensorKind, slave_address: u8) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            kind,
            slave_address,
            poll_interval_secs: None,
            enabled: true,
            calibration: Calibration::default(),
            container_geometry: None,
            location: None,
            metadata: BTreeMap::new(),
            registers: BTreeMap::new(),
            step_delay_ms: None,
            display_jitter: false,
        }
    }

    /// Effective poll interval, never below one second. Values that are below
    /// one second or not representable fall back to the kind default.
    pub fn poll_interval(&self) -> Duration {
        let Some(secs) = self.poll_interval_secs else {
            return self.kind.default_poll_interval();
        };
        match Duration::try_from_secs_f64(secs) {
            Ok(interval) if interval >= Duration::from_secs(1) => interval,
            Ok(_) => {
                warn!(
                    "Sensor {}: poll interval {}s is below 1s, using {:?}",
                    self.id,
                    secs,
                    self.kind.default_poll_interval()
                );
                self.kind.default_poll_interval()
            }
            Err(err) => {
                warn!(
                    "Sensor {}: poll interval {}s is unusable ({}), using {:?}",
                    self.id,
                    secs,
                    err,
                    self.kind.default_poll_interval()
                );
                self.kind.default_poll_interval()
            }
        }
    }

    /// Geometry with defaults applied; rejected values are logged
    pub fn geometry(&self) -> ResolvedGeometry {
        let (resolved, errors) = self.container_geometry.unwrap_or_default().resolve();
        for err in errors {
            warn!("Sensor {}: {}, using default", self.id, err);
        }
        resolved
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}
