// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Radar level sensor driver
//!
//! The radar is mounted above a rectangular tank and measures the air
//! distance down to the water surface. The level is derived from the air
//! distance observed at the maximum level; volume, fill percentage and the
//! high level alarm follow from the tank geometry.

use super::{resolve_register, DecodedFields, DriverError, ReadStep};
use crate::config::{Calibration, ResolvedGeometry, SensorDefinition, SensorKind};
use crate::decoder::RegisterSpec;
use crate::reading::Reading;
use std::time::Duration;

pub const UNIT: &str = "mm";
pub const REG_AIR_DISTANCE: &str = "air_distance";

/// Fraction of the maximum level that raises the alarm
const ALARM_RATIO: f64 = 0.9;
const MM3_PER_M3: f64 = 1e9;

/// Values derived from one air distance measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelMetrics {
    pub water_level_mm: f64,
    pub volume_m3: f64,
    pub volume_percentage: f64,
    pub level_above_normal_mm: f64,
    pub alarm: bool,
}

/// Derive tank metrics from a measured air distance
pub fn level_metrics(measured_air_distance: f64, geometry: &ResolvedGeometry) -> LevelMetrics {
    let water_level_mm = (geometry.air_distance_max_mm - measured_air_distance).max(0.0);
    let volume_m3 = water_level_mm * geometry.width_mm * geometry.length_mm / MM3_PER_M3;
    let volume_percentage =
        (water_level_mm / geometry.max_water_level_mm * 100.0).clamp(0.0, 100.0);
    LevelMetrics {
        water_level_mm,
        volume_m3,
        volume_percentage,
        level_above_normal_mm: water_level_mm - geometry.normal_water_level_mm,
        alarm: water_level_mm >= ALARM_RATIO * geometry.max_water_level_mm,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RadarDriver {
    air_distance: RegisterSpec,
    calibration: Calibration,
    geometry: ResolvedGeometry,
}

impl RadarDriver {
    pub fn new(sensor: &SensorDefinition) -> Self {
        Self {
            air_distance: resolve_register(sensor, RegisterSpec::word(REG_AIR_DISTANCE, 0x0001)),
            calibration: sensor.calibration,
            geometry: sensor.geometry(),
        }
    }

    pub fn geometry(&self) -> &ResolvedGeometry {
        &self.geometry
    }

    pub fn steps(&self) -> Vec<ReadStep> {
        vec![ReadStep::new(self.air_distance.clone(), Duration::ZERO)]
    }

    pub fn compute(&self, sensor_id: &str, fields: &DecodedFields) -> Result<Reading, DriverError> {
        let measured = self
            .calibration
            .apply(fields.mandatory(REG_AIR_DISTANCE)?);
        let metrics = level_metrics(measured, &self.geometry);

        let mut reading = Reading::new(sensor_id, SensorKind::Radar, metrics.water_level_mm, UNIT)
            .with_raw_bytes(fields.raw(REG_AIR_DISTANCE));
        reading.set("measured_air_distance", measured);
        reading.set("actual_volume", metrics.volume_m3);
        reading.set("volume_percentage", metrics.volume_percentage);
        reading.set("level_above_normal", metrics.level_above_normal_mm);
        reading.set("water_level_alarm", metrics.alarm);
        reading.set("distance_m", measured / 1000.0);
        Ok(reading)
    }
}
