// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Turbidity sensor driver
//!
//! The sensor reports a raw count with a fixed offset of 30. Readings at or
//! below the offset are mapped into the [1, 3] NTU band from `raw / 6`.
//! When `display_jitter` is enabled a uniform variation in [-0.32, 0.37) is
//! added to the adjusted value, reproducing the legacy dashboard display.

use super::{resolve_register, step_delay, DecodedFields, DriverError, ReadStep};
use crate::config::{Calibration, SensorDefinition, SensorKind};
use crate::decoder::RegisterSpec;
use crate::reading::Reading;
use rand::Rng;
use std::time::Duration;

pub const UNIT: &str = "NTU";
pub const REG_TURBIDITY: &str = "turbidity";
pub const REG_TEMPERATURE: &str = "temperature";

const RAW_OFFSET: f64 = 30.0;
const LOW_BAND_DIVISOR: f64 = 6.0;
const LOW_BAND_MIN: f64 = 1.0;
const LOW_BAND_MAX: f64 = 3.0;
const JITTER_MIN: f64 = -0.32;
const JITTER_MAX: f64 = 0.37;
const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(50);

/// Offset-corrected turbidity before jitter and calibration
pub fn adjust(raw: f64) -> f64 {
    let adjusted = raw - RAW_OFFSET;
    if adjusted <= 0.0 {
        (raw / LOW_BAND_DIVISOR).clamp(LOW_BAND_MIN, LOW_BAND_MAX)
    } else {
        adjusted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurbidityDriver {
    turbidity: RegisterSpec,
    temperature: RegisterSpec,
    delay: Duration,
    calibration: Calibration,
    display_jitter: bool,
}

impl TurbidityDriver {
    pub fn new(sensor: &SensorDefinition) -> Self {
        Self {
            turbidity: resolve_register(sensor, RegisterSpec::word(REG_TURBIDITY, 0x0001)),
            temperature: resolve_register(
                sensor,
                RegisterSpec::word(REG_TEMPERATURE, 0x0003).optional(0.0),
            ),
            delay: step_delay(sensor, DEFAULT_STEP_DELAY),
            calibration: sensor.calibration,
            display_jitter: sensor.display_jitter,
        }
    }

    pub fn steps(&self) -> Vec<ReadStep> {
        vec![
            ReadStep::new(self.turbidity.clone(), Duration::ZERO),
            ReadStep::new(self.temperature.clone(), self.delay),
        ]
    }

    pub fn compute(&self, sensor_id: &str, fields: &DecodedFields) -> Result<Reading, DriverError> {
        let jitter = if self.display_jitter {
            rand::rng().random_range(JITTER_MIN..JITTER_MAX)
        } else {
            0.0
        };
        self.compute_with_jitter(sensor_id, fields, jitter)
    }

    /// Compute with an explicit jitter sample
    pub fn compute_with_jitter(
        &self,
        sensor_id: &str,
        fields: &DecodedFields,
        jitter: f64,
    ) -> Result<Reading, DriverError> {
        let raw = fields.mandatory(REG_TURBIDITY)?;
        let displayed = adjust(raw) + jitter;
        let value = self.calibration.apply(displayed);

        let mut reading = Reading::new(sensor_id, SensorKind::Turbidity, value, UNIT)
            .with_raw_bytes(fields.raw(REG_TURBIDITY));
        reading.set("turbidity_raw", raw);
        reading.set("turbidity_formatted", format!("{:.1}", displayed));
        reading.set("temperature", fields.value(REG_TEMPERATURE).unwrap_or(0.0));
        Ok(reading)
    }
}
