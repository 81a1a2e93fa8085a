// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! pH probe driver
//!
//! Reads the pH value (mandatory) and the probe temperature (optional). The
//! calibrated value is clamped to the physical range [0, 14]; a clamped
//! reading is reported as `uncertain`.

use super::{resolve_register, step_delay, DecodedFields, DriverError, ReadStep};
use crate::config::{Calibration, SensorDefinition, SensorKind};
use crate::decoder::RegisterSpec;
use crate::reading::{Quality, Reading};
use log::warn;
use std::time::Duration;

pub const UNIT: &str = "pH";
pub const REG_PH_VALUE: &str = "ph_value";
pub const REG_TEMPERATURE: &str = "temperature";

const PH_MIN: f64 = 0.0;
const PH_MAX: f64 = 14.0;
const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct PhDriver {
    ph_value: RegisterSpec,
    temperature: RegisterSpec,
    delay: Duration,
    calibration: Calibration,
}

impl PhDriver {
    pub fn new(sensor: &SensorDefinition) -> Self {
        Self {
            ph_value: resolve_register(sensor, RegisterSpec::word(REG_PH_VALUE, 0x0001)),
            temperature: resolve_register(
                sensor,
                RegisterSpec::word(REG_TEMPERATURE, 0x0003).optional_without_fallback(),
            ),
            delay: step_delay(sensor, DEFAULT_STEP_DELAY),
            calibration: sensor.calibration,
        }
    }

    pub fn steps(&self) -> Vec<ReadStep> {
        vec![
            ReadStep::new(self.ph_value.clone(), Duration::ZERO),
            ReadStep::new(self.temperature.clone(), self.delay),
        ]
    }

    pub fn compute(&self, sensor_id: &str, fields: &DecodedFields) -> Result<Reading, DriverError> {
        let raw = fields.mandatory(REG_PH_VALUE)?;
        let calibrated = self.calibration.apply(raw);
        let value = calibrated.clamp(PH_MIN, PH_MAX);

        let mut reading = Reading::new(sensor_id, SensorKind::Ph, value, UNIT)
            .with_raw_bytes(fields.raw(REG_PH_VALUE));
        if value != calibrated {
            warn!(
                "Sensor {}: pH {} outside [{}, {}], clamped to {}",
                sensor_id, calibrated, PH_MIN, PH_MAX, value
            );
            reading.quality = Quality::Uncertain;
            reading.set("clamped", true);
        }
        if let Some(temperature) = fields.value(REG_TEMPERATURE) {
            reading.set("temperature", temperature);
        }
        Ok(reading)
    }
}
