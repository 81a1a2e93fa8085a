// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Flow meter driver
//!
//! Five reads, in order: flow rate, total flow low word, total flow high word,
//! unit code and decimal point code. The first three are mandatory. The unit
//! and decimal point registers report `0xFFFF` when the meter was never
//! configured; they then default to m³ and 3.
//!
//! Total flow is `((high << 16) | low) * 10^(decimal_point - 3)`.

use super::{resolve_register, step_delay, DecodedFields, DriverError, ReadStep, RegisterFailure};
use crate::config::{Calibration, SensorDefinition, SensorKind};
use crate::decoder::{combine_words, DecodeError, RegisterSpec};
use crate::reading::Reading;
use log::warn;
use std::time::Duration;

pub const DEFAULT_UNIT: &str = "m³";
pub const REG_FLOW_RATE: &str = "flow_rate";
pub const REG_TOTAL_FLOW_LOW: &str = "total_flow_low";
pub const REG_TOTAL_FLOW_HIGH: &str = "total_flow_high";
pub const REG_FLOW_UNIT: &str = "flow_unit";
pub const REG_FLOW_DECIMAL_POINT: &str = "flow_decimal_point";

const DEFAULT_UNIT_CODE: u16 = 0;
const DEFAULT_DECIMAL_POINT: u16 = 3;
/// Decimal point codes above this are treated as corrupt
const MAX_DECIMAL_POINT: u16 = 9;
const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(100);

/// Display string of a unit code, m³ for unmapped codes
pub fn unit_name(code: u16) -> &'static str {
    match code {
        0 => "m³",
        1 => "L",
        2 => "GAL",
        3 => "CF",
        5 => "ft³",
        _ => DEFAULT_UNIT,
    }
}

/// Whole value in `0..=0xFFFF`, `None` otherwise
fn as_word(value: f64) -> Option<u16> {
    (value.fract() == 0.0 && (0.0..=f64::from(u16::MAX)).contains(&value)).then(|| value as u16)
}

/// Mandatory register that must hold one unsigned 16-bit word
fn mandatory_word(fields: &DecodedFields, name: &str) -> Result<u16, DriverError> {
    let value = fields.mandatory(name)?;
    as_word(value).ok_or_else(|| DriverError::MandatoryRegisterFailed {
        register: name.to_string(),
        source: RegisterFailure::Decode(DecodeError::OutOfRange(value.to_string())),
    })
}

/// Scaled totalizer value
pub fn total_flow(high: u16, low: u16, decimal_point: u16) -> f64 {
    let exponent = i32::from(decimal_point) - 3;
    f64::from(combine_words(high, low)) * 10f64.powi(exponent)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowDriver {
    flow_rate: RegisterSpec,
    total_low: RegisterSpec,
    total_high: RegisterSpec,
    unit: RegisterSpec,
    decimal_point: RegisterSpec,
    delay: Duration,
    calibration: Calibration,
}

impl FlowDriver {
    pub fn new(sensor: &SensorDefinition) -> Self {
        Self {
            flow_rate: resolve_register(sensor, RegisterSpec::word(REG_FLOW_RATE, 0x0001)),
            total_low: resolve_register(sensor, RegisterSpec::word(REG_TOTAL_FLOW_LOW, 0x000A)),
            total_high: resolve_register(sensor, RegisterSpec::word(REG_TOTAL_FLOW_HIGH, 0x0011)),
            unit: resolve_register(
                sensor,
                RegisterSpec::word(REG_FLOW_UNIT, 0x1438)
                    .optional(f64::from(DEFAULT_UNIT_CODE))
                    .with_sentinel_default(DEFAULT_UNIT_CODE),
            ),
            decimal_point: resolve_register(
                sensor,
                RegisterSpec::word(REG_FLOW_DECIMAL_POINT, 0x1439)
                    .optional(f64::from(DEFAULT_DECIMAL_POINT))
                    .with_sentinel_default(DEFAULT_DECIMAL_POINT),
            ),
            delay: step_delay(sensor, DEFAULT_STEP_DELAY),
            calibration: sensor.calibration,
        }
    }

    pub fn steps(&self) -> Vec<ReadStep> {
        vec![
            ReadStep::new(self.flow_rate.clone(), Duration::ZERO),
            ReadStep::new(self.total_low.clone(), self.delay),
            ReadStep::new(self.total_high.clone(), self.delay),
            ReadStep::new(self.unit.clone(), self.delay),
            ReadStep::new(self.decimal_point.clone(), self.delay),
        ]
    }

    pub fn compute(&self, sensor_id: &str, fields: &DecodedFields) -> Result<Reading, DriverError> {
        let rate = fields.mandatory(REG_FLOW_RATE)?;
        let low = mandatory_word(fields, REG_TOTAL_FLOW_LOW)?;
        let high = mandatory_word(fields, REG_TOTAL_FLOW_HIGH)?;
        let unit_code = fields
            .value(REG_FLOW_UNIT)
            .map_or(Some(DEFAULT_UNIT_CODE), as_word)
            .unwrap_or(DEFAULT_UNIT_CODE);
        let mut decimal_point = fields
            .value(REG_FLOW_DECIMAL_POINT)
            .map_or(Some(DEFAULT_DECIMAL_POINT), as_word)
            .unwrap_or(u16::MAX);
        if decimal_point > MAX_DECIMAL_POINT {
            warn!(
                "Sensor {}: decimal point code {} out of range, using {}",
                sensor_id, decimal_point, DEFAULT_DECIMAL_POINT
            );
            decimal_point = DEFAULT_DECIMAL_POINT;
        }

        let unit = unit_name(unit_code);
        let value = self.calibration.apply(rate);
        let mut reading = Reading::new(sensor_id, SensorKind::Flow, value, unit)
            .with_raw_bytes(fields.raw(REG_FLOW_RATE));
        reading.set("total_flow", total_flow(high, low, decimal_point));
        reading.set("total_flow_low", f64::from(low));
        reading.set("total_flow_high", f64::from(high));
        reading.set("flow_decimal_point", f64::from(decimal_point));
        reading.set("flow_unit", unit);
        reading.set("flow_unit_code", f64::from(unit_code));
        Ok(reading)
    }
}
