// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Sensor drivers
//!
//! Each sensor family is one variant of the closed [`SensorDriver`] enum. A
//! driver is split in two halves:
//! - a read plan: the ordered [`ReadStep`]s (register spec plus the delay to
//!   wait before the step, which constrained sensor MCUs need)
//! - a pure compute function turning the decoded fields into a [`Reading`]
//!
//! The plan is executed by [`execute_plan`] on a [`BusSession`], which holds
//! the bus for the whole sequence. Optional registers that fail are replaced by
//! their fallback and flagged with `<register>_fallback`; a failed mandatory
//! register aborts the reading with quality `bad`.

pub mod flow;
pub mod ph;
pub mod radar;
pub mod turbidity;

use crate::bus::BusSession;
use crate::config::{SensorDefinition, SensorKind};
use crate::decoder::{DecodeError, RegisterSpec};
use crate::link::LinkError;
use crate::reading::{Reading, ReadingError};
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub use flow::FlowDriver;
pub use ph::PhDriver;
pub use radar::RadarDriver;
pub use turbidity::TurbidityDriver;

/// Cause of a failed register step
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegisterFailure {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl RegisterFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            RegisterFailure::Link(e) => e.kind(),
            RegisterFailure::Decode(e) => e.kind(),
        }
    }
}

/// Errors that abort a reading
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    #[error("mandatory register {register} failed: {source}")]
    MandatoryRegisterFailed {
        register: String,
        #[source]
        source: RegisterFailure,
    },
    #[error("read deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl DriverError {
    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::MandatoryRegisterFailed { .. } => "mandatory_register_failed",
            DriverError::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }

    /// Kind of the underlying transport or decode error, if any
    pub fn cause_kind(&self) -> Option<&'static str> {
        match self {
            DriverError::MandatoryRegisterFailed { source, .. } => Some(source.kind()),
            DriverError::DeadlineExceeded(_) => None,
        }
    }

    pub fn to_reading_error(&self) -> ReadingError {
        ReadingError {
            kind: self.kind().to_string(),
            cause: self.cause_kind().map(str::to_string),
            message: self.to_string(),
        }
    }
}

/// One register read of a driver's plan
#[derive(Debug, Clone, PartialEq)]
pub struct ReadStep {
    pub spec: RegisterSpec,
    /// Pause before this step, while still holding the bus
    pub delay_before: Duration,
}

impl ReadStep {
    pub fn new(spec: RegisterSpec, delay_before: Duration) -> Self {
        Self { spec, delay_before }
    }
}

/// Result of one executed step
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    /// Decoded value, or the fallback when the read failed
    pub value: Option<f64>,
    pub raw: Vec<u8>,
    pub fallback: bool,
}

/// Decoded values keyed by register name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFields {
    fields: BTreeMap<String, DecodedField>,
}

impl DecodedFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, field: DecodedField) {
        self.fields.insert(name.to_string(), field);
    }

    /// Record a successfully decoded value
    pub fn set(&mut self, name: &str, value: f64) {
        self.insert(
            name,
            DecodedField {
                value: Some(value),
                raw: Vec::new(),
                fallback: false,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&DecodedField> {
        self.fields.get(name)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(|f| f.value)
    }

    pub fn raw(&self, name: &str) -> Vec<u8> {
        self.fields
            .get(name)
            .map(|f| f.raw.clone())
            .unwrap_or_default()
    }

    pub fn is_fallback(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|f| f.fallback)
    }

    /// Names of the registers that fell back
    pub fn fallbacks(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, f)| f.fallback)
            .map(|(name, _)| name.as_str())
    }

    /// Value of a mandatory register, which is always present after a successful plan
    fn mandatory(&self, name: &str) -> Result<f64, DriverError> {
        self.value(name)
            .ok_or_else(|| DriverError::MandatoryRegisterFailed {
                register: name.to_string(),
                source: RegisterFailure::Link(LinkError::MalformedResponse(
                    "register missing from decoded fields".to_string(),
                )),
            })
    }
}

/// Run `steps` in order on `session`
pub async fn execute_plan(
    session: &mut BusSession<'_>,
    sensor_id: &str,
    steps: &[ReadStep],
) -> Result<DecodedFields, DriverError> {
    let mut fields = DecodedFields::new();
    for step in steps {
        if !step.delay_before.is_zero() {
            tokio::time::sleep(step.delay_before).await;
        }
        let spec = &step.spec;
        let outcome = match session.read(spec).await {
            Ok(block) => block
                .decode()
                .map(|value| (value, block.bytes))
                .map_err(RegisterFailure::from),
            Err(err) => Err(RegisterFailure::from(err)),
        };
        match outcome {
            Ok((value, raw)) => {
                debug!(
                    "Sensor {}: {} @0x{:04X} = {}",
                    sensor_id, spec.name, spec.address, value
                );
                fields.insert(
                    &spec.name,
                    DecodedField {
                        value: Some(value),
                        raw,
                        fallback: false,
                    },
                );
            }
            Err(err) if spec.optional => {
                warn!(
                    "Sensor {}: optional register {} failed ({}), using {:?}",
                    sensor_id, spec.name, err, spec.fallback
                );
                fields.insert(
                    &spec.name,
                    DecodedField {
                        value: spec.fallback,
                        raw: Vec::new(),
                        fallback: true,
                    },
                );
            }
            Err(err) => {
                error!(
                    "Sensor {}: mandatory register {} failed: {}",
                    sensor_id, spec.name, err
                );
                return Err(DriverError::MandatoryRegisterFailed {
                    register: spec.name.clone(),
                    source: err,
                });
            }
        }
    }
    Ok(fields)
}

/// Apply the sensor's register overrides to a driver default
pub(crate) fn resolve_register(sensor: &SensorDefinition, default: RegisterSpec) -> RegisterSpec {
    let Some(over) = sensor.registers.get(&default.name) else {
        return default;
    };
    let mut spec = default;
    if let Some(address) = over.address {
        spec.address = address;
    }
    if let Some(data_type) = over.data_type {
        spec.data_type = data_type;
        spec.count = data_type.register_count();
    }
    if let Some(count) = over.count {
        spec.count = count;
    }
    if let Some(byte_order) = over.byte_order {
        spec.byte_order = byte_order;
    }
    spec
}

/// Delay before a step: the sensor's uniform override or the driver default
pub(crate) fn step_delay(sensor: &SensorDefinition, default: Duration) -> Duration {
    sensor
        .step_delay_ms
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Flag every optional register that fell back
pub(crate) fn flag_fallbacks(reading: &mut Reading, fields: &DecodedFields) {
    let names: Vec<String> = fields.fallbacks().map(str::to_string).collect();
    for name in names {
        reading.set(&format!("{name}_fallback"), true);
    }
}

/// Closed set of supported sensor families
#[derive(Debug, Clone, PartialEq)]
pub enum SensorDriver {
    Ph(PhDriver),
    Turbidity(TurbidityDriver),
    Flow(FlowDriver),
    Radar(RadarDriver),
}

impl SensorDriver {
    /// Build the driver for `sensor`, `None` for unsupported kinds
    pub fn for_sensor(sensor: &SensorDefinition) -> Option<Self> {
        let driver = match sensor.kind {
            SensorKind::Ph => SensorDriver::Ph(PhDriver::new(sensor)),
            SensorKind::Turbidity => SensorDriver::Turbidity(TurbidityDriver::new(sensor)),
            SensorKind::Flow => SensorDriver::Flow(FlowDriver::new(sensor)),
            SensorKind::Radar => SensorDriver::Radar(RadarDriver::new(sensor)),
            SensorKind::Unsupported => return None,
        };
        let steps = driver.steps();
        for name in sensor.registers.keys() {
            if !steps.iter().any(|s| &s.spec.name == name) {
                warn!(
                    "Sensor {}: ignoring override for unknown register {}",
                    sensor.id, name
                );
            }
        }
        Some(driver)
    }

    pub fn kind(&self) -> SensorKind {
        match self {
            SensorDriver::Ph(_) => SensorKind::Ph,
            SensorDriver::Turbidity(_) => SensorKind::Turbidity,
            SensorDriver::Flow(_) => SensorKind::Flow,
            SensorDriver::Radar(_) => SensorKind::Radar,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorDriver::Ph(_) => ph::UNIT,
            SensorDriver::Turbidity(_) => turbidity::UNIT,
            SensorDriver::Flow(_) => flow::DEFAULT_UNIT,
            SensorDriver::Radar(_) => radar::UNIT,
        }
    }

    /// Ordered register reads
    pub fn steps(&self) -> Vec<ReadStep> {
        match self {
            SensorDriver::Ph(d) => d.steps(),
            SensorDriver::Turbidity(d) => d.steps(),
            SensorDriver::Flow(d) => d.steps(),
            SensorDriver::Radar(d) => d.steps(),
        }
    }

    /// Turn decoded fields into a reading
    pub fn compute(&self, sensor_id: &str, fields: &DecodedFields) -> Result<Reading, DriverError> {
        let mut reading = match self {
            SensorDriver::Ph(d) => d.compute(sensor_id, fields)?,
            SensorDriver::Turbidity(d) => d.compute(sensor_id, fields)?,
            SensorDriver::Flow(d) => d.compute(sensor_id, fields)?,
            SensorDriver::Radar(d) => d.compute(sensor_id, fields)?,
        };
        flag_fallbacks(&mut reading, fields);
        Ok(reading)
    }

    /// Execute the plan on `session` and compute the reading. Failures come
    /// back as a reading with quality `bad`.
    pub async fn read(&self, sensor_id: &str, session: &mut BusSession<'_>) -> Reading {
        let result = match execute_plan(session, sensor_id, &self.steps()).await {
            Ok(fields) => self.compute(sensor_id, &fields),
            Err(err) => Err(err),
        };
        match result {
            Ok(reading) => reading,
            Err(err) => self.failed(sensor_id, &err),
        }
    }

    /// Reading reporting `err`
    pub fn failed(&self, sensor_id: &str, err: &DriverError) -> Reading {
        Reading::bad(sensor_id, self.kind(), self.unit(), err.to_reading_error())
    }
}
