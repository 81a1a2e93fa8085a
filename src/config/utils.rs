// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration utilities
//!
//! This module provides utility functions for working with configuration
//! settings, including validation and schema management.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::HashSet;

use super::{Config, SensorKind};

/// Output the embedded JSON schema to the console.
///
/// This function is called when the `--show-config-schema` flag is provided
/// on the command line.
///
/// # Example
///
/// ```bash
/// ./rs485_acquisition --show-config-schema > config_schema.json
/// ```
pub fn output_config_schema() -> Result<()> {
    let schema_str = include_str!("../../resources/config.schema.json");
    let schema: serde_json::Value =
        serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;
    let formatted_schema =
        serde_json::to_string_pretty(&schema).context("Failed to format JSON schema")?;
    println!("{}", formatted_schema);
    Ok(())
}

/// Validates the configuration against rules the JSON schema cannot express.
///
/// # Validation Rules
///
/// - **Serial settings**: baud rate above zero, 5 to 8 data bits, parity `N`/`E`/`O`,
///   1 or 2 stop bits
/// - **Sensor identity**: ids are non-empty and unique
/// - **Slave address**: within the Modbus range 1 to 247
///
/// Unsupported sensor kinds and geometry problems are only reported, they
/// never fail validation.
pub fn validate_specific_rules(config: &Config) -> Result<()> {
    debug!("Performing additional validation checks");

    let rs485 = &config.rs485;
    if rs485.baudrate == 0 {
        anyhow::bail!("Invalid baud rate: {}", rs485.baudrate);
    }
    if !(5..=8).contains(&rs485.data_bits) {
        anyhow::bail!("Invalid data bits: {}", rs485.data_bits);
    }
    if !matches!(rs485.parity.as_str(), "N" | "E" | "O") {
        anyhow::bail!("Invalid parity: {:?}, expected N, E or O", rs485.parity);
    }
    if !(1..=2).contains(&rs485.stop_bits) {
        anyhow::bail!("Invalid stop bits: {}", rs485.stop_bits);
    }

    let mut ids = HashSet::new();
    for sensor in &config.sensors {
        if sensor.id.trim().is_empty() {
            anyhow::bail!("Sensor id must not be empty");
        }
        if !ids.insert(sensor.id.as_str()) {
            anyhow::bail!("Duplicate sensor id: {}", sensor.id);
        }
        if !(1..=247).contains(&sensor.slave_address) {
            anyhow::bail!(
                "Sensor {}: slave address {} outside 1..=247",
                sensor.id,
                sensor.slave_address
            );
        }
        if sensor.kind == SensorKind::Unsupported {
            warn!("Sensor {} has an unsupported kind and will be skipped", sensor.id);
        }
        if sensor.container_geometry.is_some() && sensor.kind != SensorKind::Radar {
            debug!("Sensor {}: container geometry ignored for {}", sensor.id, sensor.kind);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorDefinition;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_specific_rules(&Config::default()).is_ok());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = Config::default();
        config.sensors.push(SensorDefinition::new("ph_1", SensorKind::Ph, 9));
        let err = validate_specific_rules(&config).unwrap_err();
        assert!(err.to_string().contains("Duplicate sensor id"));
    }

    #[test]
    fn test_slave_address_range() {
        let mut config = Config::default();
        config.sensors = vec![SensorDefinition::new("a", SensorKind::Ph, 0)];
        assert!(validate_specific_rules(&config).is_err());
        config.sensors = vec![SensorDefinition::new("a", SensorKind::Ph, 248)];
        assert!(validate_specific_rules(&config).is_err());
    }

    #[test]
    fn test_serial_settings() {
        let mut config = Config::default();
        config.rs485.parity = "X".to_string();
        assert!(validate_specific_rules(&config).is_err());
        let mut config = Config::default();
        config.rs485.stop_bits = 3;
        assert!(validate_specific_rules(&config).is_err());
    }
}
