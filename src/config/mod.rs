// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration management for the acquisition gateway
//!
//! This module provides functionality for loading, validating, and applying
//! configuration settings. The configuration is backed by a YAML file and
//! validated against a JSON schema before it is deserialized.
//!
//! ## Configuration Structure
//!
//! - `rs485`: serial settings of the RS485 adapter
//! - `acquisition`: engine timing (debounce, tick, deadlines) and simulation mode
//! - `sensors`: one entry per sensor on the bus
//!
//! Values are overridden in this order: file, `RS485_*` environment
//! variables, command line flags.
//!
//! ## Usage
//!
//! ```no_run
//! use rs485_acquisition::config::Config;
//!
//! // Load config from file, creates a default if not found
//! let mut config = Config::from_file("config.yaml").unwrap();
//! config.rs485.apply_env();
//! config.apply_args(Some("/dev/ttyUSB0".to_string()), None, Some(250), false);
//! println!("Polling {} sensors on {}", config.sensors.len(), config.rs485.port);
//! ```

pub mod engine;
pub mod link;
pub mod sensor;
mod utils;

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

pub use engine::EngineConfig;
pub use link::Rs485Config;
pub use sensor::{
    Calibration, ConfigError, ContainerGeometry, RegisterOverride, ResolvedGeometry,
    SensorDefinition, SensorKind,
};
pub use utils::{output_config_schema, validate_specific_rules};

/// Root configuration of the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Serial link settings. Defaults to 9600-8-N-1 on `/dev/ttyS0`.
    #[serde(default)]
    pub rs485: Rs485Config,

    /// Engine timing parameters
    #[serde(default)]
    pub acquisition: EngineConfig,

    /// Sensors attached to the bus
    #[serde(default)]
    pub sensors: Vec<SensorDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        let mut turbidity = SensorDefinition::new("turbidity_1", SensorKind::Turbidity, 2);
        turbidity.name = Some("Outlet turbidity".to_string());
        let mut radar = SensorDefinition::new("radar_1", SensorKind::Radar, 4);
        radar.name = Some("Buffer tank level".to_string());
        radar.container_geometry = Some(ContainerGeometry::default());
        Self {
            rs485: Rs485Config::default(),
            acquisition: EngineConfig::default(),
            sensors: vec![
                SensorDefinition::new("ph_1", SensorKind::Ph, 1),
                turbidity,
                SensorDefinition::new("flow_1", SensorKind::Flow, 3),
                radar,
            ],
        }
    }
}

impl Config {
    /// Write a `*.sample.yaml` next to `path` holding the default configuration
    fn create_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let sample_path = path.with_extension("sample.yaml");
        debug!("Creating sample configuration file at {:?}", sample_path);

        if let Some(parent) = sample_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Failed to create parent directory for sample config at {:?}",
                        parent
                    )
                })?;
            }
        }

        Self::default()
            .save_to_file(&sample_path)
            .with_context(|| format!("Failed to save sample config to {:?}", sample_path))?;

        error!(
            "Sample configuration file created at {:?}\nPlease edit and rename it",
            sample_path
        );
        Ok(())
    }

    /// Load configuration from a file
    ///
    /// A missing file is created with the default configuration. A file that
    /// fails schema validation, deserialization or the specific rules leaves a
    /// sample next to it and returns an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, creating default",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        let yaml_value: serde_yml::Value = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML configuration from {:?}", path))?;

        let json_value = serde_json::to_value(&yaml_value).with_context(|| {
            format!("Failed to convert YAML to JSON for validation: {:?}", path)
        })?;

        let schema_str = include_str!("../../resources/config.schema.json");
        let schema: serde_json::Value =
            serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;

        let validator = jsonschema::draft202012::options()
            .should_validate_formats(true)
            .build(&schema)?;

        debug!("Validating {} configuration against schema", path.display());
        if let Err(error) = validator.validate(&json_value) {
            error!("Configuration validation error before deserialization");
            Self::create_sample_config(path)?;
            anyhow::bail!("Configuration validation failed: {}", error);
        }

        let config: Config = match serde_yml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                error!("Configuration deserialization error: {}", err);
                if let Err(e) = Self::create_sample_config(path) {
                    error!("Failed to create sample config: {}", e);
                }
                return Err(anyhow::anyhow!(
                    "Failed to deserialize configuration from {}: {}",
                    path.display(),
                    err
                ));
            }
        };

        if let Err(err) = validate_specific_rules(&config) {
            error!("Configuration specific validation error: {}", err);
            Self::create_sample_config(path)?;
            return Err(err);
        }

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;

        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create config file at {:?}", path.as_ref()))?;

        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply command line arguments on top of the file and environment values
    ///
    /// # Parameters
    ///
    /// * `rs485_port` - Serial device path
    /// * `baudrate` - Serial baud rate
    /// * `debounce_ms` - Minimum idle time between bus transactions
    /// * `simulate` - If true, forces the simulated bus
    pub fn apply_args(
        &mut self,
        rs485_port: Option<String>,
        baudrate: Option<u32>,
        debounce_ms: Option<u64>,
        simulate: bool,
    ) {
        if let Some(port) = rs485_port {
            debug!("Overriding RS485 port with command line value: {}", port);
            self.rs485.port = port;
        }
        if let Some(baudrate) = baudrate {
            debug!("Overriding baud rate with command line value: {}", baudrate);
            self.rs485.baudrate = baudrate;
        }
        if let Some(debounce_ms) = debounce_ms {
            debug!("Overriding debounce window with command line value: {} ms", debounce_ms);
            self.acquisition.debounce_ms = debounce_ms;
        }
        if simulate {
            debug!("Simulated bus requested on command line");
            self.acquisition.simulate = true;
        }
    }

    /// Enabled sensors, in configuration order
    pub fn enabled_sensors(&self) -> impl Iterator<Item = &SensorDefinition> {
        self.sensors.iter().filter(|s| s.enabled)
    }
}
