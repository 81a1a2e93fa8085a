// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! RS485 serial link configuration

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Serial settings of the RS485 adapter
///
/// The defaults match the factory settings of the field sensors:
/// 9600 baud, 8 data bits, no parity, 1 stop bit and a 1 s response timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rs485Config {
    /// Serial device path, e.g. `/dev/ttyS0` or `/dev/ttyUSB0`
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Data bits, 5 to 8
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Parity: `N`, `E` or `O`
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits, 1 or 2
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Response timeout for one transaction in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_port() -> String {
    "/dev/ttyS0".to_string()
}

fn default_baudrate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for Rs485Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            baudrate: default_baudrate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", name, raw);
            None
        }
    }
}

impl Rs485Config {
    /// Apply `RS485_*` environment variables on top of the file values
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup. Unparsable values are
    /// logged and ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("RS485_PORT") {
            if !port.trim().is_empty() {
                debug!("RS485_PORT overrides port: {}", port);
                self.port = port.trim().to_string();
            }
        }
        if let Some(value) = lookup("RS485_BAUDRATE").and_then(|v| parse_env("RS485_BAUDRATE", &v)) {
            debug!("RS485_BAUDRATE overrides baudrate: {}", value);
            self.baudrate = value;
        }
        if let Some(value) = lookup("RS485_DATABITS").and_then(|v| parse_env("RS485_DATABITS", &v)) {
            debug!("RS485_DATABITS overrides data bits: {}", value);
            self.data_bits = value;
        }
        if let Some(parity) = lookup("RS485_PARITY") {
            let parity = parity.trim().to_ascii_uppercase();
            if matches!(parity.as_str(), "N" | "E" | "O") {
                debug!("RS485_PARITY overrides parity: {}", parity);
                self.parity = parity;
            } else {
                warn!("Ignoring RS485_PARITY={:?}: expected N, E or O", parity);
            }
        }
        if let Some(value) = lookup("RS485_STOPBITS").and_then(|v| parse_env("RS485_STOPBITS", &v)) {
            debug!("RS485_STOPBITS overrides stop bits: {}", value);
            self.stop_bits = value;
        }
        if let Some(value) =
            lookup("RS485_TIMEOUT_MS").and_then(|v| parse_env("RS485_TIMEOUT_MS", &v))
        {
            debug!("RS485_TIMEOUT_MS overrides timeout: {} ms", value);
            self.timeout_ms = value;
        }
    }
}
