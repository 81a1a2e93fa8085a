// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Acquisition engine timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and queueing parameters of the acquisition engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum idle time between two bus transactions in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Scheduler tick period in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Deadline of one sensor read, counted from bus acquisition
    #[serde(default = "default_read_deadline_ms")]
    pub read_deadline_ms: u64,

    /// Time given to in-flight reads at shutdown before they are aborted
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Capacity of the telemetry sink queue
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,

    /// Interval of the bus state heartbeat log in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Use the in-memory simulated bus instead of the serial port
    #[serde(default)]
    pub simulate: bool,
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_read_deadline_ms() -> u64 {
    5000
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_sink_capacity() -> usize {
    100
}

fn default_heartbeat_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            tick_ms: default_tick_ms(),
            read_deadline_ms: default_read_deadline_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            sink_capacity: default_sink_capacity(),
            heartbeat_secs: default_heartbeat_secs(),
            simulate: false,
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}
