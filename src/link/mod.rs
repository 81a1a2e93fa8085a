// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Link transport
//!
//! This module owns the physical connection to the RS485 bus. It provides:
//! - The [`LinkTransport`] trait used by the bus arbiter
//! - A Modbus RTU implementation over a serial port ([`rtu::RtuTransport`])
//! - An in-memory bus for tests and `--simulate` mode ([`simulated::SimulatedTransport`])
//!
//! Implementations are never shared directly between tasks: the
//! [`crate::bus::BusArbiter`] owns the single instance and serializes every call.

pub mod rtu;
pub mod simulated;

use thiserror::Error;

/// Errors reported by a link transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link is not open")]
    NotOpen,
    #[error("no response before timeout")]
    Timeout,
    #[error("I/O failure: {0}")]
    IoFailure(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl LinkError {
    /// Stable identifier used in error records
    pub fn kind(&self) -> &'static str {
        match self {
            LinkError::NotOpen => "not_open",
            LinkError::Timeout => "timeout",
            LinkError::IoFailure(_) => "io_failure",
            LinkError::MalformedResponse(_) => "malformed_response",
        }
    }

    /// Whether the arbiter should try to re-open the link after this error
    pub fn needs_reopen(&self) -> bool {
        matches!(self, LinkError::NotOpen | LinkError::IoFailure(_))
    }
}

/// Register-level access to a serial bus
///
/// Calls take `&mut self`: a transport never runs two transactions at once.
#[async_trait::async_trait]
pub trait LinkTransport: Send {
    /// Open (or re-open) the underlying connection
    async fn open(&mut self) -> Result<(), LinkError>;

    /// Read `count` holding registers starting at `address` on `slave`.
    /// Returns the register words as big-endian bytes, two per register.
    async fn read_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u8>, LinkError>;

    /// Write big-endian register words starting at `address` on `slave`
    async fn write_registers(&mut self, slave: u8, address: u16, bytes: &[u8])
        -> Result<(), LinkError>;

    /// Close the connection. Closing a closed link is a no-op.
    async fn close(&mut self);

    /// Whether the connection is currently open
    fn is_open(&self) -> bool;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(LinkError::NotOpen.kind(), "not_open");
        assert_eq!(LinkError::Timeout.kind(), "timeout");
        assert_eq!(LinkError::IoFailure("x".into()).kind(), "io_failure");
        assert_eq!(LinkError::MalformedResponse("x".into()).kind(), "malformed_response");
    }

    #[test]
    fn test_reopen_policy() {
        assert!(LinkError::NotOpen.needs_reopen());
        assert!(LinkError::IoFailure("broken pipe".into()).needs_reopen());
        assert!(!LinkError::Timeout.needs_reopen());
        assert!(!LinkError::MalformedResponse("crc".into()).needs_reopen());
    }
}
