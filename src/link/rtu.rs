// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus RTU link over a serial port
//!
//! Wraps a `tokio-serial` stream with the `tokio-modbus` RTU client. The slave
//! address is set on the client context immediately before each request while
//! `&mut self` is held, so selection and transaction cannot be separated.

use super::{LinkError, LinkTransport};
use crate::config::Rs485Config;
use crate::decoder::{bytes_to_words, words_to_bytes};
use log::{debug, info, warn};
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

/// Serial Modbus RTU transport
pub struct RtuTransport {
    config: Rs485Config,
    ctx: Option<Context>,
}

impl RtuTransport {
    /// Create a transport for the given serial settings. The port is not
    /// opened until [`LinkTransport::open`] is called.
    pub fn new(config: Rs485Config) -> Self {
        Self { config, ctx: None }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn context(&mut self) -> Result<&mut Context, LinkError> {
        self.ctx.as_mut().ok_or(LinkError::NotOpen)
    }
}

fn data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn parity(parity: &str) -> Parity {
    match parity {
        "E" | "e" => Parity::Even,
        "O" | "o" => Parity::Odd,
        _ => Parity::None,
    }
}

fn stop_bits(bits: u8) -> StopBits {
    if bits == 2 {
        StopBits::Two
    } else {
        StopBits::One
    }
}

fn map_modbus_error(err: tokio_modbus::Error) -> LinkError {
    match err {
        tokio_modbus::Error::Transport(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            LinkError::Timeout
        }
        tokio_modbus::Error::Transport(io) => LinkError::IoFailure(io.to_string()),
        other => LinkError::MalformedResponse(other.to_string()),
    }
}

fn map_exception(code: ExceptionCode) -> LinkError {
    LinkError::MalformedResponse(format!("exception response: {code}"))
}

#[async_trait::async_trait]
impl LinkTransport for RtuTransport {
    async fn open(&mut self) -> Result<(), LinkError> {
        // Drop any previous handle first so the port is released
        self.ctx = None;
        let builder = tokio_serial::new(&self.config.port, self.config.baudrate)
            .data_bits(data_bits(self.config.data_bits))
            .parity(parity(&self.config.parity))
            .stop_bits(stop_bits(self.config.stop_bits))
            .timeout(self.timeout());
        let stream = builder
            .open_native_async()
            .map_err(|e| LinkError::IoFailure(format!("{}: {}", self.config.port, e)))?;
        self.ctx = Some(rtu::attach(stream));
        info!("Opened RS485 link {}", self.describe());
        Ok(())
    }

    async fn read_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u8>, LinkError> {
        let timeout = self.timeout();
        let ctx = self.context()?;
        ctx.set_slave(Slave(slave));
        let words = tokio::time::timeout(timeout, ctx.read_holding_registers(address, count))
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(map_modbus_error)?
            .map_err(map_exception)?;
        if words.len() != usize::from(count) {
            return Err(LinkError::MalformedResponse(format!(
                "expected {} registers, got {}",
                count,
                words.len()
            )));
        }
        debug!(
            "RTU read slave={} address=0x{:04X} count={} -> {:04X?}",
            slave, address, count, words
        );
        Ok(words_to_bytes(&words))
    }

    async fn write_registers(
        &mut self,
        slave: u8,
        address: u16,
        bytes: &[u8],
    ) -> Result<(), LinkError> {
        let words = bytes_to_words(bytes).map_err(|e| LinkError::MalformedResponse(e.to_string()))?;
        let timeout = self.timeout();
        let ctx = self.context()?;
        ctx.set_slave(Slave(slave));
        let result = match words.as_slice() {
            [] => return Ok(()),
            [word] => tokio::time::timeout(timeout, ctx.write_single_register(address, *word)).await,
            _ => tokio::time::timeout(timeout, ctx.write_multiple_registers(address, &words)).await,
        };
        result
            .map_err(|_| LinkError::Timeout)?
            .map_err(map_modbus_error)?
            .map_err(map_exception)?;
        debug!(
            "RTU write slave={} address=0x{:04X} words={:04X?}",
            slave, address, words
        );
        Ok(())
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            info!("Closed RS485 link {}", self.describe());
        } else {
            warn!("Close requested on RS485 link {} which is not open", self.config.port);
        }
    }

    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    fn describe(&self) -> String {
        format!(
            "{} {}-{}{}{} timeout={}ms",
            self.config.port,
            self.config.baudrate,
            self.config.data_bits,
            self.config.parity,
            self.config.stop_bits,
            self.config.timeout_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_settings_mapping() {
        assert_eq!(data_bits(7), DataBits::Seven);
        assert_eq!(data_bits(8), DataBits::Eight);
        assert_eq!(parity("E"), Parity::Even);
        assert_eq!(parity("O"), Parity::Odd);
        assert_eq!(parity("N"), Parity::None);
        assert_eq!(stop_bits(2), StopBits::Two);
        assert_eq!(stop_bits(1), StopBits::One);
    }

    #[test]
    fn test_describe_default_settings() {
        let transport = RtuTransport::new(Rs485Config::default());
        assert_eq!(transport.describe(), "/dev/ttyS0 9600-8N1 timeout=1000ms");
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_read_without_open_is_not_open() {
        let mut transport = RtuTransport::new(Rs485Config::default());
        let err = transport.read_registers(1, 0x0001, 1).await.unwrap_err();
        assert_eq!(err, LinkError::NotOpen);
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut transport = RtuTransport::new(Rs485Config {
            port: "/dev/does-not-exist-rs485".to_string(),
            ..Rs485Config::default()
        });
        let err = transport.open().await.unwrap_err();
        assert_eq!(err.kind(), "io_failure");
        assert!(!transport.is_open());
    }
}
