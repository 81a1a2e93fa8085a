// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Simulated RS485 bus
//!
//! An in-memory Modbus bus used by the test-suite and by `--simulate` mode.
//! The simulation includes:
//! - A holding register map per slave address
//! - Configurable response latency, globally or per slave
//! - Failure injection for open, I/O and per-register errors
//! - A transaction journal with overlap detection
//!
//! Clones share the same bus, so a test can keep a handle for inspection while
//! the arbiter owns the transport.

use super::{LinkError, LinkTransport};
use crate::decoder::{bytes_to_words, words_to_bytes};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Kind of recorded transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// One transaction as seen on the simulated wire
#[derive(Debug, Clone)]
pub struct Transaction {
    pub operation: Operation,
    pub slave: u8,
    pub address: u16,
    pub count: u16,
    pub started: Instant,
    pub finished: Instant,
    pub ok: bool,
}

#[derive(Default)]
struct BusModel {
    open: bool,
    registers: HashMap<(u8, u16), u16>,
    latency: Duration,
    slave_latency: HashMap<u8, Duration>,
    open_failures: u32,
    open_calls: u32,
    queued_failures: VecDeque<LinkError>,
    register_failures: HashMap<(u8, u16), LinkError>,
    journal: Vec<Transaction>,
    in_flight: u32,
    overlaps: u32,
}

/// Handle on a simulated bus
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    model: Arc<Mutex<BusModel>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&self) -> MutexGuard<'_, BusModel> {
        // A panic while holding the lock only happens in a failing test
        match self.model.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Set the value of one holding register
    pub fn set_register(&self, slave: u8, address: u16, value: u16) {
        self.model().registers.insert((slave, address), value);
    }

    /// Set consecutive holding registers starting at `address`
    pub fn set_registers(&self, slave: u8, address: u16, values: &[u16]) {
        let mut model = self.model();
        for (offset, value) in values.iter().enumerate() {
            model
                .registers
                .insert((slave, address.wrapping_add(offset as u16)), *value);
        }
    }

    pub fn register(&self, slave: u8, address: u16) -> Option<u16> {
        self.model().registers.get(&(slave, address)).copied()
    }

    /// Response latency applied to every transaction
    pub fn set_latency(&self, latency: Duration) {
        self.model().latency = latency;
    }

    /// Response latency for one slave, overriding the global one
    pub fn set_slave_latency(&self, slave: u8, latency: Duration) {
        self.model().slave_latency.insert(slave, latency);
    }

    /// Make the next `count` calls to `open` fail
    pub fn fail_next_opens(&self, count: u32) {
        self.model().open_failures = count;
    }

    /// Queue an error returned by the next transaction, whatever its target
    pub fn fail_next_transaction(&self, error: LinkError) {
        self.model().queued_failures.push_back(error);
    }

    /// Make every transaction touching `address` on `slave` fail
    pub fn fail_register(&self, slave: u8, address: u16, error: LinkError) {
        self.model().register_failures.insert((slave, address), error);
    }

    pub fn clear_register_failure(&self, slave: u8, address: u16) {
        self.model().register_failures.remove(&(slave, address));
    }

    /// Simulate the adapter being unplugged: the link drops to closed
    pub fn disconnect(&self) {
        self.model().open = false;
    }

    pub fn journal(&self) -> Vec<Transaction> {
        self.model().journal.clone()
    }

    /// Number of transactions that started while another was in flight
    pub fn overlaps(&self) -> u32 {
        self.model().overlaps
    }

    pub fn open_calls(&self) -> u32 {
        self.model().open_calls
    }

    fn begin(&self, slave: u8, address: u16, count: u16) -> Result<Duration, LinkError> {
        let mut model = self.model();
        if !model.open {
            return Err(LinkError::NotOpen);
        }
        if model.in_flight > 0 {
            model.overlaps += 1;
        }
        model.in_flight += 1;
        debug!(
            "Simulated transaction slave={} address=0x{:04X} count={}",
            slave, address, count
        );
        Ok(model
            .slave_latency
            .get(&slave)
            .copied()
            .unwrap_or(model.latency))
    }

    fn finish(
        &self,
        operation: Operation,
        slave: u8,
        address: u16,
        count: u16,
        started: Instant,
    ) -> Result<(), LinkError> {
        let mut model = self.model();
        model.in_flight = model.in_flight.saturating_sub(1);
        let mut outcome = match model.queued_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        if outcome.is_ok() {
            for offset in 0..count {
                if let Some(err) = model
                    .register_failures
                    .get(&(slave, address.wrapping_add(offset)))
                {
                    outcome = Err(err.clone());
                    break;
                }
            }
        }
        if !model.open && outcome.is_ok() {
            outcome = Err(LinkError::NotOpen);
        }
        if matches!(outcome, Err(LinkError::IoFailure(_))) {
            model.open = false;
        }
        model.journal.push(Transaction {
            operation,
            slave,
            address,
            count,
            started,
            finished: Instant::now(),
            ok: outcome.is_ok(),
        });
        outcome
    }
}

/// Guard keeping the in-flight counter right when a transaction future is dropped
struct InFlight<'a> {
    transport: &'a SimulatedTransport,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut model = self.transport.model();
            model.in_flight = model.in_flight.saturating_sub(1);
        }
    }
}

#[async_trait::async_trait]
impl LinkTransport for SimulatedTransport {
    async fn open(&mut self) -> Result<(), LinkError> {
        let mut model = self.model();
        model.open_calls += 1;
        if model.open_failures > 0 {
            model.open_failures -= 1;
            model.open = false;
            return Err(LinkError::IoFailure("simulated open failure".to_string()));
        }
        model.open = true;
        Ok(())
    }

    async fn read_registers(
        &mut self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u8>, LinkError> {
        let started = Instant::now();
        let latency = self.begin(slave, address, count)?;
        let mut guard = InFlight {
            transport: self,
            armed: true,
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard.armed = false;
        self.finish(Operation::Read, slave, address, count, started)?;

        let model = self.model();
        let words = (0..count)
            .map(|offset| {
                model
                    .registers
                    .get(&(slave, address.wrapping_add(offset)))
                    .copied()
                    .ok_or_else(|| {
                        LinkError::MalformedResponse(format!(
                            "exception response: illegal data address 0x{:04X}",
                            address.wrapping_add(offset)
                        ))
                    })
            })
            .collect::<Result<Vec<u16>, LinkError>>()?;
        Ok(words_to_bytes(&words))
    }

    async fn write_registers(
        &mut self,
        slave: u8,
        address: u16,
        bytes: &[u8],
    ) -> Result<(), LinkError> {
        let words =
            bytes_to_words(bytes).map_err(|e| LinkError::MalformedResponse(e.to_string()))?;
        let count = words.len() as u16;
        let started = Instant::now();
        let latency = self.begin(slave, address, count)?;
        let mut guard = InFlight {
            transport: self,
            armed: true,
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard.armed = false;
        self.finish(Operation::Write, slave, address, count, started)?;
        self.set_registers(slave, address, &words);
        Ok(())
    }

    async fn close(&mut self) {
        self.model().open = false;
    }

    fn is_open(&self) -> bool {
        self.model().open
    }

    fn describe(&self) -> String {
        "simulated RS485 bus".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_requires_open() {
        let mut bus = SimulatedTransport::new();
        bus.set_register(1, 0x0001, 700);
        assert_eq!(bus.read_registers(1, 0x0001, 1).await.unwrap_err(), LinkError::NotOpen);
        bus.open().await.unwrap();
        assert_eq!(bus.read_registers(1, 0x0001, 1).await.unwrap(), vec![0x02, 0xBC]);
    }

    #[tokio::test]
    async fn test_missing_register_is_exception() {
        let mut bus = SimulatedTransport::new();
        bus.open().await.unwrap();
        let err = bus.read_registers(9, 0x0100, 2).await.unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
    }

    #[tokio::test]
    async fn test_io_failure_closes_link() {
        let mut bus = SimulatedTransport::new();
        bus.set_register(1, 0x0001, 1);
        bus.open().await.unwrap();
        bus.fail_next_transaction(LinkError::IoFailure("framing".into()));
        assert!(bus.read_registers(1, 0x0001, 1).await.is_err());
        assert!(!bus.is_open());
        assert_eq!(bus.journal().len(), 1);
        assert!(!bus.journal()[0].ok);
    }

    #[tokio::test]
    async fn test_open_failures_are_consumed() {
        let mut bus = SimulatedTransport::new();
        bus.fail_next_opens(1);
        assert!(bus.open().await.is_err());
        assert!(bus.open().await.is_ok());
        assert_eq!(bus.open_calls(), 2);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let mut bus = SimulatedTransport::new();
        bus.open().await.unwrap();
        bus.write_registers(3, 0x1438, &[0x00, 0x01, 0x00, 0x02])
            .await
            .unwrap();
        assert_eq!(bus.register(3, 0x1438), Some(1));
        assert_eq!(bus.register(3, 0x1439), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_handles_record_overlap() {
        let bus = SimulatedTransport::new();
        bus.set_register(1, 0x0001, 1);
        bus.set_register(2, 0x0001, 2);
        bus.set_latency(Duration::from_millis(50));
        let mut a = bus.clone();
        let mut b = bus.clone();
        a.open().await.unwrap();
        let (ra, rb) = tokio::join!(a.read_registers(1, 0x0001, 1), b.read_registers(2, 0x0001, 1));
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(bus.overlaps(), 1);
    }
}
