// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Bus arbitration
//!
//! Every sensor on a physical RS485 line goes through one [`BusArbiter`]. The
//! arbiter owns the [`LinkTransport`] and the [`BusState`] and guarantees:
//! - one register transaction on the wire at any instant
//! - a minimum idle time (debounce window) between the end of a transaction
//!   and the start of the next, whichever sensor issues it
//! - a sensor's register sequence runs without interleaving, because a
//!   [`BusSession`] keeps the lock from the first step to the last
//! - the target slave address is bound to the session, so selecting the slave
//!   and performing the read can never be split by another sensor
//!
//! Recovery is bounded: a session may re-open the link at most once and then
//! retries the failed transaction once.

use crate::decoder::{RawRegisterBlock, RegisterSpec};
use crate::link::{LinkError, LinkTransport};
use log::{debug, error, info, warn};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// Shared state of one physical bus
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusState {
    /// Reflects the last open/transaction outcome, not just a past open
    pub connected: bool,
    /// Completion time of the last transaction
    pub last_transaction: Option<Instant>,
    pub transactions: u64,
    pub failures: u64,
    pub reopens: u64,
}

struct BusInner {
    link: Box<dyn LinkTransport>,
    state: BusState,
    /// Set while a transaction is on the wire; still set if it was abandoned
    dirty: bool,
}

enum Request<'a> {
    Read { address: u16, count: u16 },
    Write { address: u16, bytes: &'a [u8] },
}

/// Serializes and paces access to one link transport
pub struct BusArbiter {
    inner: Mutex<BusInner>,
    snapshot: StdMutex<BusState>,
    debounce: Duration,
}

impl BusArbiter {
    /// Create an arbiter owning `link`. The link is opened lazily by the first session.
    pub fn new(link: Box<dyn LinkTransport>, debounce: Duration) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                link,
                state: BusState::default(),
                dirty: false,
            }),
            snapshot: StdMutex::new(BusState::default()),
            debounce,
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Wait for exclusive use of the bus and bind it to `slave`
    pub async fn acquire(&self, slave: u8) -> BusSession<'_> {
        let guard = self.inner.lock().await;
        debug!("Bus acquired for slave {}", slave);
        BusSession {
            arbiter: self,
            guard,
            slave,
            open_attempted: false,
        }
    }

    /// Snapshot of the bus state
    pub fn state(&self) -> BusState {
        match self.snapshot.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Close the link once no session is active
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.link.is_open() {
            inner.link.close().await;
        }
        inner.state.connected = false;
        inner.dirty = false;
        self.publish(&inner.state);
        info!("Bus closed ({})", inner.link.describe());
    }

    fn publish(&self, state: &BusState) {
        match self.snapshot.lock() {
            Ok(mut snapshot) => *snapshot = state.clone(),
            Err(poisoned) => *poisoned.into_inner() = state.clone(),
        }
    }
}

/// Exclusive use of the bus for one sensor's register sequence
pub struct BusSession<'a> {
    arbiter: &'a BusArbiter,
    guard: MutexGuard<'a, BusInner>,
    slave: u8,
    open_attempted: bool,
}

impl BusSession<'_> {
    /// Slave address every transaction of this session targets
    pub fn slave(&self) -> u8 {
        self.slave
    }

    /// Read the registers described by `spec`
    pub async fn read(&mut self, spec: &RegisterSpec) -> Result<RawRegisterBlock, LinkError> {
        let bytes = self.read_registers(spec.address, spec.count).await?;
        Ok(RawRegisterBlock {
            spec: spec.clone(),
            bytes,
        })
    }

    pub async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u8>, LinkError> {
        self.run(Request::Read { address, count }).await
    }

    pub async fn write_registers(&mut self, address: u16, bytes: &[u8]) -> Result<(), LinkError> {
        self.run(Request::Write { address, bytes }).await.map(|_| ())
    }

    async fn run(&mut self, request: Request<'_>) -> Result<Vec<u8>, LinkError> {
        self.ensure_open().await?;
        match self.transact(&request).await {
            Err(err) if err.needs_reopen() && !self.open_attempted => {
                warn!(
                    "Bus transaction for slave {} failed ({}), re-opening link",
                    self.slave, err
                );
                self.guard.state.reopens += 1;
                self.reopen().await?;
                self.transact(&request).await
            }
            other => other,
        }
    }

    /// Recover from an abandoned transaction, then open lazily if needed
    async fn ensure_open(&mut self) -> Result<(), LinkError> {
        if self.guard.dirty {
            warn!("Previous bus transaction was abandoned, resetting link");
            self.guard.link.close().await;
            self.guard.dirty = false;
            self.guard.state.connected = false;
        }
        if self.guard.link.is_open() {
            return Ok(());
        }
        if self.open_attempted {
            return Err(LinkError::NotOpen);
        }
        self.reopen().await
    }

    async fn reopen(&mut self) -> Result<(), LinkError> {
        self.open_attempted = true;
        let result = self.guard.link.open().await;
        self.guard.state.connected = result.is_ok();
        self.arbiter.publish(&self.guard.state);
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("Unable to open {}: {}", self.guard.link.describe(), err);
                Err(LinkError::NotOpen)
            }
        }
    }

    async fn transact(&mut self, request: &Request<'_>) -> Result<Vec<u8>, LinkError> {
        if let Some(last) = self.guard.state.last_transaction {
            let elapsed = last.elapsed();
            if elapsed < self.arbiter.debounce {
                tokio::time::sleep(self.arbiter.debounce - elapsed).await;
            }
        }

        let slave = self.slave;
        let inner = &mut *self.guard;
        inner.dirty = true;
        let result = match request {
            Request::Read { address, count } => {
                inner.link.read_registers(slave, *address, *count).await
            }
            Request::Write { address, bytes } => inner
                .link
                .write_registers(slave, *address, bytes)
                .await
                .map(|_| Vec::new()),
        };
        inner.dirty = false;
        inner.state.last_transaction = Some(Instant::now());
        inner.state.transactions += 1;
        match &result {
            Ok(_) => inner.state.connected = true,
            Err(err) => {
                inner.state.failures += 1;
                if err.needs_reopen() {
                    inner.state.connected = false;
                }
                debug!("Transaction on slave {} failed: {}", slave, err);
            }
        }
        self.arbiter.publish(&inner.state);
        result
    }
}
