// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Acquisition engine for Modbus RTU sensors sharing one RS485 bus
//!
//! Data flows from the [`scheduler`] (timer tick) through a read task per due
//! sensor, which acquires the [`bus`] arbiter, performs register transactions
//! on the [`link`] transport, decodes them with the [`decoder`] and turns them
//! into a [`reading::Reading`] with the sensor's [`drivers`] entry. Results
//! leave through the [`sink`].

pub mod bus;
pub mod config;
pub mod daemon;
pub mod decoder;
pub mod drivers;
pub mod link;
pub mod reading;
pub mod scheduler;
pub mod sink;
