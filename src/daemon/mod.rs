// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Daemon Module
//!
//! The daemon module runs and manages the background services of the gateway:
//! the polling scheduler, the telemetry sink consumer and the bus heartbeat.
//!
//! ## Components
//!
//! * **Launch Daemon**: Core implementation for starting, monitoring, and gracefully
//!   shutting down background tasks
//!
//! ## Usage
//!
//! ```no_run
//! use rs485_acquisition::{config::Config, daemon::launch_daemon::Daemon};
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml")?;
//!
//!     let mut daemon = Daemon::new();
//!     daemon.launch(&config).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     daemon.shutdown();
//!     daemon.join().await?;
//!     Ok(())
//! }
//! ```

pub mod launch_daemon;
