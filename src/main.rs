// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the RS485 acquisition gateway
use anyhow::Result;
use clap::Parser;
use log::info;
use rs485_acquisition::config::{self, Config};
use rs485_acquisition::daemon::launch_daemon::Daemon;
use std::path::PathBuf;
use tokio::signal;

/// Field gateway polling Modbus RTU sensors on a shared RS485 bus
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the simulated bus instead of the serial port
    #[arg(long)]
    simulate: bool,

    /// Serial device of the RS485 adapter
    #[arg(long)]
    rs485_port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baudrate: Option<u32>,

    /// Minimum idle time between bus transactions in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Path to a configuration to validate and exit
    #[arg(long)]
    validate_config: Option<PathBuf>,

    /// Output the configuration schema as JSON and exit
    #[arg(long)]
    show_config_schema: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.show_config_schema {
        return config::output_config_schema();
    }

    if let Some(validate_path) = args.validate_config {
        if !validate_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                validate_path.display()
            ));
        }
        Config::from_file(&validate_path)
            .map_err(|err| anyhow::anyhow!("Configuration validation failed: {}", err))?;
        println!("Configuration file is valid: {}", validate_path.display());
        return Ok(());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let mut config = Config::from_file(&config_path)?;
    config.rs485.apply_env();
    config.apply_args(
        args.rs485_port.clone(),
        args.baudrate,
        args.debounce_ms,
        args.simulate,
    );
    config::validate_specific_rules(&config)?;

    let mut daemon = Daemon::new();
    daemon.launch(&config).await?;
    info!("Gateway started, press Ctrl+C to stop");

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    daemon.shutdown();
    daemon.join().await?;
    info!("Shutdown complete");
    Ok(())
}
