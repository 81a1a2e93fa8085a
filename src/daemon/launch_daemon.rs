// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::bus::BusArbiter;
use crate::config::{Config, SensorDefinition, SensorKind};
use crate::drivers::SensorDriver;
use crate::link::rtu::RtuTransport;
use crate::link::simulated::SimulatedTransport;
use crate::link::LinkTransport;
use crate::scheduler::Scheduler;
use crate::sink::{SinkMessage, TelemetrySink};

/// Step used by background loops to notice a shutdown request
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Represents the set of background tasks of a running gateway
pub struct Daemon {
    tasks: Vec<JoinHandle<Result<()>>>,
    running: Arc<AtomicBool>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new() -> Self {
        Daemon {
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Launch all tasks on the transport selected by the configuration
    pub async fn launch(&mut self, config: &Config) -> Result<()> {
        let transport = build_transport(config);
        self.launch_with_transport(config, transport)
    }

    /// Launch all tasks on an explicit transport
    pub fn launch_with_transport(
        &mut self,
        config: &Config,
        transport: Box<dyn LinkTransport>,
    ) -> Result<()> {
        info!("Starting acquisition on {}", transport.describe());
        let arbiter = Arc::new(BusArbiter::new(transport, config.acquisition.debounce()));
        let (sink, receiver) = TelemetrySink::channel(config.acquisition.sink_capacity);

        self.start_sink_consumer(receiver)?;
        self.start_acquisition(config, Arc::clone(&arbiter), sink)?;
        self.start_heartbeat(arbiter, config.acquisition.heartbeat())?;
        Ok(())
    }

    /// Start the polling scheduler
    fn start_acquisition(
        &mut self,
        config: &Config,
        arbiter: Arc<BusArbiter>,
        sink: TelemetrySink,
    ) -> Result<()> {
        let scheduler = Scheduler::new(&config.sensors, arbiter, sink, &config.acquisition);
        if scheduler.sensor_count() == 0 {
            warn!("No enabled sensor with a supported kind is configured");
        }
        let running = self.running.clone();
        let task = tokio::spawn(async move { scheduler.run(running).await });
        self.tasks.push(task);
        Ok(())
    }

    /// Log every record leaving the engine as a JSON line. Ends once the
    /// scheduler and its read tasks have released the sink.
    fn start_sink_consumer(&mut self, mut receiver: mpsc::Receiver<SinkMessage>) -> Result<()> {
        debug!("Starting telemetry sink consumer");
        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match &message {
                    SinkMessage::Telemetry(record) => {
                        info!("telemetry {}", serde_json::to_string(&record.flatten())?)
                    }
                    SinkMessage::Error(record) => {
                        warn!("sensor error {}", serde_json::to_string(record)?)
                    }
                }
            }
            debug!("Telemetry sink closed");
            Ok::<(), anyhow::Error>(())
        });
        self.tasks.push(task);
        Ok(())
    }

    /// Start a heartbeat task that logs the bus state periodically
    fn start_heartbeat(&mut self, arbiter: Arc<BusArbiter>, period: Duration) -> Result<()> {
        debug!("Starting heartbeat monitor");

        let running = self.running.clone();
        let task = tokio::spawn(async move {
            let mut since_last = Duration::ZERO;
            while running.load(Ordering::SeqCst) {
                time::sleep(SHUTDOWN_POLL).await;
                since_last += SHUTDOWN_POLL;
                if since_last >= period {
                    since_last = Duration::ZERO;
                    let state = arbiter.state();
                    info!(
                        "Daemon heartbeat: bus connected={} transactions={} failures={} reopens={}",
                        state.connected, state.transactions, state.failures, state.reopens
                    );
                }
            }
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Stop all running tasks
    pub fn shutdown(&self) {
        info!("Shutting down daemon tasks");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether shutdown has not been requested yet
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for all tasks to complete
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            match task.await {
                Ok(Err(e)) => log::error!("Task failed: {:#}", e),
                Err(e) => log::error!("Task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        Ok(())
    }
}

/// RTU transport on the configured serial port, or a seeded simulated bus
pub fn build_transport(config: &Config) -> Box<dyn LinkTransport> {
    if config.acquisition.simulate {
        info!("Using simulated RS485 bus");
        let bus = SimulatedTransport::new();
        bus.set_latency(Duration::from_millis(20));
        seed_simulated_bus(&bus, &config.sensors);
        Box::new(bus)
    } else {
        Box::new(RtuTransport::new(config.rs485.clone()))
    }
}

/// Fill the simulated bus with plausible register values for every sensor
pub fn seed_simulated_bus(bus: &SimulatedTransport, sensors: &[SensorDefinition]) {
    for sensor in sensors {
        let Some(driver) = SensorDriver::for_sensor(sensor) else {
            continue;
        };
        for step in driver.steps() {
            let value = simulated_value(sensor.kind, &step.spec.name);
            let words = match step.spec.count {
                0 | 1 => vec![value],
                n => {
                    let mut words = vec![0u16; usize::from(n)];
                    if let Some(last) = words.last_mut() {
                        *last = value;
                    }
                    words
                }
            };
            bus.set_registers(sensor.slave_address, step.spec.address, &words);
        }
        debug!("Seeded simulated registers for sensor {}", sensor.id);
    }
}

fn simulated_value(kind: SensorKind, register: &str) -> u16 {
    match (kind, register) {
        (SensorKind::Ph, "ph_value") => 7,
        (SensorKind::Turbidity, "turbidity") => 42,
        (SensorKind::Flow, "flow_rate") => 12,
        (SensorKind::Flow, "total_flow_low") => 4500,
        (SensorKind::Flow, "total_flow_high") => 1,
        (SensorKind::Flow, "flow_unit") => 0,
        (SensorKind::Flow, "flow_decimal_point") => 3,
        (SensorKind::Radar, "air_distance") => 4800,
        (_, "temperature") => 19,
        _ => 0,
    }
}
