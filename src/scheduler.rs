// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Polling scheduler
//!
//! Each enabled sensor cycles through `Idle -> Due -> Reading -> Idle`. On
//! every tick the scheduler:
//! 1. reaps finished read tasks and returns their sensors to `Idle`, stamping
//!    the completion time as the last read time
//! 2. marks every idle sensor whose interval has elapsed as `Due`
//! 3. spawns one read task per due sensor and marks it `Reading`
//!
//! A sensor in `Reading` is never dispatched again, however many ticks fire
//! before its task completes. Read tasks run concurrently; their bus work is
//! serialized by the [`BusArbiter`].

use crate::bus::BusArbiter;
use crate::config::{EngineConfig, SensorDefinition};
use crate::drivers::{DriverError, SensorDriver};
use crate::reading::{Quality, Reading};
use crate::sink::{SinkMessage, TelemetrySink};
use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Scheduling phase of one sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Due,
    Reading,
}

#[derive(Debug, Clone)]
struct SlotState {
    interval: Duration,
    last_read: Option<Instant>,
    phase: Phase,
}

/// Per-sensor scheduling state, independent of any I/O
#[derive(Debug, Clone, Default)]
pub struct PollState {
    slots: Vec<SlotState>,
}

impl PollState {
    pub fn new(intervals: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            slots: intervals
                .into_iter()
                .map(|interval| SlotState {
                    interval,
                    last_read: None,
                    phase: Phase::Idle,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn phase(&self, index: usize) -> Option<Phase> {
        self.slots.get(index).map(|s| s.phase)
    }

    pub fn last_read(&self, index: usize) -> Option<Instant> {
        self.slots.get(index).and_then(|s| s.last_read)
    }

    /// Pretend the sensor was last read at `at`
    pub fn set_last_read(&mut self, index: usize, at: Instant) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.last_read = Some(at);
        }
    }

    /// Whether sensor `index` should be polled at `now`. Never-read sensors are due.
    pub fn is_due(&self, index: usize, now: Instant) -> bool {
        self.slots.get(index).is_some_and(|slot| {
            slot.phase == Phase::Idle
                && slot
                    .last_read
                    .map_or(true, |last| now.saturating_duration_since(last) >= slot.interval)
        })
    }

    /// Mark every due sensor `Due` and return their indices
    pub fn collect_due(&mut self, now: Instant) -> Vec<usize> {
        let due: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.is_due(i, now))
            .collect();
        for &i in &due {
            self.slots[i].phase = Phase::Due;
        }
        due
    }

    /// A read task was spawned for `index`
    pub fn start(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.phase = Phase::Reading;
        }
    }

    /// The read task of `index` finished at `at`, successfully or not
    pub fn complete(&mut self, index: usize, at: Instant) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.phase = Phase::Idle;
            slot.last_read = Some(at);
        }
    }
}

struct ScheduledSensor {
    definition: Arc<SensorDefinition>,
    driver: Arc<SensorDriver>,
}

struct TaskOutcome {
    completed_at: Instant,
    quality: Quality,
}

/// Dispatches sensor reads on a shared bus
pub struct Scheduler {
    arbiter: Arc<BusArbiter>,
    sink: TelemetrySink,
    sensors: Vec<ScheduledSensor>,
    state: PollState,
    in_flight: Vec<(usize, JoinHandle<TaskOutcome>)>,
    tick: Duration,
    read_deadline: Duration,
    shutdown_grace: Duration,
}

impl Scheduler {
    /// Build a scheduler for the enabled, supported sensors in `definitions`
    pub fn new(
        definitions: &[SensorDefinition],
        arbiter: Arc<BusArbiter>,
        sink: TelemetrySink,
        engine: &EngineConfig,
    ) -> Self {
        let mut sensors = Vec::new();
        for definition in definitions {
            if !definition.enabled {
                debug!("Sensor {} disabled, not scheduled", definition.id);
                continue;
            }
            match SensorDriver::for_sensor(definition) {
                Some(driver) => {
                    info!(
                        "Scheduling sensor {} ({}, slave {}) every {:?}",
                        definition.id,
                        definition.kind,
                        definition.slave_address,
                        definition.poll_interval()
                    );
                    sensors.push(ScheduledSensor {
                        definition: Arc::new(definition.clone()),
                        driver: Arc::new(driver),
                    });
                }
                None => warn!(
                    "Sensor {} has unsupported kind, skipping",
                    definition.id
                ),
            }
        }
        let state = PollState::new(sensors.iter().map(|s| s.definition.poll_interval()));
        Self {
            arbiter,
            sink,
            sensors,
            state,
            in_flight: Vec::new(),
            tick: engine.tick(),
            read_deadline: engine.read_deadline(),
            shutdown_grace: engine.shutdown_grace(),
        }
    }

    /// Number of scheduled sensors
    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Number of read tasks not yet reaped
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run the tick loop until `running` is cleared, then drain in-flight
    /// reads within the grace period and close the link.
    pub async fn run(mut self, running: Arc<AtomicBool>) -> Result<()> {
        info!(
            "Scheduler started with {} sensors, tick {:?}",
            self.sensors.len(),
            self.tick
        );
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !running.load(Ordering::SeqCst) {
                break;
            }
            self.poll_once(Instant::now()).await;
        }
        info!("Scheduler stopping, {} reads in flight", self.in_flight.len());
        self.shutdown().await;
        Ok(())
    }

    /// One scheduler tick. Returns the indices dispatched.
    pub async fn poll_once(&mut self, now: Instant) -> Vec<usize> {
        self.reap().await;
        let due = self.state.collect_due(now);
        for &index in &due {
            self.dispatch(index);
        }
        due
    }

    /// Collect finished tasks
    async fn reap(&mut self) {
        let mut pending = Vec::with_capacity(self.in_flight.len());
        for (index, handle) in self.in_flight.drain(..) {
            if handle.is_finished() {
                let completed_at = match handle.await {
                    Ok(outcome) => {
                        debug!(
                            "Sensor {} read finished with quality {}",
                            self.sensors[index].definition.id, outcome.quality
                        );
                        outcome.completed_at
                    }
                    Err(err) => {
                        error!(
                            "Read task of sensor {} failed: {}",
                            self.sensors[index].definition.id, err
                        );
                        Instant::now()
                    }
                };
                self.state.complete(index, completed_at);
            } else {
                pending.push((index, handle));
            }
        }
        self.in_flight = pending;
    }

    fn dispatch(&mut self, index: usize) {
        let sensor = &self.sensors[index];
        let definition = Arc::clone(&sensor.definition);
        let driver = Arc::clone(&sensor.driver);
        let arbiter = Arc::clone(&self.arbiter);
        let sink = self.sink.clone();
        let deadline = self.read_deadline;

        debug!("Dispatching read of sensor {}", definition.id);
        let handle = tokio::spawn(async move {
            let reading = read_sensor(&arbiter, &definition, &driver, deadline).await;
            report(&reading);
            sink.emit(SinkMessage::from_reading(&definition, &reading));
            TaskOutcome {
                completed_at: Instant::now(),
                quality: reading.quality,
            }
        });
        self.state.start(index);
        self.in_flight.push((index, handle));
    }

    /// Wait for in-flight reads, abort the ones exceeding the grace period,
    /// then close the link
    pub async fn shutdown(&mut self) {
        let grace = self.shutdown_grace;
        let mut handles: Vec<(usize, JoinHandle<TaskOutcome>)> = self.in_flight.drain(..).collect();
        let drained = tokio::time::timeout(grace, async {
            for (_, handle) in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;
        if drained.is_err() {
            let remaining = handles.iter().filter(|(_, h)| !h.is_finished()).count();
            warn!(
                "Shutdown grace period of {:?} elapsed, aborting {} reads",
                grace, remaining
            );
            for (_, handle) in &handles {
                handle.abort();
            }
        }
        let now = Instant::now();
        for (index, _) in handles {
            self.state.complete(index, now);
        }
        self.arbiter.close().await;
        info!("Scheduler stopped");
    }
}

/// Acquire the bus for `definition` and run its driver under `deadline`.
/// The deadline starts once the bus is acquired.
pub async fn read_sensor(
    arbiter: &BusArbiter,
    definition: &SensorDefinition,
    driver: &SensorDriver,
    deadline: Duration,
) -> Reading {
    let mut session = arbiter.acquire(definition.slave_address).await;
    match tokio::time::timeout(deadline, driver.read(&definition.id, &mut session)).await {
        Ok(reading) => reading,
        Err(_) => {
            let err = DriverError::DeadlineExceeded(deadline);
            warn!("Sensor {}: {}", definition.id, err);
            driver.failed(&definition.id, &err)
        }
    }
}

fn report(reading: &Reading) {
    match (reading.quality, reading.primary_value) {
        (Quality::Bad, _) | (_, None) => error!(
            "Sensor {} read failed: {}",
            reading.sensor_id,
            reading
                .error
                .as_ref()
                .map_or("unknown error", |e| e.message.as_str())
        ),
        (quality, Some(value)) => info!(
            "Sensor {} ({}): {:.3} {} [{}]",
            reading.sensor_id, reading.kind, value, reading.unit, quality
        ),
    }
}
