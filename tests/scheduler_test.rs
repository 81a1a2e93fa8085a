// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use rs485_acquisition::bus::BusArbiter;
use rs485_acquisition::config::{EngineConfig, SensorDefinition, SensorKind};
use rs485_acquisition::link::simulated::SimulatedTransport;
use rs485_acquisition::link::LinkError;
use rs485_acquisition::reading::Quality;
use rs485_acquisition::scheduler::{Phase, Scheduler};
use rs485_acquisition::sink::{SinkMessage, TelemetrySink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn setup() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

fn engine() -> EngineConfig {
    EngineConfig {
        debounce_ms: 10,
        ..EngineConfig::default()
    }
}

fn radar(id: &str, slave: u8, interval_secs: f64) -> SensorDefinition {
    let mut sensor = SensorDefinition::new(id, SensorKind::Radar, slave);
    sensor.poll_interval_secs = Some(interval_secs);
    sensor
}

fn scheduler(
    bus: &SimulatedTransport,
    sensors: &[SensorDefinition],
    engine: &EngineConfig,
) -> (Scheduler, mpsc::Receiver<SinkMessage>) {
    let arbiter = Arc::new(BusArbiter::new(Box::new(bus.clone()), engine.debounce()));
    let (sink, rx) = TelemetrySink::channel(engine.sink_capacity);
    (Scheduler::new(sensors, arbiter, sink, engine), rx)
}

/// Let spawned read tasks run to completion in paused time
async fn settle() {
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_follows_interval() {
    setup();
    let bus = SimulatedTransport::new();
    bus.set_register(4, 0x0001, 4000);
    let (mut scheduler, mut rx) = scheduler(&bus, &[radar("radar_1", 4, 10.0)], &engine());

    assert_eq!(scheduler.poll_once(Instant::now()).await, vec![0]);
    settle().await;
    match rx.recv().await {
        Some(SinkMessage::Telemetry(record)) => {
            assert_eq!(record.sensor_id, "radar_1");
            assert_eq!(record.primary_value, 1500.0);
            assert_eq!(record.quality, Quality::Good);
        }
        other => panic!("unexpected message {other:?}"),
    }

    // Reap happens on the next tick; the completion time is the last read time
    assert!(scheduler.poll_once(Instant::now()).await.is_empty());
    let last_read = scheduler.state().last_read(0).unwrap();
    tokio::time::advance(Duration::from_secs(10) - (Instant::now() - last_read) - Duration::from_secs(1)).await;
    assert!(scheduler.poll_once(Instant::now()).await.is_empty());
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(scheduler.poll_once(Instant::now()).await, vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_read_is_not_dispatched_twice() {
    setup();
    let bus = SimulatedTransport::new();
    bus.set_register(4, 0x0001, 5000);
    bus.set_slave_latency(4, Duration::from_millis(3500));
    let engine = EngineConfig {
        read_deadline_ms: 10_000,
        ..engine()
    };
    let (mut scheduler, _rx) = scheduler(&bus, &[radar("radar_1", 4, 1.0)], &engine);

    assert_eq!(scheduler.poll_once(Instant::now()).await, vec![0]);
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.poll_once(Instant::now()).await.is_empty());
        assert_eq!(scheduler.state().phase(0), Some(Phase::Reading));
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    scheduler.poll_once(Instant::now()).await;
    assert_eq!(bus.journal().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_reports_error_for_that_sensor_only() {
    setup();
    let bus = SimulatedTransport::new();
    bus.set_register(4, 0x0001, 5000);
    bus.set_register(5, 0x0001, 5000);
    bus.set_slave_latency(4, Duration::from_secs(30));
    let (mut scheduler, mut rx) = scheduler(
        &bus,
        &[radar("radar_slow", 4, 20.0), radar("radar_ok", 5, 20.0)],
        &engine(),
    );

    scheduler.poll_once(Instant::now()).await;
    tokio::time::sleep(Duration::from_secs(7)).await;

    let mut errors = Vec::new();
    let mut telemetry = Vec::new();
    while let Ok(message) = rx.try_recv() {
        match message {
            SinkMessage::Error(record) => errors.push(record),
            SinkMessage::Telemetry(record) => telemetry.push(record),
        }
    }
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].sensor_id, "radar_slow");
    assert_eq!(errors[0].error_kind, "deadline_exceeded");
    assert_eq!(telemetry.len(), 1);
    assert_eq!(telemetry[0].sensor_id, "radar_ok");
}

#[tokio::test(start_paused = true)]
async fn test_mandatory_failure_does_not_stop_scheduler() {
    setup();
    let bus = SimulatedTransport::new();
    bus.fail_register(4, 0x0001, LinkError::Timeout);
    let (mut scheduler, mut rx) = scheduler(&bus, &[radar("radar_1", 4, 1.0)], &engine());

    scheduler.poll_once(Instant::now()).await;
    settle().await;
    match rx.recv().await {
        Some(SinkMessage::Error(record)) => {
            assert_eq!(record.error_kind, "mandatory_register_failed");
            assert_eq!(record.cause.as_deref(), Some("timeout"));
        }
        other => panic!("unexpected message {other:?}"),
    }

    bus.clear_register_failure(4, 0x0001);
    bus.set_register(4, 0x0001, 5000);
    scheduler.poll_once(Instant::now()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(scheduler.poll_once(Instant::now()).await, vec![0]);
    settle().await;
    assert!(matches!(rx.recv().await, Some(SinkMessage::Telemetry(_))));
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_and_disabled_sensors_are_skipped() {
    let bus = SimulatedTransport::new();
    let mut disabled = radar("radar_off", 6, 10.0);
    disabled.enabled = false;
    let unsupported = SensorDefinition::new("conductivity", SensorKind::Unsupported, 7);
    let (scheduler, _rx) = scheduler(
        &bus,
        &[disabled, unsupported, radar("radar_1", 4, 10.0)],
        &engine(),
    );
    assert_eq!(scheduler.sensor_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_drains_and_closes_link() {
    setup();
    let bus = SimulatedTransport::new();
    bus.set_register(4, 0x0001, 5000);
    bus.set_slave_latency(4, Duration::from_millis(1500));
    let (scheduler, _rx) = scheduler(&bus, &[radar("radar_1", 4, 10.0)], &engine());

    let running = Arc::new(AtomicBool::new(true));
    let task = tokio::spawn(scheduler.run(Arc::clone(&running)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    running.store(false, Ordering::SeqCst);
    task.await.unwrap().unwrap();

    let journal = bus.journal();
    assert_eq!(journal.len(), 1);
    assert!(journal[0].ok);
    assert!(!rs485_acquisition::link::LinkTransport::is_open(&bus));
}
