// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use rs485_acquisition::bus::BusArbiter;
use rs485_acquisition::config::{Calibration, ContainerGeometry, SensorDefinition, SensorKind};
use rs485_acquisition::drivers::SensorDriver;
use rs485_acquisition::link::simulated::SimulatedTransport;
use rs485_acquisition::link::LinkError;
use rs485_acquisition::reading::{MeasurementValue, Quality, Reading};
use std::time::Duration;

async fn read_once(bus: &SimulatedTransport, sensor: &SensorDefinition) -> Reading {
    let arbiter = BusArbiter::new(Box::new(bus.clone()), Duration::from_millis(500));
    let driver = SensorDriver::for_sensor(sensor).unwrap();
    let mut session = arbiter.acquire(sensor.slave_address).await;
    driver.read(&sensor.id, &mut session).await
}

fn number(reading: &Reading, key: &str) -> Option<f64> {
    reading.get(key).and_then(MeasurementValue::as_f64)
}

#[tokio::test(start_paused = true)]
async fn test_ph_calibrated_and_clamped() {
    let bus = SimulatedTransport::new();
    bus.set_registers(1, 0x0001, &[1000, 0, 23]);
    let mut sensor = SensorDefinition::new("ph_1", SensorKind::Ph, 1);
    sensor.calibration = Calibration {
        offset: 0.5,
        scale: 1.0,
    };
    let reading = read_once(&bus, &sensor).await;
    assert_eq!(reading.primary_value, Some(14.0));
    assert_eq!(reading.quality, Quality::Uncertain);
    assert_eq!(number(&reading, "temperature"), Some(23.0));
    assert_eq!(reading.raw_bytes, vec![0x03, 0xE8]);
}

#[tokio::test(start_paused = true)]
async fn test_ph_optional_temperature_failure() {
    let bus = SimulatedTransport::new();
    bus.set_register(1, 0x0001, 7);
    bus.fail_register(1, 0x0003, LinkError::MalformedResponse("crc".into()));
    let sensor = SensorDefinition::new("ph_1", SensorKind::Ph, 1);
    let reading = read_once(&bus, &sensor).await;
    assert_eq!(reading.quality, Quality::Good);
    assert_eq!(reading.primary_value, Some(7.0));
    assert!(reading.get("temperature").is_none());
    assert_eq!(
        reading.get("temperature_fallback"),
        Some(&MeasurementValue::Flag(true))
    );
}

#[tokio::test(start_paused = true)]
async fn test_flow_total_from_high_word() {
    let bus = SimulatedTransport::new();
    bus.set_register(3, 0x0001, 25);
    bus.set_register(3, 0x000A, 0);
    bus.set_register(3, 0x0011, 1);
    bus.set_register(3, 0x1438, 0xFFFF);
    bus.set_register(3, 0x1439, 0xFFFF);
    let sensor = SensorDefinition::new("flow_1", SensorKind::Flow, 3);
    let reading = read_once(&bus, &sensor).await;
    assert_eq!(reading.quality, Quality::Good);
    assert_eq!(reading.primary_value, Some(25.0));
    assert_eq!(reading.unit, "m³");
    assert_eq!(number(&reading, "total_flow"), Some(65536.0));
    assert_eq!(number(&reading, "flow_decimal_point"), Some(3.0));
    assert!(reading.get("flow_decimal_point_fallback").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_flow_unit_registers_missing_use_defaults() {
    let bus = SimulatedTransport::new();
    bus.set_register(3, 0x0001, 5);
    bus.set_register(3, 0x000A, 1234);
    bus.set_register(3, 0x0011, 0);
    let sensor = SensorDefinition::new("flow_1", SensorKind::Flow, 3);
    let reading = read_once(&bus, &sensor).await;
    assert_eq!(reading.quality, Quality::Good);
    assert_eq!(number(&reading, "total_flow"), Some(1234.0));
    assert_eq!(
        reading.get("flow_unit_fallback"),
        Some(&MeasurementValue::Flag(true))
    );
    assert_eq!(
        reading.get("flow_decimal_point_fallback"),
        Some(&MeasurementValue::Flag(true))
    );
}

#[tokio::test(start_paused = true)]
async fn test_flow_mandatory_total_failure_is_bad() {
    let bus = SimulatedTransport::new();
    bus.set_register(3, 0x0001, 5);
    bus.set_register(3, 0x000A, 1);
    let sensor = SensorDefinition::new("flow_1", SensorKind::Flow, 3);
    let reading = read_once(&bus, &sensor).await;
    assert_eq!(reading.quality, Quality::Bad);
    assert_eq!(reading.primary_value, None);
    assert!(reading.error.unwrap().message.contains("total_flow_high"));
    // Sequence stops at the failed mandatory register
    assert_eq!(bus.journal().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_radar_levels() {
    let bus = SimulatedTransport::new();
    bus.set_register(4, 0x0001, 6000);
    let mut sensor = SensorDefinition::new("radar_1", SensorKind::Radar, 4);
    sensor.container_geometry = Some(ContainerGeometry {
        air_distance_max_mm: Some(5500.0),
        max_water_level_mm: Some(1500.0),
        ..ContainerGeometry::default()
    });
    let reading = read_once(&bus, &sensor).await;
    assert_eq!(reading.primary_value, Some(0.0));
    assert_eq!(reading.unit, "mm");

    bus.set_register(4, 0x0001, 4000);
    let reading = read_once(&bus, &sensor).await;
    assert_eq!(reading.primary_value, Some(1500.0));
    assert_eq!(number(&reading, "volume_percentage"), Some(100.0));
    assert_eq!(
        reading.get("water_level_alarm"),
        Some(&MeasurementValue::Flag(true))
    );
}

#[tokio::test(start_paused = true)]
async fn test_turbidity_low_band() {
    let bus = SimulatedTransport::new();
    bus.set_registers(2, 0x0001, &[12, 0, 17]);
    let sensor = SensorDefinition::new("turbidity_1", SensorKind::Turbidity, 2);
    let reading = read_once(&bus, &sensor).await;
    assert_eq!(reading.primary_value, Some(2.0));
    assert_eq!(reading.unit, "NTU");
    assert_eq!(number(&reading, "turbidity_raw"), Some(12.0));
    assert_eq!(number(&reading, "temperature"), Some(17.0));
}
