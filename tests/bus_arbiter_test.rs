// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use proptest::prelude::*;
use rs485_acquisition::bus::BusArbiter;
use rs485_acquisition::config::{SensorDefinition, SensorKind};
use rs485_acquisition::drivers::SensorDriver;
use rs485_acquisition::link::simulated::SimulatedTransport;
use rs485_acquisition::scheduler::read_sensor;
use std::sync::Arc;
use std::time::Duration;

const DEBOUNCE: Duration = Duration::from_millis(500);

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

/// Seed a flow meter whose flow rate register holds its own slave address
fn seed_flow_meter(bus: &SimulatedTransport, slave: u8) {
    bus.set_register(slave, 0x0001, u16::from(slave));
    bus.set_register(slave, 0x000A, 10);
    bus.set_register(slave, 0x0011, 0);
    bus.set_register(slave, 0x1438, 0);
    bus.set_register(slave, 0x1439, 3);
}

fn sensors_strategy() -> impl Strategy<Value = Vec<(u8, u64, u64)>> {
    // (slave address, bus latency ms, start offset ms)
    prop::collection::btree_map(1u8..=247, (0u64..40, 0u64..300), 2..6).prop_map(|m| {
        m.into_iter()
            .map(|(slave, (latency, offset))| (slave, latency, offset))
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn concurrent_reads_never_cross_talk(sensors in sensors_strategy()) {
        let rt = paused_runtime();
        rt.block_on(async {
            let bus = SimulatedTransport::new();
            for &(slave, latency, _) in &sensors {
                seed_flow_meter(&bus, slave);
                bus.set_slave_latency(slave, Duration::from_millis(latency));
            }
            let arbiter = Arc::new(BusArbiter::new(Box::new(bus.clone()), DEBOUNCE));

            let mut handles = Vec::new();
            for &(slave, _, offset) in &sensors {
                let arbiter = Arc::clone(&arbiter);
                let mut definition =
                    SensorDefinition::new(&format!("flow_{slave}"), SensorKind::Flow, slave);
                definition.step_delay_ms = Some(offset % 50);
                handles.push(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(offset)).await;
                    let driver = SensorDriver::for_sensor(&definition).unwrap();
                    let reading =
                        read_sensor(&arbiter, &definition, &driver, Duration::from_secs(60)).await;
                    (slave, reading)
                }));
            }

            for handle in handles {
                let (slave, reading) = handle.await.unwrap();
                assert_eq!(reading.sensor_id, format!("flow_{slave}"));
                assert_eq!(reading.primary_value, Some(f64::from(slave)));
            }

            let journal = bus.journal();
            assert_eq!(journal.len(), sensors.len() * 5);
            assert_eq!(bus.overlaps(), 0);
            // Each sensor's five-step sequence is contiguous on the wire
            for chunk in journal.chunks(5) {
                assert!(chunk.iter().all(|t| t.slave == chunk[0].slave));
            }
        });
    }

    #[test]
    fn transactions_respect_debounce(latencies in prop::collection::vec(0u64..80, 2..12)) {
        let rt = paused_runtime();
        rt.block_on(async {
            let bus = SimulatedTransport::new();
            let arbiter = Arc::new(BusArbiter::new(Box::new(bus.clone()), DEBOUNCE));
            let mut handles = Vec::new();
            for (i, latency) in latencies.iter().enumerate() {
                let slave = (i + 1) as u8;
                bus.set_register(slave, 0x0001, 1);
                bus.set_slave_latency(slave, Duration::from_millis(*latency));
                let arbiter = Arc::clone(&arbiter);
                handles.push(tokio::spawn(async move {
                    let mut session = arbiter.acquire(slave).await;
                    session.read_registers(0x0001, 1).await.unwrap();
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let journal = bus.journal();
            assert_eq!(journal.len(), latencies.len());
            for pair in journal.windows(2) {
                assert!(pair[1].started >= pair[0].finished + DEBOUNCE);
            }
        });
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_binds_slave_for_whole_sequence() {
    let bus = SimulatedTransport::new();
    seed_flow_meter(&bus, 11);
    seed_flow_meter(&bus, 22);
    bus.set_slave_latency(11, Duration::from_millis(30));
    let arbiter = Arc::new(BusArbiter::new(Box::new(bus.clone()), Duration::from_millis(20)));

    let first = {
        let arbiter = Arc::clone(&arbiter);
        tokio::spawn(async move {
            let mut session = arbiter.acquire(11).await;
            let a = session.read_registers(0x0001, 1).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let b = session.read_registers(0x0001, 1).await.unwrap();
            (a, b)
        })
    };
    tokio::task::yield_now().await;
    let second = {
        let arbiter = Arc::clone(&arbiter);
        tokio::spawn(async move {
            let mut session = arbiter.acquire(22).await;
            session.read_registers(0x0001, 1).await.unwrap()
        })
    };

    let (a, b) = first.await.unwrap();
    assert_eq!(a, vec![0, 11]);
    assert_eq!(b, vec![0, 11]);
    assert_eq!(second.await.unwrap(), vec![0, 22]);
    let slaves: Vec<u8> = bus.journal().iter().map(|t| t.slave).collect();
    assert_eq!(slaves, vec![11, 11, 22]);
}
