mod common;

use chrono::Utc;
use common::{MockTransport, fast_settings, snapshot_at, three_phase_registers};
use powerwatch::battery::SmoothedBatteryState;
use powerwatch::config::{InverterConfig, SocSource};
use powerwatch::device::{DeviceCapabilities, DeviceConnection};
use powerwatch::error::{PowerwatchError, Result};
use powerwatch::inverter::{InverterPoller, PollPhase};
use powerwatch::persistence::SnapshotStore;
use powerwatch::telemetry::{BatteryFlow, TelemetrySnapshot};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Default)]
struct CountingStore {
    stored: AtomicUsize,
    fail: bool,
}

impl SnapshotStore for CountingStore {
    fn load_last_known_good(&self) -> Result<Option<TelemetrySnapshot>> {
        Ok(None)
    }

    fn store_snapshot(&self, _snapshot: &TelemetrySnapshot) -> Result<()> {
        self.stored.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PowerwatchError::io("disk full"));
        }
        Ok(())
    }
}

fn connection() -> (Arc<DeviceConnection>, Arc<common::MockState>) {
    let (transport, state) = MockTransport::with_registers(&three_phase_registers());
    (
        Arc::new(DeviceConnection::new(Box::new(transport), fast_settings())),
        state,
    )
}

#[tokio::test]
async fn successful_cycle_publishes_snapshot() {
    let (connection, state) = connection();
    let store = Arc::new(CountingStore::default());
    let (poller, channels) = InverterPoller::new(
        connection,
        DeviceCapabilities::default(),
        &InverterConfig::default(),
        SocSource::VoltageCurve,
        None,
    );
    let poller = poller.with_store(store.clone());
    assert!(channels.snapshot.borrow().is_none());

    let snapshot = poller.poll_once().await.unwrap();
    let published = channels.snapshot.borrow().clone().unwrap();
    assert!(Arc::ptr_eq(&snapshot, &published));
    assert!(published.valid);
    assert_eq!(published.pv_total_power_w, 2400.0);
    assert_eq!(published.load_power_w, 800.0);
    assert_eq!(*channels.phase.borrow(), PollPhase::Idle);
    assert_eq!(store.stored.load(Ordering::SeqCst), 1);
    // One merged block per contiguous run, one close per cycle
    assert_eq!(state.count(&state.closes), 1);
    assert_eq!(state.count(&state.reads), poller.plan().blocks.len());
}

#[tokio::test]
async fn failed_cycle_keeps_previous_snapshot() {
    let (connection, state) = connection();
    let (poller, channels) = InverterPoller::new(
        connection,
        DeviceCapabilities::default(),
        &InverterConfig::default(),
        SocSource::VoltageCurve,
        None,
    );

    let first = poller.poll_once().await.unwrap();
    state.fail_reads.store(true, Ordering::SeqCst);
    assert!(poller.poll_once().await.is_err());

    let current = channels.snapshot.borrow().clone().unwrap();
    assert!(Arc::ptr_eq(&first, &current));
    assert_eq!(*channels.phase.borrow(), PollPhase::Idle);
    assert_eq!(state.count(&state.closes), 2);
}

#[tokio::test]
async fn partial_cycle_is_discarded() {
    let (connection, state) = connection();
    let store = Arc::new(CountingStore::default());
    let config = InverterConfig {
        max_block_len: 1,
        ..InverterConfig::default()
    };
    let (poller, channels) = InverterPoller::new(
        connection,
        DeviceCapabilities::default(),
        &config,
        SocSource::VoltageCurve,
        None,
    );
    let poller = poller.with_store(store.clone());
    let blocks = poller.plan().blocks.len();
    assert!(blocks > 1);

    let first = poller.poll_once().await.unwrap();

    // Earlier blocks now read new values, the last block fails
    state.set(514, 2000);
    *state.fail_address.lock().unwrap() = Some(653);
    assert!(poller.poll_once().await.is_err());

    assert_eq!(state.count(&state.reads), blocks * 2);
    let current = channels.snapshot.borrow().clone().unwrap();
    assert!(Arc::ptr_eq(&first, &current));
    assert_eq!(current.pv_total_power_w, 2400.0);
    assert_eq!(store.stored.load(Ordering::SeqCst), 1);
    assert_eq!(state.count(&state.closes), 2);
}

#[tokio::test]
async fn store_failure_does_not_abort_cycle() {
    let (connection, _state) = connection();
    let store = Arc::new(CountingStore {
        fail: true,
        ..CountingStore::default()
    });
    let (poller, channels) = InverterPoller::new(
        connection,
        DeviceCapabilities::default(),
        &InverterConfig::default(),
        SocSource::VoltageCurve,
        None,
    );
    let poller = poller.with_store(store.clone());

    assert!(poller.poll_once().await.is_ok());
    assert!(channels.snapshot.borrow().is_some());
    assert_eq!(store.stored.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn smoothed_battery_state_is_merged() {
    let (connection, _state) = connection();
    let (_battery_tx, battery_rx) = watch::channel(SmoothedBatteryState {
        voltage_v: Some(53.2),
        samples: 6,
        ..SmoothedBatteryState::default()
    });
    let (poller, _channels) = InverterPoller::new(
        connection,
        DeviceCapabilities::default(),
        &InverterConfig::default(),
        SocSource::VoltageCurve,
        None,
    );
    let poller = poller.with_battery_state(battery_rx);

    let snapshot = poller.poll_once().await.unwrap();
    let battery = snapshot.battery.as_ref().unwrap();
    assert!(battery.smoothed);
    assert_eq!(battery.voltage_v, 53.2);
    assert_eq!(battery.soc_percent, 80);
    assert_eq!(battery.soc_register, 50);
    assert_eq!(battery.flow, BatteryFlow::Charging);
}

#[tokio::test]
async fn initial_snapshot_is_served_until_first_cycle() {
    let (connection, state) = connection();
    state.fail_reads.store(true, Ordering::SeqCst);
    let cached = snapshot_at(Utc::now());
    let (poller, channels) = InverterPoller::new(
        connection,
        DeviceCapabilities::default(),
        &InverterConfig::default(),
        SocSource::VoltageCurve,
        Some(cached.clone()),
    );

    assert!(poller.poll_once().await.is_err());
    let current = channels.snapshot.borrow().clone().unwrap();
    assert_eq!(current.timestamp, cached.timestamp);
    assert!(!current.valid);

    state.fail_reads.store(false, Ordering::SeqCst);
    let live = poller.poll_once().await.unwrap();
    assert!(live.valid);
    assert!(channels.snapshot.borrow().as_ref().unwrap().valid);
}

#[tokio::test]
async fn single_phase_layout_reads_its_own_registers() {
    let (transport, state) = MockTransport::new();
    for (address, word) in [(186, 700), (187, 0xFFFF), (183, 5100), (184, 40), (178, 450)] {
        state.set(address, word);
    }
    let connection = Arc::new(DeviceConnection::new(Box::new(transport), fast_settings()));
    let caps = DeviceCapabilities {
        phase_count: 1,
        has_battery: true,
        pv_string_count: 2,
    };
    let (poller, _channels) = InverterPoller::new(
        connection,
        caps,
        &InverterConfig::default(),
        SocSource::Register,
        None,
    );

    let snapshot = poller.poll_once().await.unwrap();
    assert_eq!(snapshot.pv_power_w, vec![Some(700.0), None]);
    assert_eq!(snapshot.phase_loads_w.len(), 1);
    assert_eq!(snapshot.load_power_w, 450.0);
    assert_eq!(snapshot.battery.as_ref().unwrap().soc_percent, 40);
}
