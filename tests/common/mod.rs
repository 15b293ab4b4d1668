//! Mock transport and fixtures shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powerwatch::device::{DeviceCapabilities, SessionSettings};
use powerwatch::error::{PowerwatchError, Result};
use powerwatch::modbus::RegisterTransport;
use powerwatch::registers::{RawRegisters, ReadPlan};
use powerwatch::telemetry::{TelemetrySnapshot, decode_snapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the mock saw; shared with the test body
#[derive(Default)]
pub struct MockState {
    pub in_flight: AtomicBool,
    pub overlaps: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub reads: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub refuse_connect: AtomicBool,
    pub read_delay_ms: AtomicUsize,
    /// A read whose block covers this address fails
    pub fail_address: Mutex<Option<u16>>,
    pub registers: Mutex<HashMap<u16, u16>>,
}

impl MockState {
    pub fn set(&self, address: u16, word: u16) {
        self.registers.lock().unwrap().insert(address, word);
    }

    pub fn count(&self, counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct MockTransport {
    pub state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }

    pub fn with_registers(words: &HashMap<u16, u16>) -> (Self, Arc<MockState>) {
        let (transport, state) = Self::new();
        state.registers.lock().unwrap().extend(words.iter());
        (transport, state)
    }
}

#[async_trait]
impl RegisterTransport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.state.refuse_connect.load(Ordering::SeqCst) {
            return Err(PowerwatchError::connection_refused("mock refused"));
        }
        if self.state.in_flight.swap(true, Ordering::SeqCst) {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let delay = self.state.read_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(PowerwatchError::protocol("mock read failure"));
        }
        if let Some(bad) = *self.state.fail_address.lock().unwrap()
            && (address..address + count).contains(&bad)
        {
            return Err(PowerwatchError::protocol(format!("mock failure at {}", bad)));
        }
        let registers = self.state.registers.lock().unwrap();
        Ok((0..count)
            .map(|i| registers.get(&(address + i)).copied().unwrap_or(0))
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.in_flight.store(false, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn endpoint(&self) -> String {
        "mock:502".to_string()
    }
}

pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        connect_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_millis(500),
        inter_read_delay: Duration::ZERO,
        lock_timeout: Duration::from_secs(5),
    }
}

/// A plausible three-phase reading: 52.00 V battery at 50 %, 800 W load.
pub fn three_phase_registers() -> HashMap<u16, u16> {
    HashMap::from([
        (514, 1500),
        (515, 900),
        (586, 0xFFF6),
        (587, 5200),
        (588, 50),
        (598, 2304),
        (607, 120),
        (653, 800),
        (650, 300),
        (651, 250),
        (652, 250),
        (644, 2301),
        (645, 2299),
        (646, 2310),
        (540, 1345),
        (541, 1400),
        (502, 124),
        (520, 31),
        (521, 57),
        (526, 98),
    ])
}

pub fn snapshot_at(timestamp: DateTime<Utc>) -> TelemetrySnapshot {
    let caps = DeviceCapabilities::default();
    let plan = ReadPlan::full(&caps, 8, 64);
    let mut raw = RawRegisters::default();
    for (address, word) in three_phase_registers() {
        raw.insert(address, word);
    }
    decode_snapshot(&plan, &caps, &raw, timestamp).unwrap()
}
