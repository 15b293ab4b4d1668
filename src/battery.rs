//! Battery sampling and smoothing
//!
//! The battery voltage reported by the inverter jitters and occasionally
//! glitches. A fast sampler keeps a short ring of accepted readings, rejects
//! samples that jump away from a trusted mean, and publishes the smoothed
//! result for everything else to read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod filter;
pub mod sampler;
pub mod soc;

pub use filter::{FilterSettings, FilterVerdict, SampleRing, should_reject};
pub use sampler::BatterySampler;

/// One raw battery reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatterySample {
    pub timestamp: DateTime<Utc>,
    pub voltage_v: f64,
    /// Positive while charging
    pub current_a: f64,
    /// SOC register as reported by the inverter
    pub soc_register: u8,
}

/// Published smoothed battery state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SmoothedBatteryState {
    /// Mean of accepted samples, or the last good mean when the ring is empty
    pub voltage_v: Option<f64>,
    /// Mean current of accepted samples
    pub current_a: Option<f64>,
    /// SOC from the discharge curve at `voltage_v`
    pub soc_percent: Option<u8>,
    /// SOC register of the newest accepted sample
    pub soc_register: Option<u8>,
    /// Accepted samples currently in the ring
    pub samples: usize,
    /// `voltage_v` is a held value, not backed by current samples
    pub fallback: bool,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub rejected_total: u64,
}

impl SmoothedBatteryState {
    pub fn has_value(&self) -> bool {
        self.voltage_v.is_some()
    }
}
