//! Fixed-capacity sample ring with outlier rejection

use super::soc::voltage_to_soc;
use super::{BatterySample, SmoothedBatteryState};
use crate::config::BatteryConfig;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSettings {
    pub capacity: usize,
    pub threshold_v: f64,
    pub min_trusted: usize,
    /// Zero disables reseeding
    pub max_consecutive_rejections: usize,
}

impl From<&BatteryConfig> for FilterSettings {
    fn from(config: &BatteryConfig) -> Self {
        Self {
            capacity: config.buffer_size.max(1),
            threshold_v: config.outlier_threshold_v,
            min_trusted: config.min_trusted_samples,
            max_consecutive_rejections: config.max_consecutive_rejections,
        }
    }
}

/// What happened to a pushed sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Accepted,
    Rejected,
    /// Enough rejections in a row: the ring now holds the new level
    Reseeded,
}

/// Reject when the sample strays more than `threshold` from a mean backed
/// by at least `min_trusted` accepted samples.
pub fn should_reject(
    voltage: f64,
    mean: Option<f64>,
    accepted: usize,
    threshold: f64,
    min_trusted: usize,
) -> bool {
    match mean {
        Some(mean) if accepted >= min_trusted => (voltage - mean).abs() > threshold,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct SampleRing {
    settings: FilterSettings,
    accepted: VecDeque<BatterySample>,
    rejected_run: Vec<BatterySample>,
    last_good: Option<f64>,
    rejected_total: u64,
}

impl SampleRing {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            accepted: VecDeque::with_capacity(settings.capacity),
            rejected_run: Vec::new(),
            last_good: None,
            rejected_total: 0,
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.accepted.is_empty() {
            return None;
        }
        let sum: f64 = self.accepted.iter().map(|s| s.voltage_v).sum();
        Some(sum / self.accepted.len() as f64)
    }

    fn mean_current(&self) -> Option<f64> {
        if self.accepted.is_empty() {
            return None;
        }
        let sum: f64 = self.accepted.iter().map(|s| s.current_a).sum();
        Some(sum / self.accepted.len() as f64)
    }

    fn insert(&mut self, sample: BatterySample) {
        if self.accepted.len() == self.settings.capacity {
            self.accepted.pop_front();
        }
        self.accepted.push_back(sample);
        self.last_good = self.mean();
    }

    fn run_is_level(&self) -> bool {
        let count = self.rejected_run.len() as f64;
        let mean = self.rejected_run.iter().map(|s| s.voltage_v).sum::<f64>() / count;
        self.rejected_run
            .iter()
            .all(|s| (s.voltage_v - mean).abs() <= self.settings.threshold_v)
    }

    pub fn push(&mut self, sample: BatterySample) -> FilterVerdict {
        let reject = should_reject(
            sample.voltage_v,
            self.mean(),
            self.accepted.len(),
            self.settings.threshold_v,
            self.settings.min_trusted,
        );
        if !reject {
            self.rejected_run.clear();
            self.insert(sample);
            return FilterVerdict::Accepted;
        }

        self.rejected_total += 1;
        self.rejected_run.push(sample);
        let limit = self.settings.max_consecutive_rejections;
        if limit > 0 && self.rejected_run.len() >= limit {
            // Only a run that agrees with itself is a new level
            if !self.run_is_level() {
                self.rejected_run.remove(0);
                return FilterVerdict::Rejected;
            }
            self.accepted.clear();
            for held in std::mem::take(&mut self.rejected_run) {
                self.insert(held);
            }
            return FilterVerdict::Reseeded;
        }
        FilterVerdict::Rejected
    }

    /// Drop accepted samples older than `cutoff`; the last good mean is kept.
    pub fn expire_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.accepted.len();
        self.accepted.retain(|s| s.timestamp >= cutoff);
        self.rejected_run.retain(|s| s.timestamp >= cutoff);
        before - self.accepted.len()
    }

    pub fn state(&self) -> SmoothedBatteryState {
        let mean = self.mean();
        let voltage_v = mean.or(self.last_good);
        let newest = self.accepted.back();
        SmoothedBatteryState {
            voltage_v,
            current_a: self.mean_current(),
            soc_percent: voltage_v.map(voltage_to_soc),
            soc_register: newest.map(|s| s.soc_register),
            samples: self.accepted.len(),
            fallback: mean.is_none() && self.last_good.is_some(),
            last_sample_at: newest.map(|s| s.timestamp),
            rejected_total: self.rejected_total,
        }
    }
}
