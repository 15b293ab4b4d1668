use super::filter::{FilterSettings, FilterVerdict, SampleRing};
use super::{BatterySample, SmoothedBatteryState};
use crate::config::{BatteryConfig, InverterConfig};
use crate::device::{DeviceCapabilities, DeviceConnection};
use crate::error::{PowerwatchError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::registers::{Field, RawRegisters, ReadPlan, RegisterLayout};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

/// Result of one sampling cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    Filtered(FilterVerdict),
    /// Outside the plausible voltage window, never reaches the filter
    Implausible(f64),
}

/// Fast battery sampler sharing the device with the inverter poller
pub struct BatterySampler {
    connection: Arc<DeviceConnection>,
    plan: ReadPlan,
    ring: SampleRing,
    config: BatteryConfig,
    state_tx: watch::Sender<SmoothedBatteryState>,
    logger: StructuredLogger,
}

impl BatterySampler {
    pub fn new(
        connection: Arc<DeviceConnection>,
        capabilities: &DeviceCapabilities,
        config: &BatteryConfig,
        inverter: &InverterConfig,
    ) -> (Self, watch::Receiver<SmoothedBatteryState>) {
        let (state_tx, state_rx) = watch::channel(SmoothedBatteryState::default());
        let sampler = Self {
            connection,
            plan: ReadPlan::battery(capabilities, inverter.max_block_gap, inverter.max_block_len),
            ring: SampleRing::new(FilterSettings::from(config)),
            config: config.clone(),
            state_tx,
            logger: get_logger("battery"),
        };
        (sampler, state_rx)
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sample_interval_secs)
    }

    /// Samples older than this no longer back the smoothed value
    fn max_sample_age(&self) -> chrono::Duration {
        let secs = self.config.sample_interval_secs * self.config.buffer_size.max(1) as u64 * 2;
        chrono::Duration::seconds(secs as i64)
    }

    /// Read the battery registers once and feed the filter.
    pub async fn sample_once(&mut self) -> Result<SampleOutcome> {
        let blocks = self.plan.blocks.clone();
        let raw = self
            .connection
            .with_session(move |s| Box::pin(async move { s.read_blocks(&blocks).await }))
            .await;

        let now = Utc::now();
        let outcome = match raw.and_then(|raw| decode_sample(self.plan.layout, &raw, now)) {
            Ok(sample) => Ok(self.accept(sample)),
            Err(e) => Err(e),
        };

        self.ring.expire_before(now - self.max_sample_age());
        self.publish();
        outcome
    }

    fn accept(&mut self, sample: BatterySample) -> SampleOutcome {
        let voltage = sample.voltage_v;
        if voltage < self.config.min_plausible_v || voltage > self.config.max_plausible_v {
            self.logger.warn(&format!(
                "Discarding implausible battery reading {:.2}V",
                voltage
            ));
            return SampleOutcome::Implausible(voltage);
        }

        let verdict = self.ring.push(sample);
        match verdict {
            FilterVerdict::Accepted => self
                .logger
                .trace(&format!("Accepted {:.2}V", voltage)),
            FilterVerdict::Rejected => self.logger.debug(&format!(
                "Rejected outlier {:.2}V (mean {:.2}V)",
                voltage,
                self.ring.mean().unwrap_or(f64::NAN)
            )),
            FilterVerdict::Reseeded => self.logger.info(&format!(
                "Battery level shifted, reseeded at {:.2}V",
                self.ring.mean().unwrap_or(voltage)
            )),
        }
        SampleOutcome::Filtered(verdict)
    }

    fn publish(&self) {
        // send_replace never fails, even without receivers
        self.state_tx.send_replace(self.ring.state());
    }

    /// Sample every interval until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.logger.info(&format!(
            "Battery sampler started, interval {}s, buffer {}",
            self.config.sample_interval_secs, self.config.buffer_size
        ));
        let mut ticker = interval(self.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sample_once().await {
                        self.logger.debug(&format!("Battery sample failed: {}", e));
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        self.logger.info("Battery sampler stopped");
    }
}

fn decode_sample(
    layout: RegisterLayout,
    raw: &RawRegisters,
    timestamp: DateTime<Utc>,
) -> Result<BatterySample> {
    let value = |field: Field| -> Result<f64> {
        let spec = layout
            .spec(field)
            .ok_or_else(|| PowerwatchError::protocol(format!("No {:?} register", field)))?;
        let word = raw.get(spec.address).ok_or_else(|| {
            PowerwatchError::protocol(format!("Register {} missing", spec.address))
        })?;
        Ok(spec.decode(word).unwrap_or(0.0))
    };

    Ok(BatterySample {
        timestamp,
        voltage_v: value(Field::BatteryVoltage)?,
        current_a: value(Field::BatteryCurrent)?,
        soc_register: value(Field::BatterySoc)?.clamp(0.0, 100.0) as u8,
    })
}
