//! Full telemetry poller
//!
//! Once per poll interval the poller takes the device lock, reads every
//! block of its [`ReadPlan`], releases the link and decodes the words into a
//! [`TelemetrySnapshot`]. Only a complete snapshot is ever published; a
//! failed cycle leaves the previous one in place.

use crate::battery::SmoothedBatteryState;
use crate::config::{InverterConfig, SocSource};
use crate::device::{DeviceCapabilities, DeviceConnection};
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::persistence::SnapshotStore;
use crate::registers::ReadPlan;
use crate::telemetry::{TelemetrySnapshot, decode_snapshot};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

/// Where the poller is within its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollPhase {
    Idle,
    Connecting,
    Reading,
    Decoding,
    Publishing,
}

pub type SnapshotReceiver = watch::Receiver<Option<Arc<TelemetrySnapshot>>>;

/// Receivers for what the poller publishes
#[derive(Debug, Clone)]
pub struct InverterChannels {
    pub snapshot: SnapshotReceiver,
    pub phase: watch::Receiver<PollPhase>,
}

pub struct InverterPoller {
    connection: Arc<DeviceConnection>,
    capabilities: DeviceCapabilities,
    plan: ReadPlan,
    poll_interval: Duration,
    soc_source: SocSource,
    battery: Option<watch::Receiver<SmoothedBatteryState>>,
    store: Option<Arc<dyn SnapshotStore>>,
    snapshot_tx: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
    phase_tx: Arc<watch::Sender<PollPhase>>,
    logger: StructuredLogger,
}

impl InverterPoller {
    /// `initial` is served until the first live cycle publishes.
    pub fn new(
        connection: Arc<DeviceConnection>,
        capabilities: DeviceCapabilities,
        config: &InverterConfig,
        soc_source: SocSource,
        initial: Option<TelemetrySnapshot>,
    ) -> (Self, InverterChannels) {
        let (snapshot_tx, snapshot_rx) =
            watch::channel(initial.map(|snapshot| Arc::new(snapshot.restored())));
        let (phase_tx, phase_rx) = watch::channel(PollPhase::Idle);
        let poller = Self {
            connection,
            capabilities,
            plan: ReadPlan::full(&capabilities, config.max_block_gap, config.max_block_len),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            soc_source,
            battery: None,
            store: None,
            snapshot_tx,
            phase_tx: Arc::new(phase_tx),
            logger: get_logger("inverter"),
        };
        let channels = InverterChannels {
            snapshot: snapshot_rx,
            phase: phase_rx,
        };
        (poller, channels)
    }

    /// Take battery voltage and SOC from the sampler's smoothed state.
    pub fn with_battery_state(mut self, battery: watch::Receiver<SmoothedBatteryState>) -> Self {
        self.battery = Some(battery);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn plan(&self) -> &ReadPlan {
        &self.plan
    }

    fn set_phase(&self, phase: PollPhase) {
        self.phase_tx.send_replace(phase);
    }

    /// Run one full cycle. Nothing is published on failure.
    pub async fn poll_once(&self) -> Result<Arc<TelemetrySnapshot>> {
        let result = self.cycle().await;
        self.set_phase(PollPhase::Idle);
        result
    }

    async fn cycle(&self) -> Result<Arc<TelemetrySnapshot>> {
        self.set_phase(PollPhase::Connecting);
        let blocks = self.plan.blocks.clone();
        let phase = Arc::clone(&self.phase_tx);
        let raw = self
            .connection
            .with_session(move |s| {
                Box::pin(async move {
                    phase.send_replace(PollPhase::Reading);
                    s.read_blocks(&blocks).await
                })
            })
            .await?;

        self.set_phase(PollPhase::Decoding);
        let smoothed = self
            .battery
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default();
        let snapshot = decode_snapshot(&self.plan, &self.capabilities, &raw, Utc::now())?
            .with_battery_state(&smoothed, self.soc_source);

        self.set_phase(PollPhase::Publishing);
        let snapshot = Arc::new(snapshot);
        self.snapshot_tx.send_replace(Some(Arc::clone(&snapshot)));

        if let Some(store) = &self.store
            && let Err(e) = store.store_snapshot(&snapshot)
        {
            self.logger.warn(&format!("Failed to persist snapshot: {}", e));
        }
        Ok(snapshot)
    }

    /// Poll every interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.logger.info(&format!(
            "Inverter poller started, layout {:?}, {} blocks every {}s",
            self.plan.layout,
            self.plan.blocks.len(),
            self.poll_interval.as_secs()
        ));
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(snapshot) => self.logger.debug(&format!(
                            "Published snapshot: PV {:.0}W, load {:.0}W, grid {:.0}W",
                            snapshot.pv_total_power_w, snapshot.load_power_w, snapshot.grid_power_w
                        )),
                        Err(e) => self.logger.warn(&format!("Inverter poll failed: {}", e)),
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        self.logger.info("Inverter poller stopped");
    }
}
