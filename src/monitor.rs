//! Wiring and lifecycle
//!
//! [`Monitor::start`] detects what the inverter has, spawns one task per
//! worker and returns a [`MonitorHandle`]. Every query on the handle reads a
//! published cache; none of them touches the device.

use crate::battery::{BatterySampler, SmoothedBatteryState};
use crate::config::{Config, SocSource};
use crate::device::{
    DeviceCapabilities, DeviceConnection, SessionSettings, SessionStatsSnapshot,
    detect_capabilities,
};
use crate::error::Result;
use crate::inverter::{InverterPoller, PollPhase, SnapshotReceiver};
use crate::logging::{StructuredLogger, get_logger};
use crate::modbus::RegisterTransport;
use crate::outage::{OutagePoller, OutageStatus, OutageWindow, ScheduleSource, ScheduleState};
use crate::persistence::SnapshotStore;
use crate::registers::RegisterLayout;
use crate::survival::{SurvivalEstimate, SurvivalVerdict, estimate_for_hours};
use crate::telemetry::TelemetrySnapshot;
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Latest telemetry as seen by a caller
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Snapshot(Arc<TelemetrySnapshot>),
    /// No cycle has succeeded yet, or the last snapshot is too old
    Unavailable,
}

impl Telemetry {
    pub fn snapshot(&self) -> Option<&Arc<TelemetrySnapshot>> {
        match self {
            Telemetry::Snapshot(snapshot) => Some(snapshot),
            Telemetry::Unavailable => None,
        }
    }
}

pub struct Monitor;

impl Monitor {
    /// Validate `config`, detect capabilities and start every worker.
    pub async fn start(
        config: Config,
        transport: Box<dyn RegisterTransport>,
        source: Option<Arc<dyn ScheduleSource>>,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<MonitorHandle> {
        config.validate()?;
        let logger = get_logger("monitor");
        let timezone = config.tz()?;

        let connection = Arc::new(DeviceConnection::new(
            transport,
            SessionSettings::from(&config.device),
        ));
        let capabilities = detect_capabilities(&connection, &config.capabilities).await;

        let initial = store
            .as_ref()
            .and_then(|store| load_initial(store.as_ref(), &capabilities, &logger));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let battery_rx = if capabilities.has_battery {
            let (sampler, rx) = BatterySampler::new(
                Arc::clone(&connection),
                &capabilities,
                &config.battery,
                &config.inverter,
            );
            tasks.push(tokio::spawn(sampler.run(shutdown_rx.clone())));
            rx
        } else {
            logger.info("No battery detected, battery sampler not started");
            watch::channel(SmoothedBatteryState::default()).1
        };

        let (mut poller, channels) = InverterPoller::new(
            Arc::clone(&connection),
            capabilities,
            &config.inverter,
            config.battery.soc_source,
            initial,
        );
        if capabilities.has_battery {
            poller = poller.with_battery_state(battery_rx.clone());
        }
        if let Some(store) = store {
            poller = poller.with_store(store);
        }
        tasks.push(tokio::spawn(poller.run(shutdown_rx.clone())));

        let schedule_rx = match source {
            Some(source) => {
                let (outage, rx) = OutagePoller::new(source, &config.outage, timezone);
                tasks.push(tokio::spawn(outage.run(shutdown_rx.clone())));
                Some(rx)
            }
            None => {
                logger.info("Outage schedule polling disabled");
                None
            }
        };

        logger.info(&format!(
            "Monitor started: {} phase(s), battery {}, {} PV string(s)",
            capabilities.phase_count, capabilities.has_battery, capabilities.pv_string_count
        ));

        Ok(MonitorHandle {
            config,
            timezone,
            capabilities,
            connection,
            snapshot_rx: channels.snapshot,
            phase_rx: channels.phase,
            battery_rx,
            schedule_rx,
            shutdown_tx,
            tasks,
            logger,
        })
    }
}

fn load_initial(
    store: &dyn SnapshotStore,
    capabilities: &DeviceCapabilities,
    logger: &StructuredLogger,
) -> Option<TelemetrySnapshot> {
    match store.load_last_known_good() {
        Ok(Some(snapshot)) if snapshot.layout == RegisterLayout::for_capabilities(capabilities) => {
            Some(snapshot)
        }
        Ok(Some(_)) => {
            logger.info("Cached snapshot uses a different register layout, ignoring it");
            None
        }
        Ok(None) => None,
        Err(e) => {
            logger.warn(&format!("Failed to load cached snapshot: {}", e));
            None
        }
    }
}

/// Query and shutdown handle for a running monitor
pub struct MonitorHandle {
    config: Config,
    timezone: Tz,
    capabilities: DeviceCapabilities,
    connection: Arc<DeviceConnection>,
    snapshot_rx: SnapshotReceiver,
    phase_rx: watch::Receiver<PollPhase>,
    battery_rx: watch::Receiver<SmoothedBatteryState>,
    schedule_rx: Option<watch::Receiver<ScheduleState>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    logger: StructuredLogger,
}

impl MonitorHandle {
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn latest_telemetry(&self) -> Telemetry {
        self.latest_telemetry_at(Utc::now())
    }

    /// Latest snapshot unless it is older than `inverter.stale_after_secs`.
    pub fn latest_telemetry_at(&self, now: DateTime<Utc>) -> Telemetry {
        match self.snapshot_rx.borrow().as_ref() {
            Some(snapshot)
                if snapshot.age_secs(now) <= self.config.inverter.stale_after_secs as i64 =>
            {
                Telemetry::Snapshot(Arc::clone(snapshot))
            }
            _ => Telemetry::Unavailable,
        }
    }

    pub fn smoothed_battery(&self) -> SmoothedBatteryState {
        self.battery_rx.borrow().clone()
    }

    pub fn poll_phase(&self) -> PollPhase {
        *self.phase_rx.borrow()
    }

    pub fn device_stats(&self) -> SessionStatsSnapshot {
        self.connection.stats()
    }

    fn local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.timezone).naive_local()
    }

    pub fn schedule_state(&self) -> Option<ScheduleState> {
        self.schedule_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn outage_status(&self, now: DateTime<Utc>) -> OutageStatus {
        match &self.schedule_rx {
            Some(rx) => rx
                .borrow()
                .status_at(self.local(now), self.config.outage.staleness_threshold),
            None => OutageStatus::Unknown,
        }
    }

    /// The active or next outage window, if the schedule is fresh.
    pub fn next_outage_window(&self, now: DateTime<Utc>) -> Option<OutageWindow> {
        let rx = self.schedule_rx.as_ref()?;
        let state = rx.borrow();
        if state.is_stale(self.config.outage.staleness_threshold) {
            return None;
        }
        state.schedule.as_ref()?.next_window(self.local(now))
    }

    /// Energy figures for `window` at the current load; `None` without a
    /// battery or before any data is available.
    pub fn survival_estimate(&self, window: &OutageWindow) -> Option<SurvivalEstimate> {
        if !self.capabilities.has_battery {
            return None;
        }
        let Telemetry::Snapshot(snapshot) = self.latest_telemetry() else {
            return None;
        };

        let smoothed = self.smoothed_battery();
        let smoothed_soc = match self.config.battery.soc_source {
            SocSource::VoltageCurve => smoothed.soc_percent,
            SocSource::Register => smoothed.soc_register,
        };
        let soc = smoothed_soc.or(snapshot.battery.as_ref().map(|b| b.soc_percent))?;

        Some(estimate_for_hours(
            f64::from(soc),
            self.config.battery.capacity_kwh,
            snapshot.load_power_w,
            window.duration_hours(),
        ))
    }

    pub fn estimate_survival(&self, window: &OutageWindow) -> Option<SurvivalVerdict> {
        self.survival_estimate(window).map(|e| e.verdict)
    }

    /// Signal every worker and wait for them to finish their current cycle.
    pub async fn shutdown(self) {
        self.logger.info("Shutting down monitor");
        self.shutdown_tx.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                self.logger.error(&format!("Worker task ended abnormally: {}", e));
            }
        }
        self.logger.info("Monitor stopped");
    }
}
