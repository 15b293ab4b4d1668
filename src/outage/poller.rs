use super::provider::ScheduleSource;
use super::{OutageSchedule, OutageStatus};
use crate::config::OutageConfig;
use crate::error::Result;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

/// Published schedule plus its freshness
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleState {
    /// Last successfully parsed schedule; kept across failed refreshes
    pub schedule: Option<OutageSchedule>,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ScheduleState {
    pub fn is_stale(&self, threshold: u32) -> bool {
        self.consecutive_failures >= threshold
    }

    /// Status at local time `now`; `Unknown` without a fresh schedule.
    pub fn status_at(&self, now: NaiveDateTime, threshold: u32) -> OutageStatus {
        match &self.schedule {
            Some(schedule) if !self.is_stale(threshold) => schedule.status_at(now),
            _ => OutageStatus::Unknown,
        }
    }
}

/// Periodically refreshes today's schedule from a [`ScheduleSource`]
pub struct OutagePoller {
    source: Arc<dyn ScheduleSource>,
    timezone: Tz,
    poll_interval: Duration,
    state_tx: watch::Sender<ScheduleState>,
    logger: StructuredLogger,
}

impl OutagePoller {
    pub fn new(
        source: Arc<dyn ScheduleSource>,
        config: &OutageConfig,
        timezone: Tz,
    ) -> (Self, watch::Receiver<ScheduleState>) {
        let (state_tx, state_rx) = watch::channel(ScheduleState::default());
        let logger = get_logger_with_context(
            LogContext::new("outage")
                .with_field("provider", source.name().to_string())
                .with_field("group", config.group.clone()),
        );
        let poller = Self {
            source,
            timezone,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            state_tx,
            logger,
        };
        (poller, state_rx)
    }

    /// Fetch and parse once, dated by the local day of `now`. On failure the
    /// previous schedule stays in place and the failure counter grows.
    pub async fn refresh_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let date = now.with_timezone(&self.timezone).date_naive();
        let result = match self.source.fetch_document().await {
            Ok(document) => self.source.parse_windows(&document, date),
            Err(e) => Err(e),
        };

        match result {
            Ok(windows) => {
                let schedule = OutageSchedule::new(date, windows);
                let count = schedule.windows().len();
                self.logger.info(&format!(
                    "Outage schedule for {} updated: {:?}",
                    date,
                    schedule
                        .windows()
                        .iter()
                        .map(|w| format!("{}-{}", w.start.format("%H:%M"), w.end.format("%H:%M")))
                        .collect::<Vec<_>>()
                ));
                self.state_tx.send_modify(|state| {
                    state.schedule = Some(schedule);
                    state.consecutive_failures = 0;
                    state.last_success = Some(now);
                    state.last_error = None;
                });
                Ok(count)
            }
            Err(e) => {
                self.state_tx.send_modify(|state| {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    state.last_error = Some(e.to_string());
                });
                self.logger.warn(&format!(
                    "Outage schedule refresh failed ({} in a row): {}",
                    self.state_tx.borrow().consecutive_failures,
                    e
                ));
                Err(e)
            }
        }
    }

    pub async fn refresh_once(&self) -> Result<usize> {
        self.refresh_at(Utc::now()).await
    }

    /// Refresh every poll interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.logger.info(&format!(
            "Outage poller started, interval {}s",
            self.poll_interval.as_secs()
        ));
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    // Failures are already logged and counted
                    let _ = self.refresh_once().await;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        self.logger.info("Outage poller stopped");
    }
}
