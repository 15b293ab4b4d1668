//! Scheduled power outages
//!
//! A schedule source publishes today's planned outages as free text or
//! JSON. The poller turns that into an [`OutageSchedule`]: an ordered,
//! non-overlapping list of [`OutageWindow`]s. Status is computed from the
//! held windows and a local wall-clock time only, so it can be evaluated at
//! any instant without touching the network.

use crate::error::{PowerwatchError, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

pub mod parse;
pub mod poller;
pub mod provider;

pub use poller::{OutagePoller, ScheduleState};
pub use provider::{LvivoblenergoSource, ScheduleSource, YasnoSource, source_from_config};

/// One planned outage, `[start, end)` in local time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutageWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl OutageWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if end <= start {
            return Err(PowerwatchError::parse(format!(
                "Outage window ends before it starts: {} - {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Build a window from wall-clock times on `date`; `24:00` is the
    /// following midnight.
    pub fn from_clock(date: NaiveDate, start: (u32, u32), end: (u32, u32)) -> Result<Self> {
        Self::new(clock_on(date, start)?, clock_on(date, end)?)
    }

    /// Build a window from minutes since midnight on `date`.
    pub fn from_minutes(date: NaiveDate, start_min: u32, end_min: u32) -> Result<Self> {
        Self::from_clock(
            date,
            (start_min / 60, start_min % 60),
            (end_min / 60, end_min % 60),
        )
    }

    /// Start-inclusive, end-exclusive.
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.start <= at && at < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration().num_seconds() as f64 / 3600.0
    }
}

fn clock_on(date: NaiveDate, (hour, minute): (u32, u32)) -> Result<NaiveDateTime> {
    let midnight = date.and_time(NaiveTime::MIN);
    if hour == 24 && minute == 0 {
        return Ok(midnight + Duration::days(1));
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
        .map(|time| date.and_time(time))
        .ok_or_else(|| {
            PowerwatchError::parse(format!("Invalid clock time {:02}:{:02}", hour, minute))
        })
}

/// What the schedule says about a given instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutageStatus {
    /// Inside a window
    Active {
        window: OutageWindow,
        remaining_minutes: i64,
    },
    /// Power is on, at least one window still ahead
    Upcoming {
        /// Future windows, earliest first
        windows: Vec<OutageWindow>,
        /// End of the latest finished window, or midnight
        power_since: NaiveDateTime,
    },
    /// Nothing planned for the rest of the day
    Clear,
    /// No usable schedule
    Unknown,
}

impl OutageStatus {
    pub fn label(&self) -> &'static str {
        match self {
            OutageStatus::Active { .. } => "active",
            OutageStatus::Upcoming { .. } => "upcoming",
            OutageStatus::Clear => "clear",
            OutageStatus::Unknown => "unknown",
        }
    }
}

/// Today's windows, sorted and merged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutageSchedule {
    pub date: NaiveDate,
    windows: Vec<OutageWindow>,
}

impl OutageSchedule {
    /// Sort `windows` and merge any that overlap or touch.
    pub fn new(date: NaiveDate, mut windows: Vec<OutageWindow>) -> Self {
        windows.retain(|w| w.end > w.start);
        windows.sort();

        let mut merged: Vec<OutageWindow> = Vec::with_capacity(windows.len());
        for window in windows {
            match merged.last_mut() {
                Some(last) if window.start <= last.end => {
                    last.end = last.end.max(window.end);
                }
                _ => merged.push(window),
            }
        }
        Self {
            date,
            windows: merged,
        }
    }

    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            windows: Vec::new(),
        }
    }

    pub fn windows(&self) -> &[OutageWindow] {
        &self.windows
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn status_at(&self, now: NaiveDateTime) -> OutageStatus {
        if let Some(window) = self.windows.iter().find(|w| w.contains(now)) {
            return OutageStatus::Active {
                window: *window,
                remaining_minutes: (window.end - now).num_minutes(),
            };
        }

        let upcoming: Vec<OutageWindow> = self
            .windows
            .iter()
            .filter(|w| now < w.start)
            .copied()
            .collect();
        if upcoming.is_empty() {
            return OutageStatus::Clear;
        }

        let power_since = self
            .windows
            .iter()
            .filter(|w| w.end <= now)
            .map(|w| w.end)
            .next_back()
            .unwrap_or_else(|| self.date.and_time(NaiveTime::MIN));

        OutageStatus::Upcoming {
            windows: upcoming,
            power_since,
        }
    }

    /// The active window, or else the next one to start.
    pub fn next_window(&self, now: NaiveDateTime) -> Option<OutageWindow> {
        self.windows.iter().find(|w| now < w.end).copied()
    }
}
