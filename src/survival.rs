//! Will the battery carry the load through an outage window?

use crate::outage::OutageWindow;
use serde::{Deserialize, Serialize};

/// Stored energy must cover the need with this much headroom to survive.
pub const SURVIVE_MARGIN: f64 = 1.10;
/// Below this share of the need the outage cannot be bridged.
pub const TIGHT_MARGIN: f64 = 0.70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurvivalVerdict {
    Survive,
    Tight,
    Insufficient,
}

/// Energy figures behind a verdict
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurvivalEstimate {
    pub verdict: SurvivalVerdict,
    pub available_kwh: f64,
    pub needed_kwh: f64,
    pub hours: f64,
}

pub fn estimate(
    soc_percent: f64,
    capacity_kwh: f64,
    load_watts: f64,
    window: &OutageWindow,
) -> SurvivalVerdict {
    estimate_for_hours(soc_percent, capacity_kwh, load_watts, window.duration_hours()).verdict
}

pub fn estimate_for_hours(
    soc_percent: f64,
    capacity_kwh: f64,
    load_watts: f64,
    hours: f64,
) -> SurvivalEstimate {
    let available_kwh = capacity_kwh * soc_percent.clamp(0.0, 100.0) / 100.0;
    let needed_kwh = load_watts / 1000.0 * hours;

    let verdict = if needed_kwh <= 0.0 || available_kwh >= needed_kwh * SURVIVE_MARGIN {
        SurvivalVerdict::Survive
    } else if available_kwh >= needed_kwh * TIGHT_MARGIN {
        SurvivalVerdict::Tight
    } else {
        SurvivalVerdict::Insufficient
    };

    SurvivalEstimate {
        verdict,
        available_kwh,
        needed_kwh,
        hours,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        // 16 kWh at 50% = 8 kWh; 2 kW for 4 h = 8 kWh
        let verdict = |soc: f64| estimate_for_hours(soc, 16.0, 2000.0, 4.0).verdict;
        assert_eq!(verdict(50.0), SurvivalVerdict::Tight);
        assert_eq!(verdict(56.0), SurvivalVerdict::Survive);
        assert_eq!(verdict(34.0), SurvivalVerdict::Insufficient);
    }

    #[test]
    fn test_no_load_survives() {
        let e = estimate_for_hours(0.0, 16.0, 0.0, 4.0);
        assert_eq!(e.verdict, SurvivalVerdict::Survive);
        assert_eq!(e.needed_kwh, 0.0);
    }

    #[test]
    fn test_soc_is_clamped() {
        let e = estimate_for_hours(150.0, 10.0, 1000.0, 1.0);
        assert_eq!(e.available_kwh, 10.0);
        assert_eq!(estimate_for_hours(-5.0, 10.0, 1000.0, 1.0).available_kwh, 0.0);
    }
}
