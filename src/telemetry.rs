//! Decoded inverter telemetry
//!
//! [`decode_snapshot`] is a pure function of the register layout, the
//! capabilities and the raw words read during one cycle. The poller builds a
//! complete [`TelemetrySnapshot`] before publishing it; nothing ever mutates a
//! published snapshot.

use crate::battery::SmoothedBatteryState;
use crate::battery::soc::voltage_to_soc;
use crate::config::SocSource;
use crate::device::DeviceCapabilities;
use crate::error::{PowerwatchError, Result};
use crate::registers::{Field, RawRegisters, ReadPlan, RegisterLayout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Battery energy flow, from the sign of the battery current
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryFlow {
    Charging,
    Discharging,
    Idle,
}

/// Grid energy flow, from the sign of the grid power
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridFlow {
    Importing,
    Exporting,
    Idle,
}

impl BatteryFlow {
    pub fn from_current(current_a: f64) -> Self {
        if current_a > 0.0 {
            BatteryFlow::Charging
        } else if current_a < 0.0 {
            BatteryFlow::Discharging
        } else {
            BatteryFlow::Idle
        }
    }
}

impl GridFlow {
    pub fn from_power(power_w: f64) -> Self {
        if power_w > 0.0 {
            GridFlow::Importing
        } else if power_w < 0.0 {
            GridFlow::Exporting
        } else {
            GridFlow::Idle
        }
    }
}

/// Battery part of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryTelemetry {
    pub voltage_v: f64,
    /// Positive while charging
    pub current_a: f64,
    pub soc_percent: u8,
    /// SOC register as reported by the inverter
    pub soc_register: u8,
    pub soc_source: SocSource,
    /// Voltage and SOC come from the smoothed sampler state
    pub smoothed: bool,
    pub power_w: i32,
    pub flow: BatteryFlow,
}

/// Energy counters since local midnight
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DailyEnergy {
    pub pv_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub load_kwh: f64,
}

/// One complete, immutable telemetry reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,
    pub layout: RegisterLayout,
    /// False while a snapshot restored from disk is being served
    pub valid: bool,
    /// Per-string PV power; `None` when the string is not fitted
    pub pv_power_w: Vec<Option<f64>>,
    pub pv_total_power_w: f64,
    pub battery: Option<BatteryTelemetry>,
    pub grid_voltage_v: f64,
    /// Positive while importing
    pub grid_power_w: f64,
    pub grid_flow: GridFlow,
    pub load_power_w: f64,
    pub phase_loads_w: Vec<f64>,
    pub phase_voltages_v: Vec<f64>,
    pub dc_temperature_c: f64,
    pub heatsink_temperature_c: f64,
    pub daily: DailyEnergy,
}

struct FieldReader<'a> {
    layout: RegisterLayout,
    raw: &'a RawRegisters,
}

impl FieldReader<'_> {
    /// Decoded value; `Ok(None)` only for absent PV strings.
    fn optional(&self, field: Field) -> Result<Option<f64>> {
        let spec = self.layout.spec(field).ok_or_else(|| {
            PowerwatchError::protocol(format!("{:?} has no {:?} register", self.layout, field))
        })?;
        let raw = self.raw.get(spec.address).ok_or_else(|| {
            PowerwatchError::protocol(format!(
                "Register {} ({:?}) missing from cycle",
                spec.address, field
            ))
        })?;
        Ok(spec.decode(raw))
    }

    fn value(&self, field: Field) -> Result<f64> {
        Ok(self.optional(field)?.unwrap_or(0.0))
    }
}

/// Decode the words read for `plan` into a snapshot.
pub fn decode_snapshot(
    plan: &ReadPlan,
    capabilities: &DeviceCapabilities,
    raw: &RawRegisters,
    timestamp: DateTime<Utc>,
) -> Result<TelemetrySnapshot> {
    let layout = plan.layout;
    let read = FieldReader { layout, raw };

    let mut pv_power_w = vec![read.optional(Field::Pv1Power)?];
    if capabilities.pv_string_count >= 2 {
        pv_power_w.push(read.optional(Field::Pv2Power)?);
    }
    let pv_total_power_w = pv_power_w.iter().flatten().sum();

    let battery = if capabilities.has_battery {
        let voltage_v = read.value(Field::BatteryVoltage)?;
        let current_a = read.value(Field::BatteryCurrent)?;
        let soc_register = read.value(Field::BatterySoc)?.clamp(0.0, 100.0) as u8;
        Some(BatteryTelemetry {
            voltage_v,
            current_a,
            soc_percent: voltage_to_soc(voltage_v),
            soc_register,
            soc_source: SocSource::VoltageCurve,
            smoothed: false,
            power_w: (voltage_v * current_a) as i32,
            flow: BatteryFlow::from_current(current_a),
        })
    } else {
        None
    };

    let grid_power_w = read.value(Field::GridPower)?;

    let phase_loads_w = layout
        .phase_load_fields()
        .iter()
        .map(|field| read.value(*field))
        .collect::<Result<Vec<_>>>()?;
    let phase_voltages_v = layout
        .phase_voltage_fields()
        .iter()
        .map(|field| read.value(*field))
        .collect::<Result<Vec<_>>>()?;

    Ok(TelemetrySnapshot {
        timestamp,
        layout,
        valid: true,
        pv_power_w,
        pv_total_power_w,
        battery,
        grid_voltage_v: read.value(Field::GridVoltage)?,
        grid_power_w,
        grid_flow: GridFlow::from_power(grid_power_w),
        load_power_w: read.value(Field::LoadPower)?,
        phase_loads_w,
        phase_voltages_v,
        dc_temperature_c: read.value(Field::DcTemperature)?,
        heatsink_temperature_c: read.value(Field::HeatsinkTemperature)?,
        daily: DailyEnergy {
            pv_kwh: read.value(Field::DailyPv)?,
            grid_import_kwh: read.value(Field::DailyGridImport)?,
            grid_export_kwh: read.value(Field::DailyGridExport)?,
            load_kwh: read.value(Field::DailyLoad)?,
        },
    })
}

impl TelemetrySnapshot {
    /// Settle battery voltage and SOC from the smoothed sampler state and
    /// the configured SOC source.
    pub fn with_battery_state(
        mut self,
        smoothed: &SmoothedBatteryState,
        soc_source: SocSource,
    ) -> Self {
        if let Some(battery) = self.battery.as_mut() {
            if let Some(mean) = smoothed.voltage_v {
                battery.voltage_v = mean;
                battery.smoothed = true;
                battery.power_w = (mean * battery.current_a) as i32;
            }
            battery.soc_source = soc_source;
            battery.soc_percent = match soc_source {
                SocSource::VoltageCurve => voltage_to_soc(battery.voltage_v),
                SocSource::Register => battery.soc_register,
            };
        }
        self
    }

    /// Mark a snapshot loaded from the store; a live cycle replaces it.
    pub fn restored(mut self) -> Self {
        self.valid = false;
        self
    }

    /// Seconds since the snapshot was taken.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::ReadPlan;
    use chrono::TimeZone;

    fn three_phase_caps() -> DeviceCapabilities {
        DeviceCapabilities::default()
    }

    fn sample_raw() -> RawRegisters {
        let mut raw = RawRegisters::default();
        for (address, word) in [
            (514, 1500),
            (515, 0xFFFF),
            (586, 0xFF38),
            (587, 5312),
            (588, 63),
            (598, 2304),
            (607, 65_036),
            (653, 820),
            (650, 300),
            (651, 260),
            (652, 260),
            (644, 2301),
            (645, 2299),
            (646, 2310),
            (540, 1345),
            (541, 1400),
            (502, 124),
            (520, 31),
            (521, 57),
            (526, 98),
        ] {
            raw.insert(address, word);
        }
        raw
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_decode_three_phase() {
        let caps = three_phase_caps();
        let plan = ReadPlan::full(&caps, 8, 64);
        let snap = decode_snapshot(&plan, &caps, &sample_raw(), ts()).unwrap();

        assert_eq!(snap.pv_power_w, vec![Some(1500.0), None]);
        assert_eq!(snap.pv_total_power_w, 1500.0);
        let battery = snap.battery.as_ref().unwrap();
        assert!((battery.voltage_v - 53.12).abs() < 1e-9);
        assert!((battery.current_a - 2.0).abs() < 1e-9);
        assert_eq!(battery.flow, BatteryFlow::Charging);
        assert_eq!(battery.power_w, 106);
        assert_eq!(battery.soc_register, 63);
        assert_eq!(snap.grid_power_w, -500.0);
        assert_eq!(snap.grid_flow, GridFlow::Exporting);
        assert_eq!(snap.phase_loads_w, vec![300.0, 260.0, 260.0]);
        assert_eq!(snap.phase_voltages_v.len(), 3);
        assert!((snap.daily.pv_kwh - 12.4).abs() < 1e-9);
    }

    #[test]
    fn test_decode_is_pure() {
        let caps = three_phase_caps();
        let plan = ReadPlan::full(&caps, 8, 64);
        let a = decode_snapshot(&plan, &caps, &sample_raw(), ts()).unwrap();
        let b = decode_snapshot(&plan, &caps, &sample_raw(), ts()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_register_fails() {
        let caps = three_phase_caps();
        let plan = ReadPlan::full(&caps, 8, 64);
        let mut raw = RawRegisters::default();
        raw.insert(514, 100);
        assert!(decode_snapshot(&plan, &caps, &raw, ts()).is_err());
    }

    #[test]
    fn test_no_battery() {
        let caps = DeviceCapabilities {
            has_battery: false,
            pv_string_count: 1,
            ..three_phase_caps()
        };
        let plan = ReadPlan::full(&caps, 8, 64);
        let snap = decode_snapshot(&plan, &caps, &sample_raw(), ts()).unwrap();
        assert!(snap.battery.is_none());
        assert_eq!(snap.pv_power_w.len(), 1);
    }

    #[test]
    fn test_smoothed_state_overrides_instantaneous() {
        let caps = three_phase_caps();
        let plan = ReadPlan::full(&caps, 8, 64);
        let snap = decode_snapshot(&plan, &caps, &sample_raw(), ts()).unwrap();

        let smoothed = SmoothedBatteryState {
            voltage_v: Some(52.0),
            ..SmoothedBatteryState::default()
        };
        let merged = snap
            .clone()
            .with_battery_state(&smoothed, SocSource::VoltageCurve);
        let battery = merged.battery.unwrap();
        assert!(battery.smoothed);
        assert_eq!(battery.voltage_v, 52.0);
        assert_eq!(battery.soc_percent, 50);

        let register =
            snap.with_battery_state(&SmoothedBatteryState::default(), SocSource::Register);
        assert_eq!(register.battery.unwrap().soc_percent, 63);
    }

    #[test]
    fn test_flows() {
        assert_eq!(BatteryFlow::from_current(-1.5), BatteryFlow::Discharging);
        assert_eq!(BatteryFlow::from_current(0.0), BatteryFlow::Idle);
        assert_eq!(GridFlow::from_power(10.0), GridFlow::Importing);
        assert_eq!(GridFlow::from_power(0.0), GridFlow::Idle);
    }
}
