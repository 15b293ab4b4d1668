use super::DeviceConnection;
use crate::config::CapabilitiesConfig;
use crate::logging::get_logger;
use crate::registers::{Field, PV_ABSENT, RegisterLayout};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// What the inverter has attached. Frozen after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub phase_count: u8,
    pub has_battery: bool,
    pub pv_string_count: u8,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            phase_count: 3,
            has_battery: true,
            pv_string_count: 2,
        }
    }
}

/// One probe round. Registers are read at their three-phase addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReading {
    /// L2 and L3 grid voltage, raw (0.1 V)
    pub phase_voltages_raw: [u16; 2],
    /// Battery voltage, raw (0.01 V)
    pub battery_voltage_raw: u16,
    /// PV2 power, raw (W)
    pub pv2_power_raw: u16,
}

const PHASE_PRESENT_V: f64 = 50.0;
const BATTERY_PRESENT_V: f64 = 10.0;

/// Combine probe rounds with configured overrides.
///
/// Any round showing a phase, battery or second string wins. A second PV
/// string that only ever reads zero is assumed present (panels are dark at
/// night); one that reads the absent marker is not.
pub fn resolve_capabilities(
    readings: &[ProbeReading],
    overrides: &CapabilitiesConfig,
) -> DeviceCapabilities {
    let logger = get_logger("detect");

    let three_phase = readings.iter().any(|r| {
        r.phase_voltages_raw
            .iter()
            .any(|raw| f64::from(*raw) / 10.0 > PHASE_PRESENT_V)
    });
    let has_battery = readings
        .iter()
        .any(|r| f64::from(r.battery_voltage_raw) / 100.0 > BATTERY_PRESENT_V);
    let pv2_seen = readings
        .iter()
        .any(|r| r.pv2_power_raw > 0 && r.pv2_power_raw != PV_ABSENT);
    let pv2_marked_absent = readings.iter().any(|r| r.pv2_power_raw == PV_ABSENT);

    let pv_strings = if pv2_seen {
        2
    } else if pv2_marked_absent {
        1
    } else {
        if !readings.is_empty() && overrides.pv_strings.is_none() {
            logger.warn(
                "PV2 power was 0 in all samples (unreliable at night), defaulting to 2 strings",
            );
        }
        2
    };

    let detected = if readings.is_empty() {
        DeviceCapabilities::default()
    } else {
        DeviceCapabilities {
            phase_count: if three_phase { 3 } else { 1 },
            has_battery,
            pv_string_count: pv_strings,
        }
    };

    DeviceCapabilities {
        phase_count: overrides.phases.unwrap_or(detected.phase_count),
        has_battery: overrides.has_battery.unwrap_or(detected.has_battery),
        pv_string_count: overrides.pv_strings.unwrap_or(detected.pv_string_count),
    }
}

fn fully_pinned(overrides: &CapabilitiesConfig) -> Option<DeviceCapabilities> {
    Some(DeviceCapabilities {
        phase_count: overrides.phases?,
        has_battery: overrides.has_battery?,
        pv_string_count: overrides.pv_strings?,
    })
}

/// Probe the device a few times and decide what it has.
///
/// Failed rounds are skipped; when every round fails the full-featured
/// default is used so that nothing is silently left unpolled.
pub async fn detect_capabilities(
    connection: &DeviceConnection,
    overrides: &CapabilitiesConfig,
) -> DeviceCapabilities {
    let logger = get_logger("detect");

    if let Some(pinned) = fully_pinned(overrides) {
        logger.info(&format!("Using configured capabilities: {:?}", pinned));
        return pinned;
    }

    let layout = RegisterLayout::ThreePhase;
    let (Some(l2_addr), Some(battery_addr), Some(pv2_addr)) = (
        layout.address_of(Field::VoltageL2),
        layout.address_of(Field::BatteryVoltage),
        layout.address_of(Field::Pv2Power),
    ) else {
        logger.error("Probe registers missing from the three-phase layout");
        return resolve_capabilities(&[], overrides);
    };

    let rounds = overrides.detection_samples.max(1);
    let mut readings = Vec::with_capacity(rounds as usize);

    for round in 0..rounds {
        let result = connection
            .with_session(move |s| {
                Box::pin(async move {
                    let phases = s.read_registers(l2_addr, 2).await?;
                    let battery = s.read_registers(battery_addr, 1).await?;
                    let pv2 = s.read_registers(pv2_addr, 1).await?;
                    Ok(ProbeReading {
                        phase_voltages_raw: [phases[0], phases[1]],
                        battery_voltage_raw: battery[0],
                        pv2_power_raw: pv2[0],
                    })
                })
            })
            .await;

        match result {
            Ok(reading) => readings.push(reading),
            Err(e) => logger.warn(&format!("Probe round {} failed: {}", round + 1, e)),
        }

        if round + 1 < rounds {
            sleep(Duration::from_millis(overrides.detection_interval_ms)).await;
        }
    }

    if readings.is_empty() {
        logger.warn("Every probe round failed, assuming a fully equipped inverter");
    }

    let capabilities = resolve_capabilities(&readings, overrides);
    logger.info(&format!("Detected capabilities: {:?}", capabilities));
    capabilities
}
