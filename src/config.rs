//! Configuration management for Powerwatch
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files with support for environment variable overrides.

use crate::error::{PowerwatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection to the inverter's data logger
    pub device: DeviceConfig,

    /// Pinned device capabilities (skip auto-detection when set)
    pub capabilities: CapabilitiesConfig,

    /// Full telemetry polling
    pub inverter: InverterConfig,

    /// Battery sampling, smoothing and sizing
    pub battery: BatteryConfig,

    /// Outage schedule source
    pub outage: OutageConfig,

    /// Last-known-good snapshot file
    pub persistence: PersistenceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Timezone the outage schedule is published in
    pub timezone: String,
}

/// Wire protocol spoken by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    /// Solarman V5 framing around Modbus RTU (Wi-Fi data logger stick)
    SolarmanV5,
    /// Plain Modbus TCP (RS485 gateway)
    ModbusTcp,
}

/// Device connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Data logger IP address or hostname
    pub ip: String,

    /// Data logger TCP port
    pub port: u16,

    pub protocol: TransportProtocol,

    /// Data logger serial number (Solarman only)
    pub logger_serial: Option<u32>,

    /// Modbus unit id of the inverter
    pub slave_id: u8,

    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,

    /// Minimum spacing between two register reads in one cycle
    pub inter_read_delay_ms: u64,

    /// Upper bound on waiting for the shared device lock
    pub lock_timeout_ms: u64,
}

/// Capability overrides and detection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitiesConfig {
    pub phases: Option<u8>,
    pub has_battery: Option<bool>,
    pub pv_strings: Option<u8>,

    /// Probe rounds during auto-detection
    pub detection_samples: u32,

    /// Delay between probe rounds
    pub detection_interval_ms: u64,
}

/// Inverter poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    pub poll_interval_secs: u64,

    /// Snapshots older than this are reported as unavailable
    pub stale_after_secs: u64,

    /// Largest hole (in registers) bridged when merging reads into one block
    pub max_block_gap: u16,

    /// Largest block read in one request
    pub max_block_len: u16,
}

/// Where the reported state of charge comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocSource {
    /// Interpolate the LiFePO4 discharge curve from the smoothed voltage
    VoltageCurve,
    /// Trust the inverter's SOC register
    Register,
}

/// Battery sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// Usable capacity in kWh
    pub capacity_kwh: f64,

    pub sample_interval_secs: u64,

    /// Ring buffer capacity
    pub buffer_size: usize,

    /// Deviation from the mean (volts) above which a sample is an outlier
    pub outlier_threshold_v: f64,

    /// Samples needed before the mean is trusted for rejection
    pub min_trusted_samples: usize,

    /// Rejections in a row after which the new level is accepted
    pub max_consecutive_rejections: usize,

    pub min_plausible_v: f64,
    pub max_plausible_v: f64,

    pub soc_source: SocSource,
}

/// Outage schedule provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutageProvider {
    None,
    Lvivoblenergo,
    Yasno,
}

/// Outage schedule poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutageConfig {
    pub provider: OutageProvider,

    /// Queue/group id as published by the grid operator, e.g. "4.1"
    pub group: String,

    /// Yasno region id
    pub region_id: u32,

    /// Yasno distribution operator id
    pub dso_id: u32,

    pub poll_interval_secs: u64,

    /// Failed refreshes in a row before the status degrades to unknown
    pub staleness_threshold: u32,

    pub request_timeout_secs: u64,

    pub lvivoblenergo_url: String,

    /// May contain `{region_id}` and `{dso_id}` placeholders
    pub yasno_url: String,
}

/// Snapshot persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,

    /// JSON file holding the last published snapshot
    pub cache_file: String,

    /// Cached snapshots older than this are ignored at startup
    pub max_age_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Directory or file path for rotated logs
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("POWERWATCH_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(path)?,
            _ => Self::from_default_paths()?,
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn from_default_paths() -> Result<Self> {
        let default_paths = [
            "powerwatch.yaml",
            "/data/powerwatch.yaml",
            "/etc/powerwatch/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(ip) = get("INVERTER_IP") {
            self.device.ip = ip;
        }
        if let Some(port) = get("INVERTER_PORT") {
            self.device.port = parse_env("INVERTER_PORT", &port)?;
        }
        if let Some(serial) = get("LOGGER_SERIAL") {
            self.device.logger_serial = Some(parse_env("LOGGER_SERIAL", &serial)?);
        }
        if let Some(protocol) = get("INVERTER_PROTOCOL") {
            self.device.protocol = match protocol.to_lowercase().as_str() {
                "solarman" | "solarman_v5" => TransportProtocol::SolarmanV5,
                "modbus" | "modbus_tcp" => TransportProtocol::ModbusTcp,
                other => {
                    return Err(PowerwatchError::validation(
                        "INVERTER_PROTOCOL".to_string(),
                        format!("unknown protocol '{}'", other),
                    ));
                }
            };
        }
        if let Some(phases) = get("INVERTER_PHASES") {
            self.capabilities.phases = Some(parse_env("INVERTER_PHASES", &phases)?);
        }
        if let Some(has_battery) = get("INVERTER_HAS_BATTERY") {
            self.capabilities.has_battery = Some(matches!(
                has_battery.to_lowercase().as_str(),
                "true" | "1" | "yes"
            ));
        }
        if let Some(strings) = get("INVERTER_PV_STRINGS") {
            self.capabilities.pv_strings = Some(parse_env("INVERTER_PV_STRINGS", &strings)?);
        }
        if let Some(provider) = get("OUTAGE_PROVIDER") {
            self.outage.provider = match provider.to_lowercase().as_str() {
                "none" | "off" => OutageProvider::None,
                "lvivoblenergo" | "loe" => OutageProvider::Lvivoblenergo,
                "yasno" => OutageProvider::Yasno,
                other => {
                    return Err(PowerwatchError::validation(
                        "OUTAGE_PROVIDER".to_string(),
                        format!("unknown provider '{}'", other),
                    ));
                }
            };
        }
        if let Some(group) = get("OUTAGE_GROUP") {
            self.outage.group = group;
        }
        if let Some(region) = get("OUTAGE_REGION_ID") {
            self.outage.region_id = parse_env("OUTAGE_REGION_ID", &region)?;
        }
        if let Some(dso) = get("OUTAGE_DSO_ID") {
            self.outage.dso_id = parse_env("OUTAGE_DSO_ID", &dso)?;
        }
        if let Some(file) = get("INVERTER_CACHE_FILE") {
            self.persistence.cache_file = file;
        }
        if let Some(tz) = get("POWERWATCH_TIMEZONE") {
            self.timezone = tz;
        }
        if let Some(capacity) = get("BATTERY_CAPACITY_KWH") {
            self.battery.capacity_kwh = parse_env("BATTERY_CAPACITY_KWH", &capacity)?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.device.ip.is_empty() {
            return Err(PowerwatchError::validation(
                "device.ip",
                "Inverter address must be configured",
            ));
        }

        if self.device.port == 0 {
            return Err(PowerwatchError::validation(
                "device.port",
                "Port must be greater than 0",
            ));
        }

        if self.device.protocol == TransportProtocol::SolarmanV5
            && self.device.logger_serial.unwrap_or(0) == 0
        {
            return Err(PowerwatchError::validation(
                "device.logger_serial",
                "Logger serial is required for the Solarman protocol",
            ));
        }

        if self.device.read_timeout_ms == 0 || self.device.connect_timeout_ms == 0 {
            return Err(PowerwatchError::validation(
                "device.timeouts",
                "Timeouts must be greater than 0",
            ));
        }

        if let Some(phases) = self.capabilities.phases
            && phases != 1
            && phases != 3
        {
            return Err(PowerwatchError::validation(
                "capabilities.phases",
                "Must be 1 or 3",
            ));
        }

        if self.inverter.poll_interval_secs == 0 || self.battery.sample_interval_secs == 0 {
            return Err(PowerwatchError::validation(
                "poll_interval",
                "Must be greater than 0",
            ));
        }

        if self.inverter.max_block_len == 0 {
            return Err(PowerwatchError::validation(
                "inverter.max_block_len",
                "Must be greater than 0",
            ));
        }

        if self.battery.buffer_size == 0 {
            return Err(PowerwatchError::validation(
                "battery.buffer_size",
                "Must be greater than 0",
            ));
        }

        if self.battery.capacity_kwh <= 0.0 {
            return Err(PowerwatchError::validation(
                "battery.capacity_kwh",
                "Must be positive",
            ));
        }

        if self.battery.min_plausible_v >= self.battery.max_plausible_v {
            return Err(PowerwatchError::validation(
                "battery.min_plausible_v",
                "Must be below battery.max_plausible_v",
            ));
        }

        if self.outage.provider != OutageProvider::None && self.outage.group.is_empty() {
            return Err(PowerwatchError::validation(
                "outage.group",
                "Group cannot be empty",
            ));
        }

        // Checked without a provider too; a source can be injected directly
        if self.outage.poll_interval_secs == 0 || self.outage.staleness_threshold == 0 {
            return Err(PowerwatchError::validation(
                "outage.poll_interval_secs",
                "Interval and staleness threshold must be greater than 0",
            ));
        }

        self.tz()?;
        Ok(())
    }

    /// Parsed schedule timezone
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone.parse::<chrono_tz::Tz>().map_err(|e| {
            PowerwatchError::validation("timezone".to_string(), format!("{}: {}", self.timezone, e))
        })
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn inter_read_delay(&self) -> Duration {
        Duration::from_millis(self.inter_read_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        PowerwatchError::validation(key.to_string(), format!("invalid value '{}'", value))
    })
}
