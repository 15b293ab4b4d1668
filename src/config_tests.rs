#![cfg(test)]

use super::config::*;
use std::collections::HashMap;

fn configured() -> Config {
    let mut config = Config::default();
    config.device.ip = "192.168.1.50".to_string();
    config.device.logger_serial = Some(2_712_345_678);
    config
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.device.port, 8899);
    assert_eq!(config.device.protocol, TransportProtocol::SolarmanV5);
    assert_eq!(config.inverter.poll_interval_secs, 60);
    assert_eq!(config.battery.sample_interval_secs, 10);
    assert_eq!(config.battery.buffer_size, 6);
    assert_eq!(config.outage.staleness_threshold, 3);
    assert_eq!(config.capabilities.detection_samples, 3);
}

#[test]
fn test_missing_device_identifiers_are_fatal() {
    // Defaults carry no address
    assert!(Config::default().validate().is_err());

    let mut config = configured();
    assert!(config.validate().is_ok());

    config.device.logger_serial = None;
    assert!(config.validate().is_err());

    // Plain Modbus TCP does not need a logger serial
    config.device.protocol = TransportProtocol::ModbusTcp;
    assert!(config.validate().is_ok());
}

#[test]
fn test_hostname_address_is_valid_for_both_protocols() {
    let mut config = configured();
    config.device.ip = "inverter.local".to_string();
    assert!(config.validate().is_ok());

    config.device.protocol = TransportProtocol::ModbusTcp;
    config.device.port = 502;
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation() {
    let mut config = configured();
    config.device.port = 0;
    assert!(config.validate().is_err());

    config = configured();
    config.battery.min_plausible_v = 60.0;
    assert!(config.validate().is_err());

    config = configured();
    config.capabilities.phases = Some(2);
    assert!(config.validate().is_err());

    config = configured();
    config.timezone = "Mars/Olympus".to_string();
    assert!(config.validate().is_err());

    config = configured();
    config.outage.provider = OutageProvider::None;
    config.outage.group = String::new();
    assert!(config.validate().is_ok());
}

#[test]
fn test_env_overrides() {
    let env: HashMap<&str, &str> = [
        ("INVERTER_IP", "10.0.0.7"),
        ("LOGGER_SERIAL", "1234567890"),
        ("INVERTER_PHASES", "1"),
        ("INVERTER_HAS_BATTERY", "false"),
        ("INVERTER_PV_STRINGS", "1"),
        ("OUTAGE_PROVIDER", "yasno"),
        ("OUTAGE_GROUP", "2.1"),
        ("BATTERY_CAPACITY_KWH", "10.24"),
    ]
    .into_iter()
    .collect();

    let mut config = Config::default();
    config
        .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
        .unwrap();

    assert_eq!(config.device.ip, "10.0.0.7");
    assert_eq!(config.device.logger_serial, Some(1_234_567_890));
    assert_eq!(config.capabilities.phases, Some(1));
    assert_eq!(config.capabilities.has_battery, Some(false));
    assert_eq!(config.capabilities.pv_strings, Some(1));
    assert_eq!(config.outage.provider, OutageProvider::Yasno);
    assert_eq!(config.outage.group, "2.1");
    assert!((config.battery.capacity_kwh - 10.24).abs() < 1e-9);
    assert!(config.validate().is_ok());
}

#[test]
fn test_env_override_rejects_garbage() {
    let mut config = Config::default();
    let result =
        config.apply_overrides_from(|k| (k == "INVERTER_PORT").then(|| "eighty".to_string()));
    assert!(result.is_err());
}

#[test]
fn test_partial_yaml_uses_defaults() {
    let yaml = r#"
device:
  ip: 192.168.1.77
  logger_serial: 42
capabilities:
  phases: 3
outage:
  provider: none
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.device.ip, "192.168.1.77");
    assert_eq!(config.device.port, 8899);
    assert_eq!(config.capabilities.phases, Some(3));
    assert_eq!(config.capabilities.detection_samples, 3);
    assert_eq!(config.outage.provider, OutageProvider::None);
    assert_eq!(config.battery.soc_source, SocSource::VoltageCurve);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("powerwatch.yaml");
    let config = configured();
    config.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();
    assert_eq!(loaded.device.ip, config.device.ip);
    assert_eq!(loaded.device.logger_serial, config.device.logger_serial);
}
