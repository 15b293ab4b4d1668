use super::*;

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: 8899,
            protocol: TransportProtocol::SolarmanV5,
            logger_serial: None,
            slave_id: 1,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            inter_read_delay_ms: 50,
            lock_timeout_ms: 30_000,
        }
    }
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            phases: None,
            has_battery: None,
            pv_strings: None,
            detection_samples: 3,
            detection_interval_ms: 2_000,
        }
    }
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            stale_after_secs: 300,
            max_block_gap: 8,
            max_block_len: 64,
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 16.0,
            sample_interval_secs: 10,
            buffer_size: 6,
            outlier_threshold_v: 2.0,
            min_trusted_samples: 3,
            max_consecutive_rejections: 3,
            min_plausible_v: 46.0,
            max_plausible_v: 58.0,
            soc_source: SocSource::VoltageCurve,
        }
    }
}

impl Default for OutageConfig {
    fn default() -> Self {
        Self {
            provider: OutageProvider::Lvivoblenergo,
            group: "4.1".to_string(),
            region_id: 25,
            dso_id: 902,
            poll_interval_secs: 60,
            staleness_threshold: 3,
            request_timeout_secs: 15,
            lvivoblenergo_url: "https://api.loe.lviv.ua/api/menus?page=1&type=photo-grafic"
                .to_string(),
            yasno_url: concat!(
                "https://app.yasno.ua/api/blackout-service/public/shutdowns",
                "/regions/{region_id}/dsos/{dso_id}/planned-outages"
            )
            .to_string(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_file: "/tmp/powerwatch_inverter_cache.json".to_string(),
            max_age_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/powerwatch.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            capabilities: CapabilitiesConfig::default(),
            inverter: InverterConfig::default(),
            battery: BatteryConfig::default(),
            outage: OutageConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
            timezone: "Europe/Kyiv".to_string(),
        }
    }
}
