use anyhow::Result;
use chrono::Utc;
use powerwatch::config::Config;
use powerwatch::logging::{get_logger, init_logging};
use powerwatch::modbus::transport_from_config;
use powerwatch::monitor::{Monitor, MonitorHandle, Telemetry};
use powerwatch::outage::source_from_config;
use powerwatch::persistence::{JsonFileStore, SnapshotStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    let logger = get_logger("main");
    logger.info(&format!("Powerwatch {} starting up", env!("APP_VERSION")));

    let transport = transport_from_config(&config.device)?;
    let source = source_from_config(&config.outage)?;
    let store = JsonFileStore::from_config(&config.persistence)
        .map(|store| Arc::new(store) as Arc<dyn SnapshotStore>);
    let status_every = Duration::from_secs(config.inverter.poll_interval_secs);

    let monitor = Monitor::start(config, transport, source, store)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start monitor: {}", e))?;

    let mut ticker = interval(status_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => log_status(&monitor),
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    logger.error(&format!("Failed to listen for Ctrl-C: {}", e));
                }
                break;
            }
        }
    }

    monitor.shutdown().await;
    logger.info("Shutdown complete");
    Ok(())
}

fn log_status(monitor: &MonitorHandle) {
    let logger = get_logger("status");
    let now = Utc::now();

    let telemetry = match monitor.latest_telemetry_at(now) {
        Telemetry::Snapshot(s) => {
            let battery = s
                .battery
                .as_ref()
                .map(|b| format!("{:.2}V {}% {:?}", b.voltage_v, b.soc_percent, b.flow))
                .unwrap_or_else(|| "none".to_string());
            format!(
                "PV {:.0}W, load {:.0}W, grid {:.0}W {:?}, battery {}",
                s.pv_total_power_w, s.load_power_w, s.grid_power_w, s.grid_flow, battery
            )
        }
        Telemetry::Unavailable => "telemetry unavailable".to_string(),
    };

    let outage = monitor.outage_status(now);
    let survival = monitor.next_outage_window(now).and_then(|window| {
        monitor.survival_estimate(&window).map(|e| {
            format!(
                ", next outage {}-{}: {:?} ({:.1}/{:.1} kWh)",
                window.start.format("%H:%M"),
                window.end.format("%H:%M"),
                e.verdict,
                e.available_kwh,
                e.needed_kwh
            )
        })
    });

    logger.info(&format!(
        "{}; outage {}{}",
        telemetry,
        outage.label(),
        survival.unwrap_or_default()
    ));
}
