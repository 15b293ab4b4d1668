//! # Powerwatch - Inverter and outage monitor
//!
//! Watches a Deye hybrid inverter through its Solarman data logger (or
//! plain Modbus TCP), smooths the battery readings, follows the published
//! outage schedule of the local grid operator and predicts whether the
//! battery will carry the house through the next outage.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading, environment overrides and validation
//! - `logging`: Structured logging and tracing
//! - `modbus`: Register transports (Modbus TCP, Solarman V5)
//! - `device`: Exclusive, scoped device sessions and capability detection
//! - `registers`: Register layouts and read planning
//! - `telemetry`: Snapshot decoding
//! - `inverter`: Full telemetry poller
//! - `battery`: Fast battery sampler and outlier filter
//! - `outage`: Outage schedules, sources and poller
//! - `survival`: Battery survival estimate
//! - `persistence`: Last-known-good snapshot cache
//! - `monitor`: Worker lifecycle and query handle

pub mod battery;
pub mod config;
#[cfg(test)]
mod config_tests;
pub mod device;
pub mod error;
pub mod inverter;
pub mod logging;
pub mod modbus;
pub mod monitor;
pub mod outage;
pub mod persistence;
pub mod registers;
pub mod survival;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use error::{PowerwatchError, Result};
pub use monitor::{Monitor, MonitorHandle, Telemetry};
pub use outage::{OutageStatus, OutageWindow};
pub use survival::SurvivalVerdict;
