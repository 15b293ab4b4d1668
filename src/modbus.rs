//! Register transports for the inverter's data logger
//!
//! Both transports implement [`RegisterTransport`]: a plain Modbus TCP client
//! built on `tokio-modbus`, and a Solarman V5 client that wraps Modbus RTU
//! frames in the logger's own TCP framing. Timeouts and read spacing are
//! enforced one level up, in [`crate::device::DeviceConnection`].

use crate::config::{DeviceConfig, TransportProtocol};
use crate::error::{PowerwatchError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use async_trait::async_trait;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

pub mod rtu;
pub mod solarman;

pub use solarman::SolarmanTransport;

/// A connection that can read holding registers.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Open the underlying link.
    async fn connect(&mut self) -> Result<()>;

    /// Read `count` consecutive holding registers starting at `address`.
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>>;

    /// Close the link. Must be safe to call when not connected.
    async fn close(&mut self) -> Result<()>;

    /// Human-readable peer, for logs.
    fn endpoint(&self) -> String;
}

/// Build the transport selected by configuration.
pub fn transport_from_config(config: &DeviceConfig) -> Result<Box<dyn RegisterTransport>> {
    match config.protocol {
        TransportProtocol::ModbusTcp => Ok(Box::new(ModbusTcpTransport::new(config))),
        TransportProtocol::SolarmanV5 => {
            let serial = config.logger_serial.ok_or_else(|| {
                PowerwatchError::config("Solarman transport needs device.logger_serial")
            })?;
            Ok(Box::new(SolarmanTransport::new(
                &config.ip,
                config.port,
                serial,
                config.slave_id,
            )))
        }
    }
}

/// Modbus TCP client (RS485-to-Ethernet gateway in front of the inverter)
pub struct ModbusTcpTransport {
    address: String,
    unit_id: u8,
    client: Option<tokio_modbus::client::Context>,
    logger: StructuredLogger,
}

impl ModbusTcpTransport {
    pub fn new(config: &DeviceConfig) -> Self {
        let address = format!("{}:{}", config.ip, config.port);
        let logger = get_logger_with_context(
            LogContext::new("modbus").with_device(address.clone()),
        );
        Self {
            address,
            unit_id: config.slave_id,
            client: None,
            logger,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}

#[async_trait]
impl RegisterTransport for ModbusTcpTransport {
    async fn connect(&mut self) -> Result<()> {
        // Hostnames resolve on every connect; a DNS miss is retried next cycle
        let socket_addr = tokio::net::lookup_host(&self.address)
            .await
            .map_err(|e| {
                PowerwatchError::connection_refused(format!(
                    "Cannot resolve {}: {}",
                    self.address, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                PowerwatchError::connection_refused(format!("No address for {}", self.address))
            })?;

        self.logger.debug("Connecting to Modbus server");
        let client = tcp::connect_slave(socket_addr, Slave(self.unit_id)).await?;
        self.client = Some(client);
        Ok(())
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| PowerwatchError::connection_refused("Modbus client not connected"))?;

        match client.read_holding_registers(address, count).await {
            Ok(Ok(words)) => {
                self.logger
                    .trace(&format!("Read {} registers at {}", words.len(), address));
                Ok(words)
            }
            Ok(Err(exception)) => Err(PowerwatchError::protocol(format!(
                "Modbus exception reading {}+{}: {}",
                address, count, exception
            ))),
            Err(tokio_modbus::Error::Transport(e)) => Err(e.into()),
            Err(e) => Err(PowerwatchError::protocol(format!(
                "Failed to read holding registers: {}",
                e
            ))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut client) = self.client.take() {
            client.disconnect().await?;
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        self.address.clone()
    }
}

/// Interpret a raw register as two's-complement.
pub fn to_signed(raw: u16) -> i16 {
    raw as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_signed() {
        assert_eq!(to_signed(0), 0);
        assert_eq!(to_signed(32767), 32767);
        assert_eq!(to_signed(32768), -32768);
        assert_eq!(to_signed(65535), -1);
    }

    #[test]
    fn test_transport_from_config() {
        let mut config = DeviceConfig {
            ip: "127.0.0.1".to_string(),
            ..DeviceConfig::default()
        };
        assert!(transport_from_config(&config).is_err());

        config.logger_serial = Some(1_234_567_890);
        let transport = transport_from_config(&config).unwrap();
        assert_eq!(transport.endpoint(), "127.0.0.1:8899");

        config.protocol = TransportProtocol::ModbusTcp;
        config.port = 502;
        let transport = transport_from_config(&config).unwrap();
        assert_eq!(transport.endpoint(), "127.0.0.1:502");
    }

    #[tokio::test]
    async fn test_read_without_connect_fails() {
        let config = DeviceConfig {
            ip: "127.0.0.1".to_string(),
            protocol: TransportProtocol::ModbusTcp,
            ..DeviceConfig::default()
        };
        let mut transport = ModbusTcpTransport::new(&config);
        assert!(!transport.is_connected());
        let err = transport.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, PowerwatchError::ConnectionRefused { .. }));
        // Closing an unopened transport is a no-op
        assert!(transport.close().await.is_ok());
    }
}
