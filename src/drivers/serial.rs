use async_trait::async_trait;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_serial::SerialPortBuilderExt;

use super::rtu_link::RtuLink;
use super::traits::{DriverKind, LinkState, ModbusDriver, TransportEndpoint};
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

/// Line settings for an RS-485/RS-232 port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParityConfig,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: ParityConfig::None,
        }
    }
}

impl SerialSettings {
    /// 115200 8N1, the JK BMS broadcast line.
    pub fn jk_bms() -> Self {
        Self {
            baud_rate: 115_200,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.baud_rate == 0 {
            return Err(ModbusError::ConfigError("baud_rate must be positive".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ModbusError::ConfigError(format!(
                "data_bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ModbusError::ConfigError(format!(
                "stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            ParityConfig::None => tokio_serial::Parity::None,
            ParityConfig::Even => tokio_serial::Parity::Even,
            ParityConfig::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Checks the device node before opening so a missing adapter and a
/// permission problem produce different errors.
///
/// Opening a tty without `O_NONBLOCK` can stall on modem lines, so the probe
/// runs on tokio's blocking pool.
pub async fn check_device_path(path: &str) -> Result<(), ModbusError> {
    match tokio::fs::OpenOptions::new().read(true).open(path).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ModbusError::DeviceNotFound(path.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(ModbusError::PermissionDenied(path.to_string()))
        }
        Err(e) => Err(ModbusError::ConnectionError(format!("cannot access {}: {}", path, e))),
    }
}

/// Opens a serial line as an async byte stream.
pub async fn open_serial(
    path: &str,
    settings: &SerialSettings,
) -> Result<tokio_serial::SerialStream, ModbusError> {
    check_device_path(path).await?;
    info!(
        "⚙️  Opening {} at {} baud, {} data bits, {} stop bit(s), parity {:?}",
        path, settings.baud_rate, settings.data_bits, settings.stop_bits, settings.parity
    );

    tokio_serial::new(path, settings.baud_rate)
        .data_bits(settings.data_bits())
        .stop_bits(settings.stop_bits())
        .parity(settings.parity())
        .open_native_async()
        .map_err(|e| match e.kind {
            tokio_serial::ErrorKind::NoDevice => ModbusError::DeviceNotFound(path.to_string()),
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                ModbusError::DeviceNotFound(path.to_string())
            }
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                ModbusError::PermissionDenied(path.to_string())
            }
            _ => ModbusError::ConnectionError(format!("Failed to open {}: {}", path, e)),
        })
}

/// Modbus RTU master on a local serial port.
pub struct SerialRtuDriver {
    endpoint: TransportEndpoint,
    settings: SerialSettings,
    link: Option<RtuLink>,
    state: LinkState,
}

impl SerialRtuDriver {
    pub fn new(endpoint: TransportEndpoint, settings: SerialSettings) -> Self {
        Self {
            endpoint,
            settings,
            link: None,
            state: LinkState::Disconnected,
        }
    }
}

#[async_trait]
impl ModbusDriver for SerialRtuDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::ModbusRtu
    }

    fn endpoint(&self) -> &TransportEndpoint {
        &self.endpoint
    }

    fn state(&self) -> LinkState {
        self.state
    }

    async fn connect(&mut self, timeout: Duration) -> Result<(), ModbusError> {
        self.state = LinkState::Connecting;
        info!("🔌 Connecting to Modbus RTU port: {}", self.endpoint);

        match open_serial(&self.endpoint.host, &self.settings).await {
            Ok(stream) => {
                self.link = Some(RtuLink::new(Box::new(stream), timeout));
                self.state = LinkState::Connected;
                info!("✅ Modbus RTU connection established on {}", self.endpoint);
                Ok(())
            }
            Err(e) => {
                error!("❌ Failed to open serial port {}: {}", self.endpoint, e);
                self.state = LinkState::Disconnected;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.link.take().is_some() {
            info!("🔌 Closed serial port {}", self.endpoint);
        }
        self.state = LinkState::Disconnected;
    }

    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, ModbusError> {
        let link = self.link.as_mut().ok_or(ModbusError::NotConnected)?;
        let result = link.read_holding_registers(unit_id, address, count).await;

        self.state = LinkState::after_request(&result);
        if self.state == LinkState::Disconnected {
            warn!("⚠️  Serial link {} lost: dropping handle", self.endpoint);
            self.link = None;
        }
        result
    }

    fn abort(&mut self) {
        self.link = None;
        self.state = LinkState::Disconnected;
    }
}
