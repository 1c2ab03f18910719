use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::utils::error::ModbusError;

/// Transport family a driver speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Modbus TCP with MBAP framing.
    ModbusTcp,
    /// Modbus RTU over a local serial line.
    ModbusRtu,
    /// Modbus RTU frames written to a transparent TCP gateway.
    RawTcpRtu,
    /// JK BMS proprietary broadcast protocol.
    JkBms,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::ModbusTcp => "modbus_tcp",
            DriverKind::ModbusRtu => "modbus_rtu",
            DriverKind::RawTcpRtu => "raw_tcp_rtu",
            DriverKind::JkBms => "jk_bms",
        }
    }

    /// Whether the endpoint is a half-duplex bus where requests must never overlap.
    pub fn is_half_duplex(&self) -> bool {
        !matches!(self, DriverKind::ModbusTcp)
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriverKind {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "modbus_tcp" | "tcp" => Ok(DriverKind::ModbusTcp),
            "modbus_rtu" | "rtu" | "serial" => Ok(DriverKind::ModbusRtu),
            "raw_tcp_rtu" => Ok(DriverKind::RawTcpRtu),
            "jk_bms" | "jkbms" => Ok(DriverKind::JkBms),
            other => Err(ModbusError::ConfigError(format!("unknown driver '{}'", other))),
        }
    }
}

/// Pool key: `host:port` for network links, device path with port 0 for serial lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportEndpoint {
    pub host: String,
    pub port: u16,
}

impl TransportEndpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn serial(path: impl Into<String>) -> Self {
        Self {
            host: path.into(),
            port: 0,
        }
    }

    pub fn is_serial(&self) -> bool {
        self.port == 0
    }

    /// Parses a configured path: `/dev/...` (or `COMx`) is a serial device, anything else `host:port`.
    pub fn parse(path: &str) -> Result<Self, ModbusError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(ModbusError::ConfigError("empty endpoint path".to_string()));
        }
        if path.starts_with('/') || path.to_ascii_uppercase().starts_with("COM") {
            return Ok(Self::serial(path));
        }

        let (host, port) = path.rsplit_once(':').ok_or_else(|| {
            ModbusError::ConfigError(format!("'{}' is neither a device path nor host:port", path))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| ModbusError::ConfigError(format!("invalid port in '{}'", path)))?;
        if host.is_empty() || port == 0 {
            return Err(ModbusError::ConfigError(format!("invalid endpoint '{}'", path)));
        }
        Ok(Self::tcp(host, port))
    }
}

impl fmt::Display for TransportEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_serial() {
            f.write_str(&self.host)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Connection lifecycle of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the last request failed with a recoverable error.
    Degraded,
}

impl LinkState {
    /// State after a request on an open link finished with `result`.
    pub fn after_request<T>(result: &Result<T, ModbusError>) -> LinkState {
        match result {
            Ok(_) => LinkState::Connected,
            Err(err) if err.requires_reconnect() => LinkState::Disconnected,
            Err(_) => LinkState::Degraded,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub driver: DriverKind,
    pub endpoint: String,
    pub state: LinkState,
}

/// Capability shared by every transport.
///
/// A driver owns one connection to its endpoint. It is not internally
/// synchronized: callers hold the pool's per-endpoint lock around every call.
#[async_trait]
pub trait ModbusDriver: Send {
    fn kind(&self) -> DriverKind;

    fn endpoint(&self) -> &TransportEndpoint;

    fn state(&self) -> LinkState;

    fn is_connected(&self) -> bool {
        matches!(self.state(), LinkState::Connected | LinkState::Degraded)
    }

    /// Opens the connection; `timeout` bounds the whole attempt.
    async fn connect(&mut self, timeout: Duration) -> Result<(), ModbusError>;

    async fn disconnect(&mut self);

    /// Reads `count` holding registers starting at `address` from `unit_id`.
    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, ModbusError>;

    /// Drops the connection handle without any I/O.
    ///
    /// Used when a read was cancelled mid-frame so half-read bytes never reach
    /// the next request.
    fn abort(&mut self);

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            driver: self.kind(),
            endpoint: self.endpoint().to_string(),
            state: self.state(),
        }
    }
}
