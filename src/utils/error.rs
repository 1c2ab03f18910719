use thiserror::Error;

use crate::modbus::protocol::ExceptionCode;

/// Coarse classification used by the poller to decide between retrying,
/// reconnecting and giving up on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Timeout,
    Decode,
    Config,
}

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Permission denied for {0}. Add the service user to the dialout group")]
    PermissionDenied(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("CRC checksum mismatch: computed {computed:#06X}, received {received:#06X}")]
    CrcError { computed: u16, received: u16 },

    #[error("Unit ID mismatch: expected {expected}, got {received}")]
    UnitIdMismatch { expected: u8, received: u8 },

    #[error("Function code mismatch: expected {expected:#04X}, got {received:#04X}")]
    FunctionCodeMismatch { expected: u8, received: u8 },

    #[error("Modbus exception on function {function:#04X}: {code}")]
    Exception { function: u8, code: ExceptionCode },

    #[error("Unsupported function code: {0:#04X}")]
    UnsupportedFunction(u8),

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("Broadcast frame not received within {0:?}")]
    FrameTimeout(std::time::Duration),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ModbusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModbusError::ConnectionError(_)
            | ModbusError::DeviceNotFound(_)
            | ModbusError::PermissionDenied(_)
            | ModbusError::NotConnected
            | ModbusError::ConnectionClosed
            | ModbusError::CommunicationError(_) => ErrorKind::Connection,
            ModbusError::CrcError { .. }
            | ModbusError::UnitIdMismatch { .. }
            | ModbusError::FunctionCodeMismatch { .. }
            | ModbusError::Exception { .. }
            | ModbusError::UnsupportedFunction(_)
            | ModbusError::InvalidResponse(_) => ErrorKind::Protocol,
            ModbusError::FrameTimeout(_) | ModbusError::Timeout => ErrorKind::Timeout,
            ModbusError::InvalidData(_) => ErrorKind::Decode,
            ModbusError::ConfigError(_) | ModbusError::SerializationError(_) => ErrorKind::Config,
        }
    }

    /// Whether retrying the same request on the same connection can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Timeout)
    }

    /// Errors after which the connection handle must not be reused.
    pub fn requires_reconnect(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        ModbusError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::ConfigError(format!("TOML error: {}", err))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ModbusError::ConnectionClosed,
            std::io::ErrorKind::TimedOut => ModbusError::Timeout,
            _ => ModbusError::CommunicationError(format!("IO error: {}", err)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ModbusError::Timeout
    }
}
