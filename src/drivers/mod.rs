pub mod jk_bms;
pub mod pool;
pub mod rtu_link;
pub mod rtu_over_tcp;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use jk_bms::{JkBmsDriver, JkBmsMode, JkBmsSettings};
pub use pool::{BusGuard, DriverPool, SharedDriver};
pub use rtu_over_tcp::RawTcpRtuDriver;
pub use serial::{ParityConfig, SerialRtuDriver, SerialSettings};
pub use tcp::{probe_tcp, ModbusTcpDriver};
pub use traits::{ConnectionInfo, DriverKind, LinkState, ModbusDriver, TransportEndpoint};

use crate::utils::error::ModbusError;

/// Builds an unconnected driver for `kind` on `endpoint`.
///
/// Serial drivers need a device path and network drivers need `host:port`;
/// a mismatch is a configuration error.
pub fn build_driver(
    kind: DriverKind,
    endpoint: TransportEndpoint,
    serial: &SerialSettings,
    jk_bms: &JkBmsSettings,
) -> Result<Box<dyn ModbusDriver>, ModbusError> {
    match kind {
        DriverKind::ModbusTcp | DriverKind::RawTcpRtu if endpoint.is_serial() => {
            Err(ModbusError::ConfigError(format!(
                "{} driver needs host:port, got device path '{}'",
                kind, endpoint
            )))
        }
        DriverKind::ModbusRtu if !endpoint.is_serial() => Err(ModbusError::ConfigError(format!(
            "{} driver needs a serial device path, got '{}'",
            kind, endpoint
        ))),
        DriverKind::ModbusTcp => Ok(Box::new(ModbusTcpDriver::new(endpoint))),
        DriverKind::RawTcpRtu => Ok(Box::new(RawTcpRtuDriver::new(endpoint))),
        DriverKind::ModbusRtu => {
            serial.validate()?;
            Ok(Box::new(SerialRtuDriver::new(endpoint, serial.clone())))
        }
        DriverKind::JkBms => {
            if endpoint.is_serial() {
                serial.validate()?;
            }
            Ok(Box::new(JkBmsDriver::new(endpoint, serial.clone(), jk_bms.clone())))
        }
    }
}
