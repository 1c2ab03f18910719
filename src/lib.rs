//! Energy equipment collector
//!
//! Polls inverters, meters and battery management systems over Modbus TCP,
//! Modbus RTU (local serial or through a transparent TCP gateway) and the JK
//! BMS broadcast protocol. Devices sharing one physical bus share one driver,
//! and every read holds that bus exclusively until it completes or is aborted.
//!
//! Register maps come from TOML equipment templates and decoded values are
//! published through pluggable sinks.

pub mod cli;
pub mod config;
pub mod devices;
pub mod drivers;
pub mod modbus;
pub mod output;
pub mod registers;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, EquipmentConfig, TemplateStore};
pub use devices::{Equipment, EquipmentSettings, PollOutcome};
pub use drivers::{DriverKind, DriverPool, ModbusDriver, TransportEndpoint};
pub use output::{DataFormatter, DataSender, MeasurementSink, PublishingSink};
pub use registers::{FieldDescriptor, FieldKind, SensorValue};
pub use services::DataService;
pub use utils::error::{ErrorKind, ModbusError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
