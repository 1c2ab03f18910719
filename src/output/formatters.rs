use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::registers::SensorValue;
use crate::utils::error::ModbusError;

/// One published record: a full cycle of decoded values, or an availability change.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub collector_id: String,
    pub equipment: String,
    pub manufacturer: String,
    pub timestamp: DateTime<Utc>,
    pub available: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, SensorValue>,
}

impl Reading {
    pub fn new(
        collector_id: &str,
        equipment: &str,
        manufacturer: &str,
        values: BTreeMap<String, SensorValue>,
    ) -> Self {
        Self {
            collector_id: collector_id.to_string(),
            equipment: equipment.to_string(),
            manufacturer: manufacturer.to_string(),
            timestamp: Utc::now(),
            available: true,
            values,
        }
    }

    pub fn offline(collector_id: &str, equipment: &str, manufacturer: &str) -> Self {
        Self {
            available: false,
            ..Self::new(collector_id, equipment, manufacturer, BTreeMap::new())
        }
    }
}

pub trait DataFormatter: Send + Sync {
    fn format_reading(&self, reading: &Reading) -> Result<String, ModbusError>;
    fn name(&self) -> &str;
}

/// Single-line JSON, suitable for files and log shippers.
pub struct JsonFormatter;

impl DataFormatter for JsonFormatter {
    fn format_reading(&self, reading: &Reading) -> Result<String, ModbusError> {
        Ok(serde_json::to_string(reading)?)
    }

    fn name(&self) -> &str {
        "json"
    }
}

/// Human-readable block for terminals.
pub struct ConsoleFormatter;

impl DataFormatter for ConsoleFormatter {
    fn format_reading(&self, reading: &Reading) -> Result<String, ModbusError> {
        let mut output = format!(
            "🔹 {} ({}) - {}\n",
            reading.equipment,
            reading.manufacturer,
            reading.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        if !reading.available {
            output.push_str("   ❌ offline\n");
            return Ok(output);
        }

        let width = reading.values.keys().map(|k| k.len()).max().unwrap_or(0);
        for (name, value) in &reading.values {
            output.push_str(&format!("   {:<width$} : {}\n", name, value, width = width));
        }
        Ok(output)
    }

    fn name(&self) -> &str {
        "console"
    }
}

pub fn formatter_for(name: &str) -> Option<Box<dyn DataFormatter>> {
    match name {
        "json" => Some(Box::new(JsonFormatter)),
        "console" | "text" => Some(Box::new(ConsoleFormatter)),
        _ => None,
    }
}
