//! Equipment templates: one TOML file per device model.
//!
//! ```toml
//! includes = ["common_bms"]
//!
//! [metadata]
//! manufacturer = "Deye"
//! model = "SUN-12K-SG04LP3"
//!
//! [connection]
//! default_unit_id = 1
//! default_batch_size = 40
//!
//! [sensors.battery_voltage]
//! name = "Battery Voltage"
//! address = 587
//! kind = "uint16"
//! factor = 0.01
//! unit = "V"
//! ```
//!
//! Included files are sensor packages merged key by key before the
//! template's own sensors, which win on conflicts.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::registers::FieldDescriptor;
use crate::utils::error::ModbusError;

const MAX_INCLUDE_DEPTH: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateMetadata {
    pub manufacturer: String,
    pub model: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConnection {
    pub default_unit_id: Option<u8>,
    pub default_timeout_ms: Option<u64>,
    pub default_batch_size: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquipmentTemplate {
    pub includes: Vec<String>,
    pub metadata: TemplateMetadata,
    pub connection: TemplateConnection,
    pub sensors: BTreeMap<String, FieldDescriptor>,
}

impl EquipmentTemplate {
    pub fn from_toml(content: &str) -> Result<Self, ModbusError> {
        Ok(toml::from_str(content)?)
    }

    /// Overlays `other` on top of `self`: sensors key by key, metadata only where set.
    fn merge_from(&mut self, other: EquipmentTemplate) {
        if !other.metadata.manufacturer.is_empty() {
            self.metadata.manufacturer = other.metadata.manufacturer;
        }
        if !other.metadata.model.is_empty() {
            self.metadata.model = other.metadata.model;
        }
        if other.metadata.description.is_some() {
            self.metadata.description = other.metadata.description;
        }

        let connection = other.connection;
        self.connection.default_unit_id = connection.default_unit_id.or(self.connection.default_unit_id);
        self.connection.default_timeout_ms = connection.default_timeout_ms.or(self.connection.default_timeout_ms);
        self.connection.default_batch_size = connection.default_batch_size.or(self.connection.default_batch_size);

        self.sensors.extend(other.sensors);
    }
}

/// Loads templates by name (`<dir>/<name>.toml`) with includes resolved.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let file = if name.ends_with(".toml") {
            name.to_string()
        } else {
            format!("{}.toml", name)
        };
        self.dir.join(file)
    }

    pub fn load(&self, name: &str) -> Result<EquipmentTemplate, ModbusError> {
        let mut visiting = BTreeSet::new();
        self.load_resolved(name, &mut visiting, 0)
    }

    fn load_resolved(
        &self,
        name: &str,
        visiting: &mut BTreeSet<String>,
        depth: usize,
    ) -> Result<EquipmentTemplate, ModbusError> {
        if depth > MAX_INCLUDE_DEPTH || !visiting.insert(name.to_string()) {
            return Err(ModbusError::ConfigError(format!(
                "template include cycle at '{}'",
                name
            )));
        }

        let path = self.path_for(name);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ModbusError::ConfigError(format!("cannot read template {}: {}", path.display(), e))
        })?;
        let own = EquipmentTemplate::from_toml(&content).map_err(|e| {
            ModbusError::ConfigError(format!("template {}: {}", path.display(), e))
        })?;

        let mut resolved = EquipmentTemplate::default();
        for include in &own.includes {
            debug!("template '{}' includes '{}'", name, include);
            let included = self.load_resolved(include, visiting, depth + 1)?;
            resolved.merge_from(included);
        }
        resolved.includes = own.includes.clone();
        resolved.merge_from(own);

        visiting.remove(name);
        Ok(resolved)
    }
}
