use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use super::templates::{EquipmentTemplate, TemplateStore};
use crate::devices::{EquipmentSettings, RetryPolicy};
use crate::drivers::{DriverKind, JkBmsSettings, SerialSettings, TransportEndpoint};
use crate::registers::FieldDescriptor;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collector_id: String,
    pub collector_name: String,
    pub log_level: String,

    pub poll_interval_seconds: u64,
    /// Failed cycles in a row before an equipment is reported offline and cooled down.
    pub max_consecutive_errors: u32,
    pub error_cooldown_seconds: u64,
    pub health_report_seconds: u64,

    pub templates_dir: String,
    pub output: OutputConfig,
    pub equipment: Vec<EquipmentConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// `json` or `console`.
    pub format: String,
    pub console: bool,
    pub log: bool,
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentConfig {
    pub name: String,
    pub template: String,
    pub driver: DriverKind,
    /// `host:port` or a serial device path.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u16>,
    #[serde(default)]
    pub secondary: bool,
    #[serde(default = "default_secondary_delay_ms")]
    pub secondary_delay_ms: u64,
    #[serde(default)]
    pub probe_connectivity: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub jk_bms: JkBmsSettings,
    /// Replaces or adds sensors on top of the template.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sensors: BTreeMap<String, FieldDescriptor>,
}

fn default_secondary_delay_ms() -> u64 {
    900
}

fn default_enabled() -> bool {
    true
}

const DEFAULT_TIMEOUT_MS: u64 = 3000;
const DEFAULT_BATCH_SIZE: u16 = 50;

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            console: true,
            log: false,
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collector_id: Uuid::new_v4().to_string(),
            collector_name: "Energy Collector".to_string(),
            log_level: "info".to_string(),
            poll_interval_seconds: 10,
            max_consecutive_errors: 5,
            error_cooldown_seconds: 60,
            health_report_seconds: 300,
            templates_dir: "templates".to_string(),
            output: OutputConfig::default(),
            equipment: Vec::new(),
        }
    }
}

impl EquipmentConfig {
    pub fn endpoint(&self) -> Result<TransportEndpoint, ModbusError> {
        TransportEndpoint::parse(&self.path)
            .map_err(|e| ModbusError::ConfigError(format!("equipment '{}': {}", self.name, e)))
    }

    /// Merges this entry with its template into orchestrator settings and the final sensor set.
    pub fn resolve(
        &self,
        template: EquipmentTemplate,
    ) -> Result<(EquipmentSettings, BTreeMap<String, FieldDescriptor>), ModbusError> {
        let endpoint = self.endpoint()?;
        let defaults = &template.connection;

        let mut settings = EquipmentSettings::new(self.name.clone(), self.driver, endpoint);
        settings.manufacturer = non_empty_or(&template.metadata.manufacturer, "Unknown");
        settings.model = non_empty_or(&template.metadata.model, "Unknown");
        settings.unit_id = self.unit_id.or(defaults.default_unit_id).unwrap_or(1);
        settings.timeout = Duration::from_millis(
            self.timeout_ms
                .or(defaults.default_timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
        );
        settings.batch_size = self
            .batch_size
            .or(defaults.default_batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        settings.secondary_delay = self
            .secondary
            .then(|| Duration::from_millis(self.secondary_delay_ms));
        settings.probe_connectivity = self.probe_connectivity;
        settings.serial = self.serial.clone();
        settings.jk_bms = self.jk_bms.clone();
        settings.retry = RetryPolicy::default();

        let mut sensors = template.sensors;
        sensors.extend(self.sensors.clone());
        if sensors.is_empty() {
            warn!("⚠️  Equipment '{}' has no sensors defined", self.name);
        }
        Ok((settings, sensors))
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        info!(
            "⚙️  Loaded configuration from {} ({} equipment)",
            path.display(),
            config.equipment.len()
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ModbusError> {
        let mut config: Config = toml::from_str(content)?;

        // Generate an id on first start so readings stay attributable.
        if config.collector_id.is_empty() {
            config.collector_id = Uuid::new_v4().to_string();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ModbusError::SerializationError(format!("TOML error: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.poll_interval_seconds == 0 {
            return Err(ModbusError::ConfigError("poll_interval_seconds must be positive".to_string()));
        }

        let mut names = BTreeSet::new();
        let mut units: BTreeMap<TransportEndpoint, BTreeSet<u8>> = BTreeMap::new();
        // One pooled driver per endpoint, so everyone on it must agree on how to talk.
        let mut links: BTreeMap<TransportEndpoint, (DriverKind, &SerialSettings)> = BTreeMap::new();
        for equipment in self.enabled_equipment() {
            let name = equipment.name.trim();
            if name.is_empty() {
                return Err(ModbusError::ConfigError("equipment name must not be empty".to_string()));
            }
            if !names.insert(name) {
                return Err(ModbusError::ConfigError(format!("duplicate equipment name '{}'", name)));
            }
            if equipment.template.trim().is_empty() {
                return Err(ModbusError::ConfigError(format!("equipment '{}' has no template", name)));
            }
            if equipment.batch_size == Some(0) {
                return Err(ModbusError::ConfigError(format!("equipment '{}': batch_size must be at least 1", name)));
            }

            let endpoint = equipment.endpoint()?;
            match equipment.driver {
                DriverKind::ModbusTcp | DriverKind::RawTcpRtu if endpoint.is_serial() => {
                    return Err(ModbusError::ConfigError(format!(
                        "equipment '{}': {} needs host:port, got '{}'",
                        name, equipment.driver, equipment.path
                    )));
                }
                DriverKind::ModbusRtu if !endpoint.is_serial() => {
                    return Err(ModbusError::ConfigError(format!(
                        "equipment '{}': {} needs a serial device path, got '{}'",
                        name, equipment.driver, equipment.path
                    )));
                }
                _ => {}
            }
            if endpoint.is_serial() {
                equipment.serial.validate()?;
            }
            match links.entry(endpoint.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert((equipment.driver, &equipment.serial));
                }
                Entry::Occupied(existing) => {
                    let (kind, serial) = *existing.get();
                    if kind != equipment.driver {
                        return Err(ModbusError::ConfigError(format!(
                            "equipment '{}': {} on {} conflicts with {} already configured there",
                            name, equipment.driver, equipment.path, kind
                        )));
                    }
                    if endpoint.is_serial() && *serial != equipment.serial {
                        return Err(ModbusError::ConfigError(format!(
                            "equipment '{}': serial settings differ from other equipment on {}",
                            name, equipment.path
                        )));
                    }
                }
            }

            // JK BMS ignores unit ids; everything else shares the bus by unit id.
            if let (Some(unit), false) = (equipment.unit_id, equipment.driver == DriverKind::JkBms) {
                if !units.entry(endpoint).or_default().insert(unit) {
                    return Err(ModbusError::ConfigError(format!(
                        "equipment '{}': unit id {} already used on {}",
                        name, unit, equipment.path
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn enabled_equipment(&self) -> impl Iterator<Item = &EquipmentConfig> {
        self.equipment.iter().filter(|e| e.enabled)
    }

    pub fn equipment_by_name(&self, name: &str) -> Option<&EquipmentConfig> {
        self.equipment.iter().find(|e| e.name == name)
    }

    /// Resolves every enabled equipment against its template.
    ///
    /// Unit ids are checked again here since a template default can make two
    /// devices on one bus collide.
    pub fn resolve_equipment(
        &self,
        store: &TemplateStore,
    ) -> Result<Vec<(EquipmentSettings, BTreeMap<String, FieldDescriptor>)>, ModbusError> {
        let resolved = self
            .enabled_equipment()
            .map(|equipment| {
                let template = store.load(&equipment.template)?;
                equipment.resolve(template)
            })
            .collect::<Result<Vec<_>, ModbusError>>()?;

        check_unit_ids(resolved.iter().map(|(settings, _)| settings))?;
        Ok(resolved)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_seconds)
    }
}

fn check_unit_ids<'a>(settings: impl Iterator<Item = &'a EquipmentSettings>) -> Result<(), ModbusError> {
    let mut seen: BTreeMap<(&TransportEndpoint, u8), &str> = BTreeMap::new();
    for equipment in settings.filter(|s| s.driver != DriverKind::JkBms) {
        if let Some(other) = seen.insert((&equipment.endpoint, equipment.unit_id), equipment.name.as_str()) {
            return Err(ModbusError::ConfigError(format!(
                "equipment '{}': unit id {} already used on {} by '{}'",
                equipment.name, equipment.unit_id, equipment.endpoint, other
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::templates::TemplateConnection;
    use crate::registers::FieldKind;

    const SAMPLE: &str = r#"
        collector_name = "Site A"
        poll_interval_seconds = 15

        [output]
        format = "console"
        file = "/var/lib/collector/readings.jsonl"

        [[equipment]]
        name = "Inverter"
        template = "deye_sun"
        driver = "raw_tcp_rtu"
        path = "192.168.1.50:8899"
        unit_id = 1
        probe_connectivity = true

        [[equipment]]
        name = "Inverter Slave"
        template = "deye_sun"
        driver = "raw_tcp_rtu"
        path = "192.168.1.50:8899"
        unit_id = 2
        secondary = true

        [[equipment]]
        name = "Battery"
        template = "jk_bms"
        driver = "jk_bms"
        path = "/dev/ttyUSB0"

        [equipment.serial]
        baud_rate = 115200

        [equipment.jk_bms]
        mode = "active"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert!(!config.collector_id.is_empty());
        assert_eq!(config.poll_interval_seconds, 15);
        assert_eq!(config.max_consecutive_errors, 5);
        assert_eq!(config.output.format, "console");
        assert_eq!(config.equipment.len(), 3);

        let battery = config.equipment_by_name("Battery").unwrap();
        assert_eq!(battery.driver, DriverKind::JkBms);
        assert_eq!(battery.serial.baud_rate, 115200);
        assert_eq!(battery.jk_bms.mode, crate::drivers::JkBmsMode::Active);
        assert!(battery.enabled);
    }

    #[test]
    fn test_duplicate_unit_on_endpoint_rejected() {
        let content = SAMPLE.replace("unit_id = 2", "unit_id = 1");
        let err = Config::from_toml(&content).unwrap_err();
        assert!(err.to_string().contains("unit id 1 already used"));
    }

    #[test]
    fn test_driver_endpoint_mismatch_rejected() {
        let content = SAMPLE.replace("driver = \"jk_bms\"", "driver = \"modbus_tcp\"");
        assert!(matches!(Config::from_toml(&content), Err(ModbusError::ConfigError(_))));
    }

    #[test]
    fn test_mixed_drivers_on_one_endpoint_rejected() {
        let content = r#"
            [[equipment]]
            name = "Meter"
            template = "meter"
            driver = "modbus_tcp"
            path = "10.0.0.1:502"
            unit_id = 1

            [[equipment]]
            name = "Inverter"
            template = "deye_sun"
            driver = "raw_tcp_rtu"
            path = "10.0.0.1:502"
            unit_id = 2
        "#;
        let err = Config::from_toml(content).unwrap_err();
        assert!(matches!(err, ModbusError::ConfigError(_)));
        assert!(err.to_string().contains("conflicts with modbus_tcp"));

        // Same host on another port is a different link.
        assert!(Config::from_toml(&content.replacen("10.0.0.1:502", "10.0.0.1:8899", 1)).is_ok());
    }

    #[test]
    fn test_serial_settings_must_match_on_shared_port() {
        let content = r#"
            [[equipment]]
            name = "Meter A"
            template = "meter"
            driver = "modbus_rtu"
            path = "/dev/ttyUSB0"
            unit_id = 1

            [[equipment]]
            name = "Meter B"
            template = "meter"
            driver = "modbus_rtu"
            path = "/dev/ttyUSB0"
            unit_id = 2

            [equipment.serial]
            baud_rate = 19200
        "#;
        let err = Config::from_toml(content).unwrap_err();
        assert!(err.to_string().contains("serial settings differ"));
        assert!(Config::from_toml(&content.replace("baud_rate = 19200", "baud_rate = 9600")).is_ok());
    }

    #[test]
    fn test_template_default_unit_ids_collide() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("meter.toml"),
            "[connection]\ndefault_unit_id = 5\n\n[sensors.power]\nname = \"Power\"\naddress = 10\nkind = \"int16\"\n",
        )
        .unwrap();

        let content = r#"
            [[equipment]]
            name = "Meter A"
            template = "meter"
            driver = "raw_tcp_rtu"
            path = "10.0.0.9:8899"

            [[equipment]]
            name = "Meter B"
            template = "meter"
            driver = "raw_tcp_rtu"
            path = "10.0.0.9:8899"
        "#;
        // Nothing explicit to compare until the template is applied.
        let config = Config::from_toml(content).unwrap();
        let store = TemplateStore::new(dir.path());
        let err = config.resolve_equipment(&store).unwrap_err();
        assert!(err.to_string().contains("unit id 5 already used"));

        let content = content.replacen("path = \"10.0.0.9:8899\"\n", "path = \"10.0.0.9:8899\"\n            unit_id = 6\n", 1);
        let config = Config::from_toml(&content).unwrap();
        assert_eq!(config.resolve_equipment(&store).unwrap().len(), 2);
    }

    #[test]
    fn test_resolve_applies_template_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let mut template = EquipmentTemplate {
            connection: TemplateConnection {
                default_unit_id: Some(7),
                default_timeout_ms: Some(5000),
                default_batch_size: Some(20),
            },
            ..Default::default()
        };
        template.metadata.manufacturer = "Deye".to_string();
        template
            .sensors
            .insert("pv_power".to_string(), FieldDescriptor::new("PV Power", 186u16, FieldKind::Uint16));

        let slave = config.equipment_by_name("Inverter Slave").unwrap();
        let (settings, sensors) = slave.resolve(template).unwrap();
        assert_eq!(settings.unit_id, 2);
        assert_eq!(settings.timeout, Duration::from_millis(5000));
        assert_eq!(settings.batch_size, 20);
        assert_eq!(settings.manufacturer, "Deye");
        assert_eq!(settings.secondary_delay, Some(Duration::from_millis(900)));
        assert!(sensors.contains_key("pv_power"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::from_toml(SAMPLE).unwrap();

        config.save_to_file(&path).unwrap();
        let reloaded = Config::from_file(&path).unwrap();
        assert_eq!(reloaded, config);
    }
}
