use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Data kind of one logical measurement; selects the decode strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Sum,
    Raw,
    Datetime,
}

impl FieldKind {
    /// Exact number of addresses the kind needs, or `None` for "one or more".
    pub fn address_count(&self) -> Option<usize> {
        match self {
            FieldKind::Uint16 | FieldKind::Int16 => Some(1),
            FieldKind::Uint32 | FieldKind::Int32 | FieldKind::Float32 => Some(2),
            FieldKind::Datetime => Some(3),
            FieldKind::Sum | FieldKind::Raw => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Uint16 => "uint16",
            FieldKind::Int16 => "int16",
            FieldKind::Uint32 => "uint32",
            FieldKind::Int32 => "int32",
            FieldKind::Float32 => "float32",
            FieldKind::Sum => "sum",
            FieldKind::Raw => "raw",
            FieldKind::Datetime => "datetime",
        };
        f.write_str(name)
    }
}

/// Word order of two-register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    /// First address holds the high word.
    #[default]
    Big,
    Little,
}

/// One address or an ordered list of addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addresses(Vec<u16>);

impl Addresses {
    pub fn single(address: u16) -> Self {
        Addresses(vec![address])
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u16>> for Addresses {
    fn from(addresses: Vec<u16>) -> Self {
        Addresses(addresses)
    }
}

impl Serialize for Addresses {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.as_slice() {
            [single] => serializer.serialize_u16(*single),
            many => many.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Addresses {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(u16),
            Many(Vec<u16>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(address) => Addresses(vec![address]),
            OneOrMany::Many(addresses) => Addresses(addresses),
        })
    }
}

/// Raw integer to label mapping with an optional `default` label.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LookupTable {
    entries: BTreeMap<i64, String>,
    default: Option<String>,
}

impl LookupTable {
    pub fn new(entries: BTreeMap<i64, String>, default: Option<String>) -> Self {
        Self { entries, default }
    }

    pub fn label(&self, raw: i64) -> String {
        match self.entries.get(&raw) {
            Some(label) => label.clone(),
            None => self
                .default
                .clone()
                .unwrap_or_else(|| format!("Unknown ({})", raw)),
        }
    }
}

impl Serialize for LookupTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.entries.len() + usize::from(self.default.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        for (key, label) in &self.entries {
            map.serialize_entry(&key.to_string(), label)?;
        }
        if let Some(default) = &self.default {
            map.serialize_entry("default", default)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LookupTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        let mut table = LookupTable::default();
        for (key, label) in raw {
            if key == "default" {
                table.default = Some(label);
                continue;
            }
            let parsed = match key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
                Some(hex) => i64::from_str_radix(hex, 16),
                None => key.parse::<i64>(),
            }
            .map_err(|_| de::Error::custom(format!("invalid lookup key '{}'", key)))?;
            table.entries.insert(parsed, label);
        }
        Ok(table)
    }
}

/// One logical measurement as declared by an equipment template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FieldSpec")]
pub struct FieldDescriptor {
    pub name: String,
    pub address: Addresses,
    pub kind: FieldKind,
    pub factor: f64,
    pub offset: f64,
    pub endianness: Endianness,
    pub byte_swap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookupTable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_range: Option<(f64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<Addresses>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            kind,
            factor: 1.0,
            offset: 0.0,
            endianness: Endianness::Big,
            byte_swap: false,
            lookup: None,
            valid_range: None,
            unit: None,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_byte_swap(mut self, byte_swap: bool) -> Self {
        self.byte_swap = byte_swap;
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_lookup(mut self, lookup: LookupTable) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_valid_range(mut self, min: f64, max: f64) -> Self {
        self.valid_range = Some((min, max));
        self
    }

    pub fn addresses(&self) -> &[u16] {
        self.address.as_slice()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.address.is_empty() {
            return Err(format!("field '{}' has no address", self.name));
        }
        if let Some(expected) = self.kind.address_count() {
            if self.address.len() != expected {
                return Err(format!(
                    "field '{}' of kind {} needs {} address(es), got {}",
                    self.name,
                    self.kind,
                    expected,
                    self.address.len()
                ));
            }
        }
        if let Some((min, max)) = self.valid_range {
            if min > max {
                return Err(format!("field '{}' has inverted valid_range", self.name));
            }
        }
        Ok(())
    }
}

impl From<u16> for Addresses {
    fn from(address: u16) -> Self {
        Addresses::single(address)
    }
}

/// Template-side representation; older templates omit `kind` and rely on hints.
#[derive(Debug, Deserialize)]
struct FieldSpec {
    #[serde(default)]
    name: Option<String>,
    address: Addresses,
    #[serde(default, alias = "data_type")]
    kind: Option<FieldKind>,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    is_32bit: bool,
    #[serde(default = "default_factor")]
    factor: f64,
    #[serde(default)]
    offset: f64,
    #[serde(default)]
    endianness: Endianness,
    #[serde(default)]
    byte_swap: bool,
    #[serde(default)]
    lookup: Option<LookupTable>,
    #[serde(default)]
    valid_range: Option<(f64, f64)>,
    #[serde(default, alias = "unit_of_measurement")]
    unit: Option<String>,
}

fn default_factor() -> f64 {
    1.0
}

impl TryFrom<FieldSpec> for FieldDescriptor {
    type Error = String;

    fn try_from(spec: FieldSpec) -> Result<Self, Self::Error> {
        // Legacy hints: a negative factor marks a signed register, list
        // addresses default to a sum or a 32-bit pair.
        let kind = spec.kind.unwrap_or_else(|| {
            if spec.address.len() > 1 {
                if spec.operation.as_deref() == Some("sum") {
                    FieldKind::Sum
                } else if spec.is_32bit {
                    FieldKind::Uint32
                } else {
                    FieldKind::Uint16
                }
            } else if spec.factor < 0.0 {
                FieldKind::Int16
            } else {
                FieldKind::Uint16
            }
        });

        let descriptor = FieldDescriptor {
            name: spec.name.unwrap_or_else(|| "unknown".to_string()),
            address: spec.address,
            kind,
            factor: spec.factor.abs(),
            offset: spec.offset,
            endianness: spec.endianness,
            byte_swap: spec.byte_swap,
            lookup: spec.lookup,
            valid_range: spec.valid_range,
            unit: spec.unit,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}
