use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::descriptor::{Endianness, FieldDescriptor, FieldKind};

/// Absolute register address to the raw value read during the current cycle.
pub type RegisterMap = BTreeMap<u16, u16>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorValue {
    Number(f64),
    Text(String),
}

impl SensorValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorValue::Number(value) => Some(*value),
            SensorValue::Text(_) => None,
        }
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Number(value) => write!(f, "{}", value),
            SensorValue::Text(text) => f.write_str(text),
        }
    }
}

/// Reasons a field is unavailable for the current cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("register {0} was not read this cycle")]
    MissingAddress(u16),

    #[error("{kind} needs {expected} address(es), got {got}")]
    WrongAddressCount {
        kind: FieldKind,
        expected: usize,
        got: usize,
    },

    #[error("value {value} outside valid range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("value is not a finite number")]
    NotFinite,
}

type Strategy = fn(&FieldDescriptor, &[u16]) -> Result<SensorValue, DecodeError>;

fn strategy_for(kind: FieldKind) -> Strategy {
    match kind {
        FieldKind::Uint16 => decode_uint16,
        FieldKind::Int16 => decode_int16,
        FieldKind::Uint32 => decode_uint32,
        FieldKind::Int32 => decode_int32,
        FieldKind::Float32 => decode_float32,
        FieldKind::Sum => decode_sum,
        FieldKind::Raw => decode_raw,
        FieldKind::Datetime => decode_datetime,
    }
}

/// Decodes one field from the registers read this cycle.
///
/// Every address of the field must be present; otherwise the field is
/// unavailable, never partially combined.
pub fn decode(field: &FieldDescriptor, registers: &RegisterMap) -> Result<SensorValue, DecodeError> {
    let addresses = field.addresses();
    if let Some(expected) = field.kind.address_count() {
        if addresses.len() != expected {
            return Err(DecodeError::WrongAddressCount {
                kind: field.kind,
                expected,
                got: addresses.len(),
            });
        }
    }
    if addresses.is_empty() {
        return Err(DecodeError::WrongAddressCount {
            kind: field.kind,
            expected: 1,
            got: 0,
        });
    }

    let values = addresses
        .iter()
        .map(|address| {
            registers
                .get(address)
                .copied()
                .ok_or(DecodeError::MissingAddress(*address))
        })
        .collect::<Result<Vec<u16>, _>>()?;

    strategy_for(field.kind)(field, &values)
}

/// Decodes every field, keeping only the ones available this cycle.
pub fn decode_all<'a, I>(fields: I, registers: &RegisterMap) -> BTreeMap<String, SensorValue>
where
    I: IntoIterator<Item = (&'a String, &'a FieldDescriptor)>,
{
    fields
        .into_iter()
        .filter_map(|(id, field)| match decode(field, registers) {
            Ok(value) => Some((id.clone(), value)),
            Err(err) => {
                log::debug!("field {} unavailable: {}", id, err);
                None
            }
        })
        .collect()
}

fn swap_bytes(value: u16) -> u16 {
    value.rotate_left(8)
}

fn prepared(field: &FieldDescriptor, values: &[u16]) -> Vec<u16> {
    if field.byte_swap {
        values.iter().map(|v| swap_bytes(*v)).collect()
    } else {
        values.to_vec()
    }
}

/// Decimal places kept after scaling: two, or as many as the factor carries.
fn precision(factor: f64) -> i32 {
    let text = format!("{}", factor);
    let decimals = text.split_once('.').map(|(_, frac)| frac.len()).unwrap_or(0) as i32;
    decimals.clamp(2, 6)
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

fn scale(field: &FieldDescriptor, raw: f64) -> Result<SensorValue, DecodeError> {
    let value = round_to((raw - field.offset) * field.factor, precision(field.factor));
    if !value.is_finite() {
        return Err(DecodeError::NotFinite);
    }
    if let Some((min, max)) = field.valid_range {
        if value < min || value > max {
            return Err(DecodeError::OutOfRange { value, min, max });
        }
    }
    Ok(SensorValue::Number(value))
}

fn decode_uint16(field: &FieldDescriptor, values: &[u16]) -> Result<SensorValue, DecodeError> {
    let raw = prepared(field, values)[0];
    if let Some(lookup) = &field.lookup {
        return Ok(SensorValue::Text(lookup.label(raw as i64)));
    }
    scale(field, raw as f64)
}

fn decode_int16(field: &FieldDescriptor, values: &[u16]) -> Result<SensorValue, DecodeError> {
    let raw = prepared(field, values)[0] as i16;
    if let Some(lookup) = &field.lookup {
        return Ok(SensorValue::Text(lookup.label(raw as i64)));
    }
    scale(field, raw as f64)
}

fn combine(field: &FieldDescriptor, values: &[u16]) -> u32 {
    let words = prepared(field, values);
    match field.endianness {
        Endianness::Big => ((words[0] as u32) << 16) | words[1] as u32,
        Endianness::Little => ((words[1] as u32) << 16) | words[0] as u32,
    }
}

fn decode_uint32(field: &FieldDescriptor, values: &[u16]) -> Result<SensorValue, DecodeError> {
    scale(field, combine(field, values) as f64)
}

fn decode_int32(field: &FieldDescriptor, values: &[u16]) -> Result<SensorValue, DecodeError> {
    scale(field, combine(field, values) as i32 as f64)
}

fn decode_float32(field: &FieldDescriptor, values: &[u16]) -> Result<SensorValue, DecodeError> {
    let value = f32::from_bits(combine(field, values));
    if !value.is_finite() {
        return Err(DecodeError::NotFinite);
    }
    scale(field, value as f64)
}

fn decode_sum(field: &FieldDescriptor, values: &[u16]) -> Result<SensorValue, DecodeError> {
    let total: u64 = prepared(field, values).iter().map(|v| *v as u64).sum();
    scale(field, total as f64)
}

fn hex_dump(values: &[u16]) -> String {
    values
        .iter()
        .map(|v| format!("{:04X}", v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_raw(_field: &FieldDescriptor, values: &[u16]) -> Result<SensorValue, DecodeError> {
    if let [single] = values {
        return Ok(SensorValue::Text(format!("0x{:04X}", single)));
    }

    // Non-ASCII bytes are dropped before the printable check.
    let bytes: Vec<u8> = values
        .iter()
        .flat_map(|v| v.to_be_bytes())
        .filter(|b| b.is_ascii())
        .collect();
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim_end_matches('\0');

    if !text.is_empty() && text.chars().all(|c| (' '..='~').contains(&c)) {
        Ok(SensorValue::Text(text.to_string()))
    } else {
        Ok(SensorValue::Text(hex_dump(values)))
    }
}

fn decode_datetime(_field: &FieldDescriptor, values: &[u16]) -> Result<SensorValue, DecodeError> {
    let [year, month] = values[0].to_be_bytes();
    let [day, hour] = values[1].to_be_bytes();
    let [minute, second] = values[2].to_be_bytes();

    let timestamp = NaiveDate::from_ymd_opt(2000 + year as i32, month as u32, day as u32)
        .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second as u32));

    Ok(SensorValue::Text(match timestamp {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => hex_dump(values),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::descriptor::LookupTable;

    fn registers(pairs: &[(u16, u16)]) -> RegisterMap {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_cell_voltage_and_current() {
        let map = registers(&[(10, 2505), (11, 65525)]);

        let cell_voltage = FieldDescriptor::new("cell_voltage", 10u16, FieldKind::Uint16).with_factor(0.001);
        assert_eq!(decode(&cell_voltage, &map), Ok(SensorValue::Number(2.505)));

        // (65525 - 65536) * 0.01
        let current = FieldDescriptor::new("current", 11u16, FieldKind::Int16).with_factor(0.01);
        assert_eq!(decode(&current, &map), Ok(SensorValue::Number(-0.11)));
    }

    #[test]
    fn test_offset_and_byte_swap() {
        let map = registers(&[(1, 0x3412)]);
        let field = FieldDescriptor::new("t", 1u16, FieldKind::Uint16)
            .with_byte_swap(true)
            .with_offset(1000.0)
            .with_factor(0.1);
        // 0x1234 = 4660 -> (4660 - 1000) * 0.1
        assert_eq!(decode(&field, &map), Ok(SensorValue::Number(366.0)));
    }

    #[test]
    fn test_lookup_bypasses_scaling() {
        let map = registers(&[(5, 2)]);
        let lookup = LookupTable::new(BTreeMap::from([(2, "Normal".to_string())]), None);
        let field = FieldDescriptor::new("status", 5u16, FieldKind::Uint16)
            .with_factor(0.1)
            .with_offset(1.0)
            .with_lookup(lookup);
        assert_eq!(decode(&field, &map), Ok(SensorValue::Text("Normal".into())));
    }

    #[test]
    fn test_32bit_word_order() {
        let map = registers(&[(100, 0x0001), (101, 0x0002)]);
        let big = FieldDescriptor::new("e", vec![100u16, 101], FieldKind::Uint32);
        let little = big.clone().with_endianness(Endianness::Little);

        assert_eq!(decode(&big, &map), Ok(SensorValue::Number(65538.0)));
        assert_eq!(decode(&little, &map), Ok(SensorValue::Number(131073.0)));
    }

    #[test]
    fn test_int32_sign_and_range() {
        let map = registers(&[(20, 0xFFFF), (21, 0xFF38)]);
        let power = FieldDescriptor::new("p", vec![20u16, 21], FieldKind::Int32);
        assert_eq!(decode(&power, &map), Ok(SensorValue::Number(-200.0)));

        let bounded = power.with_valid_range(0.0, 10_000.0);
        assert!(matches!(decode(&bounded, &map), Err(DecodeError::OutOfRange { .. })));
    }

    #[test]
    fn test_float32() {
        let bits = 230.5f32.to_bits();
        let map = registers(&[(0, (bits >> 16) as u16), (1, bits as u16)]);
        let field = FieldDescriptor::new("v", vec![0u16, 1], FieldKind::Float32);
        assert_eq!(decode(&field, &map), Ok(SensorValue::Number(230.5)));

        let nan = registers(&[(0, 0x7FC0), (1, 0x0000)]);
        assert_eq!(decode(&field, &nan), Err(DecodeError::NotFinite));
    }

    #[test]
    fn test_missing_address_is_unavailable() {
        let map = registers(&[(100, 0x0001)]);
        let field = FieldDescriptor::new("e", vec![100u16, 101], FieldKind::Uint32);
        assert_eq!(decode(&field, &map), Err(DecodeError::MissingAddress(101)));

        let sum = FieldDescriptor::new("pv", vec![100u16, 101], FieldKind::Sum);
        assert_eq!(decode(&sum, &map), Err(DecodeError::MissingAddress(101)));
    }

    #[test]
    fn test_zero_is_not_missing() {
        let map = registers(&[(3, 0)]);
        let field = FieldDescriptor::new("z", 3u16, FieldKind::Uint16);
        assert_eq!(decode(&field, &map), Ok(SensorValue::Number(0.0)));
    }

    #[test]
    fn test_sum() {
        let map = registers(&[(672, 1200), (673, 800)]);
        let field = FieldDescriptor::new("pv_power", vec![672u16, 673], FieldKind::Sum).with_factor(0.1);
        assert_eq!(decode(&field, &map), Ok(SensorValue::Number(200.0)));
    }

    #[test]
    fn test_raw_text_and_hex() {
        // "SN12" followed by padding
        let map = registers(&[(3, 0x534E), (4, 0x3132), (5, 0x0000), (9, 0x0001), (10, 0xFF02)]);
        let serial = FieldDescriptor::new("sn", vec![3u16, 4, 5], FieldKind::Raw);
        assert_eq!(decode(&serial, &map), Ok(SensorValue::Text("SN12".into())));

        let binary = FieldDescriptor::new("b", vec![9u16, 10], FieldKind::Raw);
        assert_eq!(decode(&binary, &map), Ok(SensorValue::Text("0001 FF02".into())));

        let single = FieldDescriptor::new("s", 9u16, FieldKind::Raw);
        assert_eq!(decode(&single, &map), Ok(SensorValue::Text("0x0001".into())));
    }

    #[test]
    fn test_datetime() {
        let map = registers(&[(22, 0x180A), (23, 0x0F0E), (24, 0x1E05)]);
        let field = FieldDescriptor::new("clock", vec![22u16, 23, 24], FieldKind::Datetime);
        assert_eq!(
            decode(&field, &map),
            Ok(SensorValue::Text("2024-10-15 14:30:05".into()))
        );

        let bogus = registers(&[(22, 0x180D), (23, 0x0F0E), (24, 0x1E05)]);
        assert_eq!(
            decode(&field, &bogus),
            Ok(SensorValue::Text("180D 0F0E 1E05".into()))
        );
    }

    #[test]
    fn test_decoding_is_idempotent() {
        let map = registers(&[(10, 2505), (11, 65525), (12, 7)]);
        let fields = BTreeMap::from([
            ("a".to_string(), FieldDescriptor::new("a", 10u16, FieldKind::Uint16).with_factor(0.001)),
            ("b".to_string(), FieldDescriptor::new("b", vec![11u16, 12], FieldKind::Int32)),
            ("c".to_string(), FieldDescriptor::new("c", vec![12u16, 13], FieldKind::Uint32)),
        ]);
        let first = decode_all(&fields, &map);
        let second = decode_all(&fields, &map);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(!first.contains_key("c"));
    }
}
