use std::collections::BTreeMap;

use super::frame_sync::{FrameKind, FRAME_LEN};
use crate::registers::SensorValue;
use crate::utils::error::ModbusError;

/// Register number that maps to the first byte after the live-frame header.
pub const REGISTER_BASE: u16 = 5664; // 0x1620
/// First cell voltage register; from here on registers are aligned on the cell block.
pub const CELL_REGISTER_START: u16 = 5667;
const CELL_BYTE_START: usize = 6;

pub const SERIAL_REGISTER_START: u16 = 5800;
pub const NAME_REGISTER_START: u16 = 5810;
/// Each identity string is exposed as this many registers (two ASCII chars each).
pub const IDENTITY_REGISTERS: u16 = 7;

pub const TRIGGER_STATIC: u16 = 0x161C;
pub const TRIGGER_SETUP: u16 = 0x161E;
pub const TRIGGER_LIVE: u16 = 0x1620;

pub const CELL_COUNT: usize = 16;

/// Name and serial number carried by the static frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BmsIdentity {
    pub name: String,
    pub serial: String,
}

impl BmsIdentity {
    pub fn from_static_frame(frame: &[u8]) -> Result<Self, ModbusError> {
        check_frame(frame, FrameKind::Static)?;
        Ok(Self {
            name: ascii_field(&frame[6..19]),
            serial: ascii_field(&frame[46..59]),
        })
    }

    /// Value of a synthesized identity register, `None` outside the identity ranges.
    pub fn pseudo_register(&self, register: u16) -> Option<u16> {
        let (text, start) = if (SERIAL_REGISTER_START..SERIAL_REGISTER_START + IDENTITY_REGISTERS)
            .contains(&register)
        {
            (&self.serial, SERIAL_REGISTER_START)
        } else if (NAME_REGISTER_START..NAME_REGISTER_START + IDENTITY_REGISTERS).contains(&register) {
            (&self.name, NAME_REGISTER_START)
        } else {
            return None;
        };

        let index = (register - start) as usize * 2;
        let bytes = text.as_bytes();
        let hi = bytes.get(index).copied().unwrap_or(0);
        let lo = bytes.get(index + 1).copied().unwrap_or(0);
        Some(u16::from_be_bytes([hi, lo]))
    }
}

pub fn is_identity_register(register: u16) -> bool {
    (SERIAL_REGISTER_START..SERIAL_REGISTER_START + IDENTITY_REGISTERS).contains(&register)
        || (NAME_REGISTER_START..NAME_REGISTER_START + IDENTITY_REGISTERS).contains(&register)
}

fn ascii_field(bytes: &[u8]) -> String {
    let text: String = bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|b| *b as char)
        .collect();
    text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string()
}

fn check_frame(frame: &[u8], kind: FrameKind) -> Result<(), ModbusError> {
    if frame.len() != FRAME_LEN {
        return Err(ModbusError::InvalidResponse(format!(
            "{:?} frame has {} bytes, expected {}",
            kind,
            frame.len(),
            FRAME_LEN
        )));
    }
    if frame[..5] != kind.header() {
        return Err(ModbusError::InvalidResponse(format!(
            "bad {:?} frame header {}",
            kind,
            hex::encode(&frame[..5])
        )));
    }
    Ok(())
}

/// Byte offset of a register inside the live frame.
///
/// Registers below the cell block sit right after the header; from the first
/// cell register on, offsets follow the cell voltage block.
fn register_offset(register: u16) -> Option<usize> {
    if register < REGISTER_BASE {
        return None;
    }
    if register >= CELL_REGISTER_START {
        Some(CELL_BYTE_START + (register - CELL_REGISTER_START) as usize * 2)
    } else {
        Some(5 + (register - REGISTER_BASE) as usize * 2)
    }
}

/// Register view of a live frame (little-endian words), 0 past the end of the frame.
pub fn frame_register(frame: &[u8], register: u16) -> u16 {
    match register_offset(register) {
        Some(offset) if offset + 1 < frame.len() => {
            u16::from_le_bytes([frame[offset], frame[offset + 1]])
        }
        _ => 0,
    }
}

/// Builds `count` register values starting at `address` from a live frame and the cached identity.
pub fn extract_registers(
    frame: &[u8],
    identity: Option<&BmsIdentity>,
    address: u16,
    count: u16,
) -> Result<Vec<u16>, ModbusError> {
    check_frame(frame, FrameKind::Live)?;
    Ok((0..count)
        .map(|i| {
            let register = address.wrapping_add(i);
            if is_identity_register(register) {
                identity
                    .and_then(|id| id.pseudo_register(register))
                    .unwrap_or(0)
            } else {
                frame_register(frame, register)
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy)]
enum Width {
    U8,
    U16,
    I16,
    U32,
    I32,
}

struct LiveField {
    name: &'static str,
    offset: usize,
    width: Width,
    scale: f64,
}

const fn field(name: &'static str, offset: usize, width: Width, scale: f64) -> LiveField {
    LiveField {
        name,
        offset,
        width,
        scale,
    }
}

/// Fixed offsets inside the 308-byte live frame.
const LIVE_FIELDS: &[LiveField] = &[
    field("mosfet_temperature", 144, Width::I16, 0.1),
    field("total_power", 154, Width::U32, 0.001),
    field("current", 158, Width::I32, 0.001),
    field("temperature_1", 162, Width::I16, 0.1),
    field("temperature_2", 164, Width::I16, 0.1),
    field("balance_current", 170, Width::I16, 0.001),
    field("soc", 173, Width::U8, 1.0),
    field("remaining_capacity", 174, Width::I32, 0.001),
    field("battery_capacity", 178, Width::I32, 0.001),
    field("cycle_count", 182, Width::U32, 1.0),
    field("cycle_capacity", 186, Width::I32, 0.001),
    field("soh", 190, Width::U8, 1.0),
    field("total_runtime", 194, Width::U32, 1.0),
    field("charge_switch", 198, Width::U8, 1.0),
    field("discharge_switch", 199, Width::U8, 1.0),
    field("balance_switch", 200, Width::U8, 1.0),
    field("total_voltage", 234, Width::U16, 0.01),
    field("temperature_3", 254, Width::I16, 0.1),
    field("temperature_4", 258, Width::I16, 0.1),
];

const CELL_RESISTANCE_START: usize = 80;

fn read_raw(frame: &[u8], offset: usize, width: Width) -> f64 {
    let le2 = |o: usize| [frame[o], frame[o + 1]];
    let le4 = |o: usize| [frame[o], frame[o + 1], frame[o + 2], frame[o + 3]];
    match width {
        Width::U8 => frame[offset] as f64,
        Width::U16 => u16::from_le_bytes(le2(offset)) as f64,
        Width::I16 => i16::from_le_bytes(le2(offset)) as f64,
        Width::U32 => u32::from_le_bytes(le4(offset)) as f64,
        Width::I32 => i32::from_le_bytes(le4(offset)) as f64,
    }
}

fn rounded(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Decodes a live frame into named measurements, with cell statistics.
pub fn decode_live_frame(frame: &[u8]) -> Result<BTreeMap<String, SensorValue>, ModbusError> {
    check_frame(frame, FrameKind::Live)?;
    let mut values = BTreeMap::new();

    let mut cells = Vec::with_capacity(CELL_COUNT);
    for i in 0..CELL_COUNT {
        let voltage = rounded(read_raw(frame, CELL_BYTE_START + i * 2, Width::U16) * 0.001);
        let resistance = rounded(read_raw(frame, CELL_RESISTANCE_START + i * 2, Width::I16) * 0.001);
        values.insert(format!("cell_{}_voltage", i + 1), SensorValue::Number(voltage));
        values.insert(format!("cell_{}_resistance", i + 1), SensorValue::Number(resistance));
        cells.push(voltage);
    }

    for field in LIVE_FIELDS {
        let value = rounded(read_raw(frame, field.offset, field.width) * field.scale);
        values.insert(field.name.to_string(), SensorValue::Number(value));
    }

    // Unpopulated cell slots read as 0 V.
    let populated: Vec<f64> = cells.into_iter().filter(|v| *v > 0.0).collect();
    if !populated.is_empty() {
        let max = populated.iter().copied().fold(f64::MIN, f64::max);
        let min = populated.iter().copied().fold(f64::MAX, f64::min);
        let avg = populated.iter().sum::<f64>() / populated.len() as f64;
        values.insert("cell_voltage_max".into(), SensorValue::Number(max));
        values.insert("cell_voltage_min".into(), SensorValue::Number(min));
        values.insert("cell_voltage_avg".into(), SensorValue::Number(rounded(avg)));
        values.insert("cell_voltage_delta".into(), SensorValue::Number(rounded(max - min)));
        values.insert("cell_count".into(), SensorValue::Number(populated.len() as f64));
    }

    if let (Some(voltage), Some(current)) = (
        values.get("total_voltage").and_then(SensorValue::as_f64),
        values.get("current").and_then(SensorValue::as_f64),
    ) {
        values.insert(
            "calculated_power".into(),
            SensorValue::Number(rounded(voltage * current)),
        );
    }

    Ok(values)
}
