use super::crc::{append_crc, verify_crc};
use super::protocol::{
    ExceptionCode, ResponseShape, EXCEPTION_FLAG, MAX_READ_REGISTERS, WRITE_MULTIPLE_REGISTERS,
    WRITE_SINGLE_REGISTER,
};
use crate::utils::error::ModbusError;

/// Bytes preceding the function-specific part of any RTU frame: unit id and function code.
pub const HEADER_LEN: usize = 2;
pub const CRC_LEN: usize = 2;

/// Smallest well-formed response: header, one byte, CRC (exception frames).
const MIN_RESPONSE_LEN: usize = HEADER_LEN + 1 + CRC_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Payload of an FC 01-04 read, without the byte-count prefix.
    Data(Vec<u8>),
    /// Address plus value/quantity echoed by FC 05/06/15/16.
    Echo { address: u16, value: u16 },
    Exception(ExceptionCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuResponse {
    pub unit_id: u8,
    pub function_code: u8,
    pub body: ResponseBody,
}

/// How many bytes still have to be read once the two header bytes are in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailLength {
    /// Exactly this many bytes remain, CRC included.
    Fixed(usize),
    /// One byte-count byte follows; then that many data bytes plus the CRC.
    ByteCounted,
}

/// Builds `[unit][function][payload][crc_lo][crc_hi]`.
pub fn encode_request(unit_id: u8, function_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    frame.push(unit_id);
    frame.push(function_code);
    frame.extend_from_slice(payload);
    append_crc(&mut frame);
    frame
}

pub fn read_registers_payload(start: u16, count: u16) -> Result<[u8; 4], ModbusError> {
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(ModbusError::InvalidData(format!(
            "register count {} outside 1..={}",
            count, MAX_READ_REGISTERS
        )));
    }
    let [a_hi, a_lo] = start.to_be_bytes();
    let [c_hi, c_lo] = count.to_be_bytes();
    Ok([a_hi, a_lo, c_hi, c_lo])
}

pub fn write_single_register_request(unit_id: u8, address: u16, value: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(&value.to_be_bytes());
    encode_request(unit_id, WRITE_SINGLE_REGISTER, &payload)
}

pub fn write_multiple_registers_request(
    unit_id: u8,
    start: u16,
    values: &[u16],
) -> Result<Vec<u8>, ModbusError> {
    if values.is_empty() || values.len() > 123 {
        return Err(ModbusError::InvalidData(format!(
            "cannot write {} registers in one request",
            values.len()
        )));
    }
    let mut payload = Vec::with_capacity(5 + values.len() * 2);
    payload.extend_from_slice(&start.to_be_bytes());
    payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
    payload.push((values.len() * 2) as u8);
    for value in values {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    Ok(encode_request(unit_id, WRITE_MULTIPLE_REGISTERS, &payload))
}

/// Decides the remaining length of a response from its function code.
pub fn tail_after_header(function_code: u8) -> Result<TailLength, ModbusError> {
    match ResponseShape::for_function(function_code) {
        Some(ResponseShape::Exception) => Ok(TailLength::Fixed(1 + CRC_LEN)),
        Some(ResponseShape::FixedEcho) => Ok(TailLength::Fixed(4 + CRC_LEN)),
        Some(ResponseShape::ByteCounted) => Ok(TailLength::ByteCounted),
        None => Err(ModbusError::UnsupportedFunction(function_code)),
    }
}

/// Parses one complete RTU response frame, CRC included.
pub fn decode_response(frame: &[u8]) -> Result<RtuResponse, ModbusError> {
    if frame.len() < MIN_RESPONSE_LEN {
        return Err(ModbusError::InvalidResponse(format!(
            "frame too short ({} bytes): {}",
            frame.len(),
            hex::encode(frame)
        )));
    }

    verify_crc(frame)
        .map_err(|(computed, received)| ModbusError::CrcError { computed, received })?;

    let unit_id = frame[0];
    let function_code = frame[1];
    let body_bytes = &frame[HEADER_LEN..frame.len() - CRC_LEN];

    let body = match tail_after_header(function_code)? {
        TailLength::Fixed(_) if function_code & EXCEPTION_FLAG != 0 => {
            expect_len(body_bytes, 1)?;
            ResponseBody::Exception(ExceptionCode::from(body_bytes[0]))
        }
        TailLength::Fixed(_) => {
            expect_len(body_bytes, 4)?;
            ResponseBody::Echo {
                address: u16::from_be_bytes([body_bytes[0], body_bytes[1]]),
                value: u16::from_be_bytes([body_bytes[2], body_bytes[3]]),
            }
        }
        TailLength::ByteCounted => {
            let byte_count = body_bytes[0] as usize;
            expect_len(body_bytes, byte_count + 1)?;
            ResponseBody::Data(body_bytes[1..].to_vec())
        }
    };

    Ok(RtuResponse {
        unit_id,
        function_code,
        body,
    })
}

fn expect_len(body: &[u8], expected: usize) -> Result<(), ModbusError> {
    if body.len() != expected {
        return Err(ModbusError::InvalidResponse(format!(
            "expected {} body bytes, got {}",
            expected,
            body.len()
        )));
    }
    Ok(())
}

impl RtuResponse {
    /// Checks the response against the request it answers and unwraps its body.
    ///
    /// An exception reply (function code echoed with the high bit set) becomes
    /// `ModbusError::Exception`; any other unit or function mismatch is a protocol error.
    pub fn into_body_for(
        self,
        expected_unit: u8,
        expected_function: u8,
    ) -> Result<ResponseBody, ModbusError> {
        if self.unit_id != expected_unit {
            return Err(ModbusError::UnitIdMismatch {
                expected: expected_unit,
                received: self.unit_id,
            });
        }
        match self.body {
            ResponseBody::Exception(code) if self.function_code == expected_function | EXCEPTION_FLAG => {
                Err(ModbusError::Exception {
                    function: expected_function,
                    code,
                })
            }
            _ if self.function_code != expected_function => Err(ModbusError::FunctionCodeMismatch {
                expected: expected_function,
                received: self.function_code,
            }),
            body => Ok(body),
        }
    }
}

/// Splits big-endian register bytes into register values.
pub fn registers_from_bytes(data: &[u8], expected_count: u16) -> Result<Vec<u16>, ModbusError> {
    if data.len() != expected_count as usize * 2 {
        return Err(ModbusError::InvalidResponse(format!(
            "expected {} registers, got {} data bytes",
            expected_count,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
