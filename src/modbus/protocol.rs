use std::fmt;

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

pub const EXCEPTION_FLAG: u8 = 0x80;

/// Largest register count a single FC 03/04 request may ask for.
pub const MAX_READ_REGISTERS: u16 = 125;

/// How the remainder of a response is laid out once its two header bytes are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Exception byte followed by the CRC.
    Exception,
    /// Byte-count prefix, that many data bytes, then the CRC.
    ByteCounted,
    /// Address and quantity/value echo (4 bytes) followed by the CRC.
    FixedEcho,
}

impl ResponseShape {
    pub fn for_function(function_code: u8) -> Option<Self> {
        if function_code & EXCEPTION_FLAG != 0 {
            return Some(ResponseShape::Exception);
        }
        match function_code {
            READ_COILS | READ_DISCRETE_INPUTS | READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => {
                Some(ResponseShape::ByteCounted)
            }
            WRITE_SINGLE_COIL | WRITE_SINGLE_REGISTER | WRITE_MULTIPLE_COILS
            | WRITE_MULTIPLE_REGISTERS => Some(ResponseShape::FixedEcho),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetNoResponse,
    Unknown(u8),
}

impl ExceptionCode {
    pub fn code(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetNoResponse => 0x0B,
            ExceptionCode::Unknown(code) => *code,
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetNoResponse,
            other => ExceptionCode::Unknown(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::IllegalFunction => write!(f, "Illegal Function"),
            ExceptionCode::IllegalDataAddress => write!(f, "Illegal Data Address"),
            ExceptionCode::IllegalDataValue => write!(f, "Illegal Data Value"),
            ExceptionCode::ServerDeviceFailure => write!(f, "Server Device Failure"),
            ExceptionCode::Acknowledge => write!(f, "Acknowledge"),
            ExceptionCode::ServerDeviceBusy => write!(f, "Server Device Busy"),
            ExceptionCode::MemoryParityError => write!(f, "Memory Parity Error"),
            ExceptionCode::GatewayPathUnavailable => write!(f, "Gateway Path Unavailable"),
            ExceptionCode::GatewayTargetNoResponse => {
                write!(f, "Gateway Target Device Failed to Respond")
            }
            ExceptionCode::Unknown(code) => write!(f, "Unknown exception {:#04X}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shape() {
        assert_eq!(ResponseShape::for_function(0x03), Some(ResponseShape::ByteCounted));
        assert_eq!(ResponseShape::for_function(0x10), Some(ResponseShape::FixedEcho));
        assert_eq!(ResponseShape::for_function(0x83), Some(ResponseShape::Exception));
        assert_eq!(ResponseShape::for_function(0x2B), None);
    }

    #[test]
    fn test_exception_names() {
        assert_eq!(ExceptionCode::from(0x02).to_string(), "Illegal Data Address");
        assert_eq!(ExceptionCode::from(0x42), ExceptionCode::Unknown(0x42));
        assert_eq!(ExceptionCode::from(0x0B).code(), 0x0B);
    }
}
