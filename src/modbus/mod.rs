pub mod crc;
pub mod frame;
pub mod protocol;

pub use crc::crc16_modbus;
pub use frame::{decode_response, encode_request, ResponseBody, RtuResponse};
pub use protocol::ExceptionCode;
