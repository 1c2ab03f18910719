pub mod decoder;
pub mod descriptor;

pub use decoder::{decode, decode_all, DecodeError, RegisterMap, SensorValue};
pub use descriptor::{Addresses, Endianness, FieldDescriptor, FieldKind, LookupTable};
