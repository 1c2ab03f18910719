use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::modbus::protocol::MAX_READ_REGISTERS;
use crate::registers::FieldDescriptor;

/// One contiguous read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBatch {
    pub start: u16,
    pub count: u16,
}

impl RegisterBatch {
    pub fn end(&self) -> u16 {
        self.start + (self.count - 1)
    }

    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        let start = self.start;
        (0..self.count).map(move |i| start + i)
    }
}

impl fmt::Display for RegisterBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} to {}]", self.start, self.end())
    }
}

/// Every distinct address used by `fields`, multi-register fields flattened.
pub fn required_addresses(fields: &BTreeMap<String, FieldDescriptor>) -> BTreeSet<u16> {
    fields
        .values()
        .flat_map(|field| field.addresses().iter().copied())
        .collect()
}

/// Splits ascending addresses into contiguous runs of at most `batch_size` registers.
///
/// A gap always starts a new run, so unused registers between fields are never requested.
pub fn partition(addresses: &BTreeSet<u16>, batch_size: u16) -> Vec<RegisterBatch> {
    let limit = batch_size.clamp(1, MAX_READ_REGISTERS);
    let mut batches: Vec<RegisterBatch> = Vec::new();

    for &address in addresses {
        match batches.last_mut() {
            Some(batch) if batch.end().checked_add(1) == Some(address) && batch.count < limit => {
                batch.count += 1;
            }
            _ => batches.push(RegisterBatch {
                start: address,
                count: 1,
            }),
        }
    }
    batches
}
