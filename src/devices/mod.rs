pub mod batching;
pub mod equipment;
pub mod health;

pub use batching::{partition, required_addresses, RegisterBatch};
pub use equipment::{Equipment, EquipmentSettings, PollOutcome, RetryPolicy};
pub use health::{HealthStatus, HealthSummary, SensorHealth, SensorStats};
