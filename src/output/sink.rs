use async_trait::async_trait;
use log::{debug, error};
use std::collections::BTreeMap;

use super::formatters::{DataFormatter, Reading};
use super::senders::DataSender;
use crate::registers::SensorValue;
use crate::utils::error::ModbusError;

/// Where decoded values go once a poll cycle completes.
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    async fn publish(
        &self,
        equipment: &str,
        manufacturer: &str,
        values: &BTreeMap<String, SensorValue>,
    ) -> Result<(), ModbusError>;

    /// Marks the equipment unavailable after persistent failures.
    async fn publish_offline(&self, equipment: &str, manufacturer: &str) -> Result<(), ModbusError>;
}

/// Formats each reading once and fans it out to every sender.
pub struct PublishingSink {
    collector_id: String,
    formatter: Box<dyn DataFormatter>,
    senders: Vec<Box<dyn DataSender>>,
}

impl PublishingSink {
    pub fn new(collector_id: impl Into<String>, formatter: Box<dyn DataFormatter>) -> Self {
        Self {
            collector_id: collector_id.into(),
            formatter,
            senders: Vec::new(),
        }
    }

    pub fn with_sender(mut self, sender: Box<dyn DataSender>) -> Self {
        debug!("📤 Added {} sender to {}", sender.sender_type(), sender.destination());
        self.senders.push(sender);
        self
    }

    pub fn senders(&self) -> impl Iterator<Item = &dyn DataSender> {
        self.senders.iter().map(|s| s.as_ref())
    }

    async fn broadcast(&self, reading: &Reading) -> Result<(), ModbusError> {
        let data = self.formatter.format_reading(reading).map_err(|e| {
            error!("❌ Failed to format reading for {}: {}", reading.equipment, e);
            e
        })?;
        let mut last_error = None;

        for sender in &self.senders {
            if let Err(e) = sender.send(&data).await {
                error!(
                    "❌ Failed to send data via {} to {}: {}",
                    sender.sender_type(),
                    sender.destination(),
                    e
                );
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MeasurementSink for PublishingSink {
    async fn publish(
        &self,
        equipment: &str,
        manufacturer: &str,
        values: &BTreeMap<String, SensorValue>,
    ) -> Result<(), ModbusError> {
        let reading = Reading::new(&self.collector_id, equipment, manufacturer, values.clone());
        self.broadcast(&reading).await
    }

    async fn publish_offline(&self, equipment: &str, manufacturer: &str) -> Result<(), ModbusError> {
        let reading = Reading::offline(&self.collector_id, equipment, manufacturer);
        self.broadcast(&reading).await
    }
}
