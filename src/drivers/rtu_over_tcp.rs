use async_trait::async_trait;
use log::{error, info, warn};
use std::time::Duration;

use super::rtu_link::RtuLink;
use super::tcp::open_tcp;
use super::traits::{DriverKind, LinkState, ModbusDriver, TransportEndpoint};
use crate::utils::error::ModbusError;

/// Modbus RTU frames over a plain TCP socket, for transparent RS-485 gateways.
///
/// Every response is checked for CRC, unit id and function code; failures are
/// returned as-is, retries belong to the caller.
pub struct RawTcpRtuDriver {
    endpoint: TransportEndpoint,
    link: Option<RtuLink>,
    state: LinkState,
}

impl RawTcpRtuDriver {
    pub fn new(endpoint: TransportEndpoint) -> Self {
        Self {
            endpoint,
            link: None,
            state: LinkState::Disconnected,
        }
    }

    fn link(&mut self) -> Result<&mut RtuLink, ModbusError> {
        self.link.as_mut().ok_or(ModbusError::NotConnected)
    }

    fn settle<T>(&mut self, result: Result<T, ModbusError>) -> Result<T, ModbusError> {
        self.state = LinkState::after_request(&result);
        if self.state == LinkState::Disconnected {
            warn!("⚠️  Gateway connection {} lost", self.endpoint);
            self.link = None;
        }
        result
    }

    pub async fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
        unit_id: u8,
    ) -> Result<(), ModbusError> {
        let result = self.link()?.write_single_register(unit_id, address, value).await;
        self.settle(result)
    }

    pub async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
        unit_id: u8,
    ) -> Result<(), ModbusError> {
        let result = self.link()?.write_multiple_registers(unit_id, address, values).await;
        self.settle(result)
    }
}

#[async_trait]
impl ModbusDriver for RawTcpRtuDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::RawTcpRtu
    }

    fn endpoint(&self) -> &TransportEndpoint {
        &self.endpoint
    }

    fn state(&self) -> LinkState {
        self.state
    }

    async fn connect(&mut self, timeout: Duration) -> Result<(), ModbusError> {
        self.state = LinkState::Connecting;
        match open_tcp(&self.endpoint, timeout).await {
            Ok(stream) => {
                self.link = Some(RtuLink::new(Box::new(stream), timeout));
                self.state = LinkState::Connected;
                info!("✅ Connected to RTU gateway {}", self.endpoint);
                Ok(())
            }
            Err(e) => {
                error!("❌ TCP connection error for {}: {}", self.endpoint, e);
                self.state = LinkState::Disconnected;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.link.take().is_some() {
            info!("🔌 TCP connection to {} closed", self.endpoint);
        }
        self.state = LinkState::Disconnected;
    }

    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, ModbusError> {
        let result = self.link()?.read_holding_registers(unit_id, address, count).await;
        self.settle(result)
    }

    fn abort(&mut self) {
        self.link = None;
        self.state = LinkState::Disconnected;
    }
}
