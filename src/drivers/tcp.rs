use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::{Client, Reader, Slave, SlaveContext};

use super::traits::{DriverKind, LinkState, ModbusDriver, TransportEndpoint};
use crate::modbus::protocol::{ExceptionCode, READ_HOLDING_REGISTERS};
use crate::utils::error::ModbusError;

pub(crate) async fn resolve(endpoint: &TransportEndpoint) -> Result<SocketAddr, ModbusError> {
    lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| ModbusError::ConnectionError(format!("cannot resolve {}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| ModbusError::ConnectionError(format!("no address for {}", endpoint)))
}

/// Opens a TCP connection bounded by `limit`, classifying refusals and timeouts.
pub(crate) async fn open_tcp(
    endpoint: &TransportEndpoint,
    limit: Duration,
) -> Result<TcpStream, ModbusError> {
    let addr = resolve(endpoint).await?;
    let stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| ModbusError::ConnectionError(format!("connect to {} timed out", endpoint)))?
        .map_err(|e| ModbusError::ConnectionError(format!("connect to {} failed: {}", endpoint, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Opens and immediately closes a TCP connection to fail fast on a severed link.
pub async fn probe_tcp(endpoint: &TransportEndpoint, limit: Duration) -> Result<(), ModbusError> {
    let stream = open_tcp(endpoint, limit).await?;
    drop(stream);
    debug!("connectivity probe to {} succeeded", endpoint);
    Ok(())
}

/// Modbus TCP client (MBAP framing handled by tokio-modbus).
pub struct ModbusTcpDriver {
    endpoint: TransportEndpoint,
    ctx: Option<Context>,
    state: LinkState,
    request_timeout: Duration,
}

impl ModbusTcpDriver {
    pub fn new(endpoint: TransportEndpoint) -> Self {
        Self {
            endpoint,
            ctx: None,
            state: LinkState::Disconnected,
            request_timeout: Duration::from_secs(5),
        }
    }
}

fn transport_error(err: tokio_modbus::Error) -> ModbusError {
    match err {
        tokio_modbus::Error::Transport(io) => ModbusError::from(io),
        tokio_modbus::Error::Protocol(protocol) => {
            ModbusError::InvalidResponse(format!("protocol error: {:?}", protocol))
        }
    }
}

#[async_trait]
impl ModbusDriver for ModbusTcpDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::ModbusTcp
    }

    fn endpoint(&self) -> &TransportEndpoint {
        &self.endpoint
    }

    fn state(&self) -> LinkState {
        self.state
    }

    async fn connect(&mut self, limit: Duration) -> Result<(), ModbusError> {
        self.state = LinkState::Connecting;
        self.request_timeout = limit;
        info!("🔌 Connecting to Modbus TCP server at {}", self.endpoint);

        let attempt = async {
            let addr = resolve(&self.endpoint).await?;
            timeout(limit, tcp::connect(addr))
                .await?
                .map_err(|e| ModbusError::ConnectionError(format!("{}: {}", self.endpoint, e)))
        };

        match attempt.await {
            Ok(ctx) => {
                self.ctx = Some(ctx);
                self.state = LinkState::Connected;
                info!("✅ Connected to {}", self.endpoint);
                Ok(())
            }
            Err(e) => {
                error!("❌ TCP connection to {} failed: {}", self.endpoint, e);
                self.state = LinkState::Disconnected;
                Err(match e {
                    ModbusError::Timeout => {
                        ModbusError::ConnectionError(format!("connect to {} timed out", self.endpoint))
                    }
                    other => other,
                })
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.disconnect().await {
                debug!("disconnect from {} reported: {}", self.endpoint, e);
            }
            info!("🔌 Disconnected from {}", self.endpoint);
        }
        self.state = LinkState::Disconnected;
    }

    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, ModbusError> {
        let ctx = self.ctx.as_mut().ok_or(ModbusError::NotConnected)?;
        ctx.set_slave(Slave(unit_id));

        let result = match timeout(self.request_timeout, ctx.read_holding_registers(address, count)).await {
            Err(_) => Err(ModbusError::Timeout),
            Ok(Err(e)) => Err(transport_error(e)),
            Ok(Ok(Err(exception))) => Err(ModbusError::Exception {
                function: READ_HOLDING_REGISTERS,
                code: ExceptionCode::from(u8::from(exception)),
            }),
            Ok(Ok(Ok(registers))) => Ok(registers),
        };

        self.state = LinkState::after_request(&result);
        if self.state == LinkState::Disconnected {
            warn!("⚠️  Modbus TCP session to {} lost", self.endpoint);
            self.ctx = None;
        }
        result
    }

    fn abort(&mut self) {
        self.ctx = None;
        self.state = LinkState::Disconnected;
    }
}
