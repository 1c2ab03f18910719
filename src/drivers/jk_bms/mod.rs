//! JK BMS broadcast listener.
//!
//! The BMS does not answer Modbus reads. It broadcasts fixed 308-byte frames on
//! its RS-485 port: a live frame every few seconds and, more rarely, a static
//! frame with its name and serial number. In active mode the driver provokes a
//! broadcast by writing a dummy value to a trigger register first.
//!
//! Register reads are served from the most recent live frame (see
//! [`layout::extract_registers`]), so the rest of the collector can treat the
//! BMS like any other Modbus device.

pub mod frame_sync;
pub mod layout;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use self::frame_sync::{capture, FrameKind, FrameSync, JkFrame};
use self::layout::{extract_registers, is_identity_register, BmsIdentity};
use super::rtu_link::{drain_pending, ByteStream};
use super::serial::{open_serial, SerialSettings};
use super::tcp::open_tcp;
use super::traits::{DriverKind, LinkState, ModbusDriver, TransportEndpoint};
use crate::modbus::frame::write_multiple_registers_request;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JkBmsMode {
    /// Only listen to spontaneous broadcasts.
    #[default]
    Passive,
    /// Send a trigger write before every capture.
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JkBmsSettings {
    pub mode: JkBmsMode,
    /// Unit id used in trigger frames.
    pub trigger_unit_id: u8,
    pub static_refresh_seconds: u64,
    /// A live frame younger than this serves further reads without a new capture.
    pub live_cache_ms: u64,
}

impl Default for JkBmsSettings {
    fn default() -> Self {
        Self {
            mode: JkBmsMode::Passive,
            trigger_unit_id: 1,
            static_refresh_seconds: 60,
            live_cache_ms: 2000,
        }
    }
}

/// Longest a single register read can legitimately take: an identity refresh
/// followed by a live capture.
pub fn max_read_wait() -> Duration {
    FrameKind::Static.max_wait() + FrameKind::Live.max_wait()
}

pub struct JkBmsDriver {
    endpoint: TransportEndpoint,
    serial: SerialSettings,
    settings: JkBmsSettings,
    stream: Option<Box<dyn ByteStream>>,
    sync: FrameSync,
    state: LinkState,
    identity: Option<BmsIdentity>,
    identity_at: Option<Instant>,
    live: Option<(Bytes, Instant)>,
}

impl JkBmsDriver {
    pub fn new(endpoint: TransportEndpoint, serial: SerialSettings, settings: JkBmsSettings) -> Self {
        Self {
            endpoint,
            serial,
            settings,
            stream: None,
            sync: FrameSync::new(),
            state: LinkState::Disconnected,
            identity: None,
            identity_at: None,
            live: None,
        }
    }

    /// Wraps an already open stream (in-memory pipes in tests, pre-opened ports).
    pub fn with_stream(
        endpoint: TransportEndpoint,
        settings: JkBmsSettings,
        stream: Box<dyn ByteStream>,
    ) -> Self {
        let mut driver = Self::new(endpoint, SerialSettings::jk_bms(), settings);
        driver.stream = Some(stream);
        driver.state = LinkState::Connected;
        driver
    }

    pub fn identity(&self) -> Option<&BmsIdentity> {
        self.identity.as_ref()
    }

    fn absorb(&mut self, frame: JkFrame) {
        match frame.kind {
            FrameKind::Static => match BmsIdentity::from_static_frame(&frame.bytes) {
                Ok(identity) => {
                    if self.identity.as_ref() != Some(&identity) {
                        info!(
                            "🔋 BMS identified on {} - Name: '{}', Serial: '{}'",
                            self.endpoint, identity.name, identity.serial
                        );
                    }
                    self.identity = Some(identity);
                    self.identity_at = Some(Instant::now());
                }
                Err(e) => warn!("⚠️  Ignoring malformed static frame: {}", e),
            },
            FrameKind::Live => self.live = Some((frame.bytes, Instant::now())),
            FrameKind::Setup => debug!("setup frame seen on {}", self.endpoint),
        }
    }

    async fn trigger(&mut self, kind: FrameKind) -> Result<(), ModbusError> {
        let register = match kind {
            FrameKind::Static => layout::TRIGGER_STATIC,
            FrameKind::Setup => layout::TRIGGER_SETUP,
            FrameKind::Live => layout::TRIGGER_LIVE,
        };
        let request = write_multiple_registers_request(self.settings.trigger_unit_id, register, &[0x0000])?;
        let stream = self.stream.as_mut().ok_or(ModbusError::NotConnected)?;
        debug!("➡️  JK trigger {:#06X}: {}", register, hex::encode(&request));

        stream.write_all(&request).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Drops buffered broadcasts so the next frame is the answer to a fresh trigger.
    async fn discard_backlog(&mut self) -> Result<(), ModbusError> {
        self.sync.reset();
        let stream = self.stream.as_mut().ok_or(ModbusError::NotConnected)?;
        let discarded = drain_pending(stream.as_mut()).await;
        if discarded > 0 {
            debug!("🧹 Discarded {} buffered bytes on {} before trigger", discarded, self.endpoint);
        }
        Ok(())
    }

    /// Waits for the next frame of `kind`, triggering it first in active mode.
    pub async fn capture_frame(&mut self, kind: FrameKind) -> Result<Bytes, ModbusError> {
        if self.settings.mode == JkBmsMode::Active {
            self.discard_backlog().await?;
            self.trigger(kind).await?;
        }

        let stream = self.stream.as_mut().ok_or(ModbusError::NotConnected)?;
        let mut others = Vec::new();
        let result = capture(stream.as_mut(), &mut self.sync, kind, |frame| others.push(frame)).await;
        for frame in others {
            self.absorb(frame);
        }

        let result = result.map(|bytes| {
            self.absorb(JkFrame {
                kind,
                bytes: bytes.clone(),
            });
            bytes
        });
        self.settle(&result);
        result
    }

    fn settle<T>(&mut self, result: &Result<T, ModbusError>) {
        self.state = LinkState::after_request(result);
        if self.state == LinkState::Disconnected {
            warn!("⚠️  JK BMS link {} lost", self.endpoint);
            self.stream = None;
            self.sync.reset();
        }
    }

    fn identity_is_stale(&self) -> bool {
        match self.identity_at {
            Some(at) => at.elapsed() > Duration::from_secs(self.settings.static_refresh_seconds),
            None => true,
        }
    }

    async fn refresh_identity(&mut self) -> Result<(), ModbusError> {
        debug!("Attempting to capture static frame for serial number on {}", self.endpoint);
        match self.capture_frame(FrameKind::Static).await {
            Ok(_) => Ok(()),
            Err(e) if e.requires_reconnect() => Err(e),
            Err(e) => {
                // Identity registers keep their previous (or zero) value.
                warn!("⚠️  No static frame from {}: {}", self.endpoint, e);
                Ok(())
            }
        }
    }

    async fn live_frame(&mut self) -> Result<Bytes, ModbusError> {
        let max_age = Duration::from_millis(self.settings.live_cache_ms);
        if let Some((frame, at)) = &self.live {
            if at.elapsed() <= max_age {
                return Ok(frame.clone());
            }
        }
        self.capture_frame(FrameKind::Live).await
    }
}

#[async_trait]
impl ModbusDriver for JkBmsDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::JkBms
    }

    fn endpoint(&self) -> &TransportEndpoint {
        &self.endpoint
    }

    fn state(&self) -> LinkState {
        self.state
    }

    async fn connect(&mut self, timeout: Duration) -> Result<(), ModbusError> {
        self.state = LinkState::Connecting;
        info!("🔌 Connecting to JK BMS at {} ({:?} mode)", self.endpoint, self.settings.mode);

        let opened: Result<Box<dyn ByteStream>, ModbusError> = if self.endpoint.is_serial() {
            open_serial(&self.endpoint.host, &self.serial)
                .await
                .map(|s| Box::new(s) as Box<dyn ByteStream>)
        } else {
            open_tcp(&self.endpoint, timeout)
                .await
                .map(|s| Box::new(s) as Box<dyn ByteStream>)
        };

        match opened {
            Ok(stream) => {
                self.stream = Some(stream);
                self.sync.reset();
                self.live = None;
                self.state = LinkState::Connected;
                info!("✅ JK BMS connected on {}", self.endpoint);
                Ok(())
            }
            Err(e) => {
                self.state = LinkState::Disconnected;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!("🔌 JK BMS disconnected from {}", self.endpoint);
        }
        self.sync.reset();
        self.live = None;
        self.state = LinkState::Disconnected;
    }

    /// `unit_id` is ignored: the BMS broadcasts to whoever listens.
    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
        _unit_id: u8,
    ) -> Result<Vec<u16>, ModbusError> {
        if self.stream.is_none() {
            return Err(ModbusError::NotConnected);
        }

        let wants_identity = (0..count).any(|i| is_identity_register(address.wrapping_add(i)));
        if wants_identity && self.identity_is_stale() {
            self.refresh_identity().await?;
        }

        let frame = self.live_frame().await?;
        extract_registers(&frame, self.identity.as_ref(), address, count)
    }

    fn abort(&mut self) {
        self.stream = None;
        self.sync.reset();
        self.live = None;
        self.state = LinkState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::frame_sync::test_frame;
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn live_with_cell(mv: u16) -> Vec<u8> {
        let mut frame = test_frame(FrameKind::Live, 0);
        frame[6..8].copy_from_slice(&mv.to_le_bytes());
        frame
    }

    #[tokio::test]
    async fn test_passive_read_serves_cell_register() {
        let (client, mut bms) = duplex(4096);
        let mut driver = JkBmsDriver::with_stream(
            TransportEndpoint::serial("/dev/ttyUSB1"),
            JkBmsSettings::default(),
            Box::new(client),
        );

        // Broadcast split at an awkward place.
        let frame = live_with_cell(3321);
        bms.write_all(&[0xAA, 0x00]).await.unwrap();
        bms.write_all(&frame[..3]).await.unwrap();
        bms.write_all(&frame[3..]).await.unwrap();

        let registers = driver.read_registers(layout::CELL_REGISTER_START, 2, 1).await.unwrap();
        assert_eq!(registers, vec![3321, 0]);
        assert_eq!(driver.state(), LinkState::Connected);

        // Served from the cached frame, nothing new on the wire.
        let again = driver.read_registers(layout::CELL_REGISTER_START, 1, 1).await.unwrap();
        assert_eq!(again, vec![3321]);
    }

    #[tokio::test]
    async fn test_identity_registers_use_static_frame() {
        let (client, mut bms) = duplex(4096);
        let mut driver = JkBmsDriver::with_stream(
            TransportEndpoint::serial("/dev/ttyUSB1"),
            JkBmsSettings::default(),
            Box::new(client),
        );

        let mut static_frame = test_frame(FrameKind::Static, 0);
        static_frame[46..50].copy_from_slice(b"SN01");
        bms.write_all(&static_frame).await.unwrap();
        bms.write_all(&live_with_cell(3300)).await.unwrap();

        let registers = driver.read_registers(layout::SERIAL_REGISTER_START, 3, 1).await.unwrap();
        assert_eq!(
            registers,
            vec![u16::from_be_bytes(*b"SN"), u16::from_be_bytes(*b"01"), 0]
        );
        assert_eq!(driver.identity().unwrap().serial, "SN01");
    }

    #[tokio::test]
    async fn test_active_mode_sends_trigger() {
        let (client, mut bms) = duplex(4096);
        let settings = JkBmsSettings {
            mode: JkBmsMode::Active,
            trigger_unit_id: 2,
            ..JkBmsSettings::default()
        };
        let mut driver = JkBmsDriver::with_stream(
            TransportEndpoint::serial("/dev/ttyUSB1"),
            settings,
            Box::new(client),
        );

        let responder = tokio::spawn(async move {
            let mut trigger = [0u8; 11];
            bms.read_exact(&mut trigger).await.unwrap();
            bms.write_all(&live_with_cell(3290)).await.unwrap();
            trigger
        });

        let registers = driver.read_registers(layout::CELL_REGISTER_START, 1, 2).await.unwrap();
        assert_eq!(registers, vec![3290]);

        let trigger = responder.await.unwrap();
        assert_eq!(&trigger[..9], &[0x02, 0x10, 0x16, 0x20, 0x00, 0x01, 0x02, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_active_mode_ignores_broadcast_sent_before_trigger() {
        let (client, mut bms) = duplex(4096);
        let settings = JkBmsSettings {
            mode: JkBmsMode::Active,
            ..JkBmsSettings::default()
        };
        let mut driver = JkBmsDriver::with_stream(
            TransportEndpoint::serial("/dev/ttyUSB1"),
            settings,
            Box::new(client),
        );

        // An old broadcast plus the start of another are already buffered.
        let stale = live_with_cell(3100);
        bms.write_all(&stale).await.unwrap();
        bms.write_all(&stale[..40]).await.unwrap();

        let responder = tokio::spawn(async move {
            let mut trigger = [0u8; 11];
            bms.read_exact(&mut trigger).await.unwrap();
            bms.write_all(&live_with_cell(3345)).await.unwrap();
            bms
        });

        let registers = driver.read_registers(layout::CELL_REGISTER_START, 1, 1).await.unwrap();
        assert_eq!(registers, vec![3345]);
        drop(responder.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_bms_reports_frame_timeout() {
        let (client, _bms) = duplex(4096);
        let mut driver = JkBmsDriver::with_stream(
            TransportEndpoint::serial("/dev/ttyUSB1"),
            JkBmsSettings::default(),
            Box::new(client),
        );

        let err = driver.read_registers(layout::CELL_REGISTER_START, 1, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::FrameTimeout(_)));
        assert_eq!(driver.state(), LinkState::Degraded);
    }

    #[tokio::test]
    async fn test_abort_drops_stream() {
        let (client, _bms) = duplex(64);
        let mut driver = JkBmsDriver::with_stream(
            TransportEndpoint::serial("/dev/ttyUSB1"),
            JkBmsSettings::default(),
            Box::new(client),
        );
        driver.abort();
        assert!(!driver.is_connected());
        assert!(matches!(
            driver.read_registers(layout::CELL_REGISTER_START, 1, 1).await,
            Err(ModbusError::NotConnected)
        ));
    }
}
