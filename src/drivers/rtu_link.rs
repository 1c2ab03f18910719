use log::{debug, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::modbus::frame::{
    decode_response, encode_request, read_registers_payload, registers_from_bytes,
    tail_after_header, write_multiple_registers_request, write_single_register_request,
    ResponseBody, TailLength, HEADER_LEN,
};
use crate::modbus::protocol::{
    READ_HOLDING_REGISTERS, WRITE_MULTIPLE_REGISTERS, WRITE_SINGLE_REGISTER,
};
use crate::utils::error::ModbusError;

/// Any byte pipe an RTU frame can travel over (serial line, TCP socket, in-memory duplex).
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Longest a stale-byte drain waits for the line to go quiet.
const DRAIN_QUIET: Duration = Duration::from_millis(50);
const DRAIN_LIMIT: usize = 4096;

/// Discards whatever arrives on `stream` until the line stays quiet briefly.
///
/// Returns the number of bytes thrown away.
pub async fn drain_pending<S>(stream: &mut S) -> usize
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut scratch = [0u8; 256];
    let mut discarded = 0usize;
    while discarded < DRAIN_LIMIT {
        match timeout(DRAIN_QUIET, stream.read(&mut scratch)).await {
            Ok(Ok(n)) if n > 0 => discarded += n,
            _ => break,
        }
    }
    discarded
}

/// Reads one RTU response whose length is only known once its header is in.
pub async fn read_response_frame<R>(reader: &mut R) -> Result<Vec<u8>, ModbusError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut frame = vec![0u8; HEADER_LEN];
    reader.read_exact(&mut frame).await?;

    match tail_after_header(frame[1])? {
        TailLength::Fixed(len) => {
            let start = frame.len();
            frame.resize(start + len, 0);
            reader.read_exact(&mut frame[start..]).await?;
        }
        TailLength::ByteCounted => {
            let byte_count = reader.read_u8().await?;
            frame.push(byte_count);
            let start = frame.len();
            frame.resize(start + byte_count as usize + 2, 0);
            reader.read_exact(&mut frame[start..]).await?;
        }
    }
    Ok(frame)
}

/// Request/response Modbus RTU session over an arbitrary byte stream.
pub struct RtuLink {
    stream: Box<dyn ByteStream>,
    response_timeout: Duration,
    /// Set after a failed exchange: unread bytes may still be in flight.
    dirty: bool,
}

impl RtuLink {
    pub fn new(stream: Box<dyn ByteStream>, response_timeout: Duration) -> Self {
        Self {
            stream,
            response_timeout,
            dirty: false,
        }
    }

    pub fn set_response_timeout(&mut self, response_timeout: Duration) {
        self.response_timeout = response_timeout;
    }

    pub fn stream_mut(&mut self) -> &mut (dyn ByteStream + 'static) {
        self.stream.as_mut()
    }

    /// Writes a frame without waiting for an answer.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), ModbusError> {
        debug!("➡️  TX {}", hex::encode(frame));
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends `request` and returns the validated body of the matching response.
    pub async fn transact(
        &mut self,
        request: &[u8],
        unit_id: u8,
        function_code: u8,
    ) -> Result<ResponseBody, ModbusError> {
        if self.dirty {
            self.drain_stale().await;
        }

        let result = self.exchange(request, unit_id, function_code).await;
        self.dirty = result.is_err();
        result
    }

    async fn exchange(
        &mut self,
        request: &[u8],
        unit_id: u8,
        function_code: u8,
    ) -> Result<ResponseBody, ModbusError> {
        self.send(request).await?;

        let frame = timeout(self.response_timeout, read_response_frame(self.stream.as_mut())).await??;
        debug!("⬅️  RX {}", hex::encode(&frame));

        decode_response(&frame)?.into_body_for(unit_id, function_code)
    }

    async fn drain_stale(&mut self) {
        let discarded = drain_pending(self.stream.as_mut()).await;
        if discarded > 0 {
            warn!("🧹 Discarded {} stale bytes before next request", discarded);
        }
        self.dirty = false;
    }

    pub async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let payload = read_registers_payload(start, count)?;
        let request = encode_request(unit_id, READ_HOLDING_REGISTERS, &payload);
        match self.transact(&request, unit_id, READ_HOLDING_REGISTERS).await? {
            ResponseBody::Data(data) => registers_from_bytes(&data, count),
            other => Err(ModbusError::InvalidResponse(format!(
                "unexpected body for read: {:?}",
                other
            ))),
        }
    }

    pub async fn write_single_register(
        &mut self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        let request = write_single_register_request(unit_id, address, value);
        match self.transact(&request, unit_id, WRITE_SINGLE_REGISTER).await? {
            ResponseBody::Echo { address: a, value: v } if a == address && v == value => Ok(()),
            other => Err(ModbusError::InvalidResponse(format!(
                "write echo does not match request: {:?}",
                other
            ))),
        }
    }

    pub async fn write_multiple_registers(
        &mut self,
        unit_id: u8,
        start: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let request = write_multiple_registers_request(unit_id, start, values)?;
        match self.transact(&request, unit_id, WRITE_MULTIPLE_REGISTERS).await? {
            ResponseBody::Echo { address, value } if address == start && value as usize == values.len() => {
                Ok(())
            }
            other => Err(ModbusError::InvalidResponse(format!(
                "write echo does not match request: {:?}",
                other
            ))),
        }
    }
}
