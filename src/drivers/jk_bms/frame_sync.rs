use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};

use crate::utils::error::ModbusError;

/// Common start of every JK BMS broadcast frame; the fifth byte names the frame type.
pub const FRAME_PREFIX: [u8; 4] = [0x55, 0xAA, 0xEB, 0x90];
pub const HEADER_LEN: usize = 5;
/// All three frame types share this length, header included.
pub const FRAME_LEN: usize = 308;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Device name and serial number, broadcast rarely ("frame 1").
    Static,
    /// Cell voltages, currents, temperatures ("frame 3").
    Live,
    /// Protection settings ("frame 2").
    Setup,
}

impl FrameKind {
    pub fn from_type_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Static),
            0x02 => Some(FrameKind::Live),
            0x03 => Some(FrameKind::Setup),
            _ => None,
        }
    }

    pub fn type_byte(&self) -> u8 {
        match self {
            FrameKind::Static => 0x01,
            FrameKind::Live => 0x02,
            FrameKind::Setup => 0x03,
        }
    }

    pub fn header(&self) -> [u8; HEADER_LEN] {
        let [a, b, c, d] = FRAME_PREFIX;
        [a, b, c, d, self.type_byte()]
    }

    /// Upper bound on how long one capture of this frame type may wait.
    pub fn max_wait(&self) -> Duration {
        match self {
            FrameKind::Live => Duration::from_secs(10),
            FrameKind::Static | FrameKind::Setup => Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JkFrame {
    pub kind: FrameKind,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No header located yet; only a possible partial header is retained.
    SeekingHeader,
    /// Buffer starts with a header of this kind; waiting for the rest of the frame.
    Accumulating(FrameKind),
    /// A frame was just sliced out of the buffer.
    Complete(FrameKind),
    /// The last capture gave up; the partial data was dropped.
    TimedOut,
}

/// Byte accumulator that carves fixed-length frames out of an unframed stream.
#[derive(Debug)]
pub struct FrameSync {
    buffer: BytesMut,
    state: SyncState,
}

impl Default for FrameSync {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSync {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(FRAME_LEN * 2),
            state: SyncState::SeekingHeader,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Advances the state machine as far as the buffered bytes allow.
    pub fn next_frame(&mut self) -> Option<JkFrame> {
        loop {
            match self.state {
                SyncState::Complete(_) | SyncState::TimedOut => {
                    self.state = SyncState::SeekingHeader;
                }
                SyncState::SeekingHeader => match find_header(&self.buffer) {
                    Some((position, kind)) => {
                        if position > 0 {
                            debug!("frame sync: skipped {} bytes before header", position);
                        }
                        self.buffer.advance(position);
                        self.state = SyncState::Accumulating(kind);
                    }
                    None => {
                        // Keep a tail that could still grow into a header.
                        let keep = self.buffer.len().min(HEADER_LEN - 1);
                        let drop = self.buffer.len() - keep;
                        self.buffer.advance(drop);
                        return None;
                    }
                },
                SyncState::Accumulating(kind) => {
                    if self.buffer.len() < FRAME_LEN {
                        return None;
                    }
                    let bytes = self.buffer.split_to(FRAME_LEN).freeze();
                    self.state = SyncState::Complete(kind);
                    return Some(JkFrame { kind, bytes });
                }
            }
        }
    }

    /// Gives up on the current partial frame.
    pub fn expire(&mut self) {
        self.buffer.clear();
        self.state = SyncState::TimedOut;
    }

    /// Drops everything, used after the underlying connection is replaced.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = SyncState::SeekingHeader;
    }
}

/// Finds the first complete header with a known frame type.
fn find_header(buffer: &[u8]) -> Option<(usize, FrameKind)> {
    buffer
        .windows(HEADER_LEN)
        .enumerate()
        .find_map(|(position, window)| {
            if window[..4] != FRAME_PREFIX {
                return None;
            }
            FrameKind::from_type_byte(window[4]).map(|kind| (position, kind))
        })
}

/// Reads from `reader` until a frame of `wanted` kind is complete or its wait bound expires.
///
/// Frames of other kinds found on the way are handed to `on_other`.
pub async fn capture<R, F>(
    reader: &mut R,
    sync: &mut FrameSync,
    wanted: FrameKind,
    mut on_other: F,
) -> Result<Bytes, ModbusError>
where
    R: AsyncRead + Unpin + ?Sized,
    F: FnMut(JkFrame),
{
    let max_wait = wanted.max_wait();
    let deadline = Instant::now() + max_wait;
    let mut chunk = [0u8; 512];

    loop {
        while let Some(frame) = sync.next_frame() {
            if frame.kind == wanted {
                return Ok(frame.bytes);
            }
            on_other(frame);
        }

        match timeout_at(deadline, reader.read(&mut chunk)).await {
            Err(_) => {
                debug!(
                    "frame sync: no {:?} frame within {:?} ({} bytes buffered)",
                    wanted,
                    max_wait,
                    sync.buffered()
                );
                sync.expire();
                return Err(ModbusError::FrameTimeout(max_wait));
            }
            Ok(Ok(0)) => return Err(ModbusError::ConnectionClosed),
            Ok(Ok(n)) => sync.push(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_frame(kind: FrameKind, fill: u8) -> Vec<u8> {
    let mut frame = vec![fill; FRAME_LEN];
    frame[..HEADER_LEN].copy_from_slice(&kind.header());
    frame
}
