//! Frame reading for the client-to-backend direction.
//!
//! The transport does not announce frame boundaries, so every frame is
//! classified by its leading byte and read to exactly its declared length.
//! Three layouts are recognised:
//!
//! ```text
//! TPKT        | 0x03 | reserved | total len (u16 BE, incl. 4-byte header) | payload
//! TLS record  | 0x14..=0x17 | 2 reserved | payload len (u16 BE, excl. 5-byte header) | payload
//! fast-path   | 0x60, 0x84, 0xB0, 0xB8 | total len (u8, incl. 2-byte header) | payload
//! ```
//!
//! The first frame of a connection must be TPKT; it carries the routing
//! cookie (see [`routing_cookie`]).

use std::io;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{error, warn};

/// Leading byte of a TPKT frame.
pub const TPKT_VERSION: u8 = 3;

/// Byte offset in the first frame where the routing cookie starts.
pub const COOKIE_OFFSET: usize = 11;

/// Carriage return terminates the routing cookie.
pub const COOKIE_TERMINATOR: u8 = 0x0D;

const TPKT_HEADER_LEN: usize = 4;
const TLS_HEADER_LEN: usize = 5;
const FAST_PATH_HEADER_LEN: usize = 2;

const INITIAL_CAPACITY: usize = 1000;

/// Upper bound on bytes drained after an unrecognised leading byte.
const MAX_DRAIN_BYTES: usize = 64 * 1024;

/// Framing variant of a parsed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// TPKT: one reserved byte and a 16-bit total length.
    Tpkt,
    /// TLS record: two reserved bytes and a 16-bit payload length.
    TlsRecord,
    /// Fast-path: a single total-length byte.
    FastPath,
}

impl FrameKind {
    /// Classify a frame by its leading byte.
    pub fn classify(lead: u8) -> Option<Self> {
        match lead {
            TPKT_VERSION => Some(Self::Tpkt),
            20..=23 => Some(Self::TlsRecord),
            96 | 132 | 176 | 184 => Some(Self::FastPath),
            _ => None,
        }
    }
}

/// Reusable frame buffer.
///
/// Holds exactly one complete frame (header included) after a successful
/// read. The backing storage only ever grows, so a stream of similarly
/// sized frames does not allocate per frame.
#[derive(Debug, Clone)]
pub struct FrameBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FrameBuf {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; INITIAL_CAPACITY],
            len: 0,
        }
    }

    /// Set the logical length to `len`, growing the backing storage to
    /// exactly `len` bytes if it is too small.
    ///
    /// Bytes past the previous length are unspecified until overwritten.
    pub fn grow_and_set_len(&mut self, len: usize) {
        self.len = len;
        if len <= self.buf.len() {
            return;
        }
        let mut grown = vec![0u8; len];
        grown[..self.buf.len()].copy_from_slice(&self.buf);
        self.buf = grown;
    }

    /// Logical length of the current frame.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of the current frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the first frame of a new client connection.
///
/// Returns `Ok(None)` when the stream ends before any byte arrives, when the
/// leading byte is not [`TPKT_VERSION`] (nothing past that byte is consumed),
/// or when the declared length is shorter than the header.
pub async fn read_first_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    frame: &mut FrameBuf,
) -> io::Result<Option<FrameKind>> {
    let Some(lead) = read_lead_byte(stream).await? else {
        return Ok(None);
    };

    if lead != TPKT_VERSION {
        warn!(lead_byte = lead, "Unknown client, hanging up");
        return Ok(None);
    }

    read_tpkt(stream, lead, frame).await
}

/// Read the next frame of an established client stream.
///
/// Returns `Ok(None)` at end of stream, on an invalid length, or on an
/// unrecognised leading byte. End of stream inside a frame is an
/// `UnexpectedEof` error.
pub async fn read_next_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    frame: &mut FrameBuf,
) -> io::Result<Option<FrameKind>> {
    let Some(lead) = read_lead_byte(stream).await? else {
        return Ok(None);
    };

    match FrameKind::classify(lead) {
        Some(FrameKind::Tpkt) => read_tpkt(stream, lead, frame).await,
        Some(FrameKind::TlsRecord) => read_tls_record(stream, lead, frame).await,
        Some(FrameKind::FastPath) => read_fast_path(stream, lead, frame).await,
        None => {
            let drained = drain_available(stream, lead);
            error!(
                lead_byte = lead,
                available = drained.len() - 1,
                bytes = %hex::encode_upper(&drained),
                "Unknown message, hanging up"
            );
            Ok(None)
        }
    }
}

/// Extract the routing cookie from a first frame.
///
/// Collects bytes from [`COOKIE_OFFSET`] up to the first
/// [`COOKIE_TERMINATOR`] or the end of the frame.
pub fn routing_cookie(frame: &[u8]) -> String {
    frame
        .iter()
        .skip(COOKIE_OFFSET)
        .take_while(|&&b| b != COOKIE_TERMINATOR)
        .map(|&b| b as char)
        .collect()
}

async fn read_lead_byte<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match stream.read(&mut byte).await? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

async fn read_tpkt<R: AsyncRead + Unpin>(
    stream: &mut R,
    lead: u8,
    frame: &mut FrameBuf,
) -> io::Result<Option<FrameKind>> {
    // reserved, length hi, length lo
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;

    let total = u16::from_be_bytes([header[1], header[2]]) as usize;
    if total < TPKT_HEADER_LEN {
        warn!(length = total, "TPKT length shorter than its header");
        return Ok(None);
    }

    frame.grow_and_set_len(total);
    let bytes = frame.bytes_mut();
    stream.read_exact(&mut bytes[TPKT_HEADER_LEN..]).await?;
    bytes[0] = lead;
    bytes[1..TPKT_HEADER_LEN].copy_from_slice(&header);
    Ok(Some(FrameKind::Tpkt))
}

async fn read_tls_record<R: AsyncRead + Unpin>(
    stream: &mut R,
    lead: u8,
    frame: &mut FrameBuf,
) -> io::Result<Option<FrameKind>> {
    // two reserved bytes, payload length hi, payload length lo
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    let payload = u16::from_be_bytes([header[2], header[3]]) as usize;
    frame.grow_and_set_len(TLS_HEADER_LEN + payload);
    let bytes = frame.bytes_mut();
    stream.read_exact(&mut bytes[TLS_HEADER_LEN..]).await?;
    bytes[0] = lead;
    bytes[1..TLS_HEADER_LEN].copy_from_slice(&header);
    Ok(Some(FrameKind::TlsRecord))
}

async fn read_fast_path<R: AsyncRead + Unpin>(
    stream: &mut R,
    lead: u8,
    frame: &mut FrameBuf,
) -> io::Result<Option<FrameKind>> {
    let total = stream.read_u8().await?;
    if (total as usize) < FAST_PATH_HEADER_LEN {
        warn!(length = total, "Fast-path length shorter than its header");
        return Ok(None);
    }

    frame.grow_and_set_len(total as usize);
    let bytes = frame.bytes_mut();
    stream.read_exact(&mut bytes[FAST_PATH_HEADER_LEN..]).await?;
    bytes[0] = lead;
    bytes[1] = total;
    Ok(Some(FrameKind::FastPath))
}

/// Collect whatever is readable right now without waiting for more.
fn drain_available<R: AsyncRead + Unpin>(stream: &mut R, lead: u8) -> Vec<u8> {
    let mut drained = vec![lead];
    let mut scratch = [0u8; 4096];
    while drained.len() < MAX_DRAIN_BYTES {
        match stream.read(&mut scratch).now_or_never() {
            Some(Ok(n)) if n > 0 => drained.extend_from_slice(&scratch[..n]),
            _ => break,
        }
    }
    drained
}
