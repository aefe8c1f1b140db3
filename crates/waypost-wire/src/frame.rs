//! Frame codec.
//!
//! A frame is one marker byte ([`FRAME_MARKER`]), a 4-byte little-endian
//! length of the body, then the body. The whole frame, header included, may
//! not exceed the configured maximum. Decoding is stateless between frames:
//! a violation is reported as a [`FrameError`] and the caller decides what to
//! do with the connection.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First byte of every frame.
pub const FRAME_MARKER: u8 = 0x0D;

/// Marker byte plus the 4-byte length.
pub const HEADER_LEN: usize = 5;

/// Maximum total frame size in the reference deployment (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

/// Errors produced while framing or unframing.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Bad frame marker 0x{0:02x}")]
    BadMarker(u8),
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: usize },
}

impl FrameError {
    /// Whether the peer broke the framing rules (as opposed to the stream failing).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, FrameError::BadMarker(_) | FrameError::TooLarge { .. })
    }
}

/// Validate a header and return the body length it declares.
pub fn decode_header(header: &[u8; HEADER_LEN], max_frame_size: usize) -> Result<usize, FrameError> {
    if header[0] != FRAME_MARKER {
        return Err(FrameError::BadMarker(header[0]));
    }
    let body_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let total = HEADER_LEN as u64 + u64::from(body_len);
    if total > max_frame_size as u64 {
        return Err(FrameError::TooLarge {
            size: total,
            max: max_frame_size,
        });
    }
    Ok(body_len as usize)
}

/// Frame `body`, refusing bodies that would exceed `max_frame_size`.
pub fn encode_frame(body: &[u8], max_frame_size: usize) -> Result<Vec<u8>, FrameError> {
    let total = HEADER_LEN as u64 + body.len() as u64;
    if total > max_frame_size as u64 {
        return Err(FrameError::TooLarge {
            size: total,
            max: max_frame_size,
        });
    }
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.push(FRAME_MARKER);
    bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
    bytes.extend_from_slice(body);
    Ok(bytes)
}

/// Incremental decoder for byte streams that arrive in arbitrary chunks.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create an empty buffer enforcing `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame body, if one is buffered.
    ///
    /// The header is validated as soon as it is complete, so an oversize frame
    /// is reported before its body arrives.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let body_len = decode_header(&header, self.max_frame_size)?;
        if self.buf.len() < HEADER_LEN + body_len {
            return Ok(None);
        }
        let body = self.buf[HEADER_LEN..HEADER_LEN + body_len].to_vec();
        self.buf.drain(..HEADER_LEN + body_len);
        Ok(Some(body))
    }
}

/// Read one frame body from `reader`.
///
/// A clean end of stream before a header starts is reported as
/// [`FrameError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let body_len = decode_header(&header, max_frame_size)?;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Frame `body` and write it to `writer`.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_frame_size: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(body, max_frame_size)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
