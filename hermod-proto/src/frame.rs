//! Frame codec: length-prefixed byte blocks with a per-frame flag byte.
//!
//! On the wire each frame is a 3-byte big-endian payload length (hard limit
//! 2^24 − 1), one flag byte, then the payload. The codec is stateless apart
//! from the underlying byte stream; a framing error means the stream is no
//! longer trustworthy and callers must drop the connection.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Payload is deflate-compressed.
pub const FLAG_COMPRESS: u8 = 1 << 0;
/// Payload is encrypted and carries an authentication tag.
pub const FLAG_ENCRYPT: u8 = 1 << 1;
/// Receiver must answer with an ACK command.
pub const FLAG_NEEDACK: u8 = 1 << 2;

const FLAG_MASK: u8 = FLAG_COMPRESS | FLAG_ENCRYPT | FLAG_NEEDACK;

/// Hard wire limit imposed by the 3-byte length field.
pub const MAX_FRAME_LEN: usize = (1 << 24) - 1;

/// Default configured ceiling, well under the wire limit.
pub const DEFAULT_FRAME_CEILING: usize = 1 << 20;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Framing failures. All of them are fatal for the connection.
#[derive(Debug)]
pub enum FrameError {
    /// Payload length exceeds the configured ceiling.
    TooLarge(usize),
    /// The flag byte carries bits outside the defined set.
    BadFlags(u8),
    /// Underlying stream failure (including truncation).
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge(len) => write!(f, "frame payload of {len} bytes exceeds the ceiling"),
            Self::BadFlags(b)   => write!(f, "undefined frame flag bits: {b:#04x}"),
            Self::Io(e)         => write!(f, "frame I/O: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

// ─── Codec ───────────────────────────────────────────────────────────────────

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer:  &mut W,
    flags:   u8,
    payload: &[u8],
    ceiling: usize,
) -> Result<(), FrameError> {
    if payload.len() > ceiling.min(MAX_FRAME_LEN) {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let len = payload.len();
    let mut packet = Vec::with_capacity(4 + len);
    packet.push((len >> 16) as u8);
    packet.push((len >> 8) as u8);
    packet.push(len as u8);
    packet.push(flags);
    packet.extend_from_slice(payload);

    writer.write_all(&packet).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, returning `(flags, payload)`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader:  &mut R,
    ceiling: usize,
) -> Result<(u8, Vec<u8>), FrameError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let len = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
    let flags = header[3];

    if flags & !FLAG_MASK != 0 {
        return Err(FrameError::BadFlags(flags));
    }
    if len > ceiling.min(MAX_FRAME_LEN) {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((flags, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload = b"the payload".to_vec();
        write_frame(&mut a, FLAG_COMPRESS | FLAG_NEEDACK, &payload, DEFAULT_FRAME_CEILING)
            .await
            .unwrap();
        let (flags, got) = read_frame(&mut b, DEFAULT_FRAME_CEILING).await.unwrap();
        assert_eq!(flags, FLAG_COMPRESS | FLAG_NEEDACK);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn empty_payload_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, 0, &[], DEFAULT_FRAME_CEILING).await.unwrap();
        let (flags, got) = read_frame(&mut b, DEFAULT_FRAME_CEILING).await.unwrap();
        assert_eq!(flags, 0);
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn oversize_write_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let payload = vec![0u8; 128];
        let err = write_frame(&mut a, 0, &payload, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(128)));
    }

    #[tokio::test]
    async fn oversize_length_field_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Hand-rolled header declaring a payload above the ceiling.
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0x00, 0x10, 0x00, 0x00])
            .await
            .unwrap();
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn undefined_flag_bits_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0x00, 0x00, 0x01, 0x80, 0xff])
            .await
            .unwrap();
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::BadFlags(0x80)));
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0x00, 0x00, 0x08, 0x00, 0x01])
            .await
            .unwrap();
        drop(a);
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }
}
