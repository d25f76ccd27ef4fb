//! The [`Deserializable`] trait, [`Cursor`] buffer, and primitive impls.

use std::fmt;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur during deserialization.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Ran out of bytes before the value was fully read.
    UnexpectedEof,
    /// A string field held bytes that are not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for deserialization.
pub type Result<T> = std::result::Result<T, Error>;

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// A zero-copy cursor over an in-memory byte slice.
///
/// Avoids `std::io::Cursor` and its wide error surface; only the two error
/// cases above can ever occur during decoding.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn pos(&self) -> usize { self.pos }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize { self.buf.len() - self.pos }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        match self.buf.get(self.pos).copied() {
            Some(b) => { self.pos += 1; Ok(b) }
            None    => Err(Error::UnexpectedEof),
        }
    }

    /// Read exactly `out.len()` bytes.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let end = self.pos + out.len();
        if end > self.buf.len() {
            return Err(Error::UnexpectedEof);
        }
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(())
    }
}

/// Alias used by record impls: `wire::deserialize::Buffer<'_, '_>`.
pub type Buffer<'a, 'b> = &'a mut Cursor<'b>;

// ─── Deserializable ──────────────────────────────────────────────────────────

/// Deserialize a value from the hermod binary format.
pub trait Deserializable: Sized {
    /// Read `Self` from `buf`, advancing its position.
    fn deserialize(buf: Buffer) -> Result<Self>;

    /// Convenience: deserialize from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::from_slice(bytes);
        Self::deserialize(&mut cursor)
    }
}

// ─── Primitives ──────────────────────────────────────────────────────────────

impl Deserializable for u8 {
    fn deserialize(buf: Buffer) -> Result<Self> {
        buf.read_byte()
    }
}

impl Deserializable for u16 {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let mut b = [0u8; 2];
        buf.read_exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }
}

impl Deserializable for u32 {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let mut b = [0u8; 4];
        buf.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }
}

impl Deserializable for u64 {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let mut b = [0u8; 8];
        buf.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }
}

// ─── Bytes / String ──────────────────────────────────────────────────────────

impl Deserializable for Vec<u8> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let first = buf.read_byte()?;
        let (len, header_extra) = if first != 0xfe {
            (first as usize, 0)
        } else {
            let a = buf.read_byte()? as usize;
            let b = buf.read_byte()? as usize;
            let c = buf.read_byte()? as usize;
            (a | (b << 8) | (c << 16), 3)
        };

        let mut data = vec![0u8; len];
        buf.read_exact(&mut data)?;

        // Skip alignment padding
        let total = 1 + header_extra + len;
        let padding = (4 - (total % 4)) % 4;
        for _ in 0..padding { buf.read_byte()?; }

        Ok(data)
    }
}

impl Deserializable for String {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let bytes = Vec::<u8>::deserialize(buf)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }
}
