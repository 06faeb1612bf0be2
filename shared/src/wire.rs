//! Big-endian framing primitives
//!
//! Every multi-byte integer on the wire is big-endian and every variable-length
//! field is preceded by a 16-bit length. The reader never indexes past the end
//! of its buffer; short input surfaces as [`WireError::Truncated`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated packet: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("field of {0} bytes does not fit a 16-bit length prefix")]
    TooLong(usize),
    #[error("invalid UTF-16 in wide string")]
    InvalidUtf16,
    #[error("unknown access denied reason {0}")]
    UnknownReason(u8),
}

/// Cursor over a received payload
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Starts reading at `pos`, typically 2 to skip the opcode
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self {
            buf,
            pos: pos.min(buf.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }

        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// Reads a u16 length followed by that many bytes
    pub fn string16(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    /// Reads a u16 character count followed by UTF-16BE code units
    pub fn wide_string(&mut self) -> Result<String, WireError> {
        let count = self.u16()? as usize;
        let raw = self.bytes(count * 2)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        String::from_utf16(&units).map_err(|_| WireError::InvalidUtf16)
    }
}

/// Append-only payload builder
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_opcode(opcode: u16) -> Self {
        let mut w = Self::new();
        w.u16(opcode);
        w
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn string16(&mut self, v: &[u8]) -> Result<&mut Self, WireError> {
        let len = u16::try_from(v.len()).map_err(|_| WireError::TooLong(v.len()))?;
        self.u16(len);
        self.buf.extend_from_slice(v);
        Ok(self)
    }

    pub fn wide_string(&mut self, v: &str) -> Result<&mut Self, WireError> {
        let units: Vec<u16> = v.encode_utf16().collect();
        let len = u16::try_from(units.len()).map_err(|_| WireError::TooLong(units.len()))?;
        self.u16(len);
        for unit in units {
            self.u16(unit);
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
