//! Fixed-layout pack/unpack primitives.
//!
//! All integers are written big-endian. Strings use a 32-bit length prefix
//! that counts a trailing NUL byte, so a length of zero is reserved for an
//! absent string and the empty string packs as length 1.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Address family tags used by [`Packer::pack_addr`].
const ADDR_NONE: u16 = 0;
const ADDR_V4: u16 = 4;
const ADDR_V6: u16 = 6;

/// Errors raised while packing or unpacking.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackError {
    /// Not enough room left in the output buffer.
    #[error("buffer full: need {needed} bytes, {remaining} remaining")]
    BufferFull { needed: usize, remaining: usize },

    /// Input ended before a declared field did.
    #[error("truncated input: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// String payload without its NUL terminator.
    #[error("string is not NUL terminated")]
    Unterminated,

    /// String payload is not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// Unknown address family tag.
    #[error("invalid address family {0}")]
    InvalidAddressFamily(u16),
}

/// Bounded output buffer.
///
/// `remaining` plays the role of the legacy `remaining_len` argument: every
/// successful pack decrements it and a pack that does not fit fails without
/// writing anything.
#[derive(Debug)]
pub struct Packer {
    buf: Vec<u8>,
    limit: usize,
}

impl Packer {
    /// Create a packer that accepts at most `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(4096)),
            limit,
        }
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn reserve(&self, needed: usize) -> Result<(), PackError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(PackError::BufferFull { needed, remaining });
        }
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), PackError> {
        self.reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn pack16(&mut self, value: u16) -> Result<(), PackError> {
        self.put(&value.to_be_bytes())
    }

    pub fn pack32(&mut self, value: u32) -> Result<(), PackError> {
        self.put(&value.to_be_bytes())
    }

    pub fn pack_i32(&mut self, value: i32) -> Result<(), PackError> {
        self.put(&value.to_be_bytes())
    }

    /// Pack an optional string: `None` is length 0, `Some(s)` is
    /// `s.len() + 1` followed by the bytes and a NUL.
    pub fn packstr(&mut self, value: Option<&str>) -> Result<(), PackError> {
        match value {
            None => self.pack32(0),
            Some(s) => {
                let len = s.len() + 1;
                self.reserve(4 + len)?;
                self.pack32(len as u32)?;
                self.put(s.as_bytes())?;
                self.put(&[0])
            }
        }
    }

    /// Pack an opaque byte blob with a 32-bit length prefix.
    pub fn packmem(&mut self, value: &[u8]) -> Result<(), PackError> {
        self.reserve(4 + value.len())?;
        self.pack32(value.len() as u32)?;
        self.put(value)
    }

    /// Pack a string array as a count followed by each string.
    pub fn packstr_array<S: AsRef<str>>(&mut self, values: &[S]) -> Result<(), PackError> {
        self.pack32(values.len() as u32)?;
        for v in values {
            self.packstr(Some(v.as_ref()))?;
        }
        Ok(())
    }

    pub fn pack32_array(&mut self, values: &[u32]) -> Result<(), PackError> {
        self.reserve(4 + 4 * values.len())?;
        self.pack32(values.len() as u32)?;
        for v in values {
            self.pack32(*v)?;
        }
        Ok(())
    }

    /// Pack an optional socket address: family tag, octets, port.
    pub fn pack_addr(&mut self, addr: Option<&SocketAddr>) -> Result<(), PackError> {
        match addr {
            None => self.pack16(ADDR_NONE),
            Some(SocketAddr::V4(a)) => {
                self.reserve(2 + 4 + 2)?;
                self.pack16(ADDR_V4)?;
                self.put(&a.ip().octets())?;
                self.pack16(a.port())
            }
            Some(SocketAddr::V6(a)) => {
                self.reserve(2 + 16 + 2)?;
                self.pack16(ADDR_V6)?;
                self.put(&a.ip().octets())?;
                self.pack16(a.port())
            }
        }
    }
}

/// Cursor over a received buffer.
#[derive(Debug, Clone)]
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], PackError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(PackError::Truncated { needed, remaining });
        }
        let out = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PackError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn unpack16(&mut self) -> Result<u16, PackError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn unpack32(&mut self) -> Result<u32, PackError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn unpack_i32(&mut self) -> Result<i32, PackError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    /// Unpack a string borrowed from the input buffer.
    pub fn unpackstr_ptr(&mut self) -> Result<Option<&'a str>, PackError> {
        let len = self.unpack32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        let raw = self.take(len)?;
        let (last, body) = raw.split_last().ok_or(PackError::Unterminated)?;
        if *last != 0 {
            return Err(PackError::Unterminated);
        }
        std::str::from_utf8(body)
            .map(Some)
            .map_err(|_| PackError::InvalidUtf8)
    }

    /// Unpack a string into an owned allocation.
    pub fn unpackstr(&mut self) -> Result<Option<String>, PackError> {
        Ok(self.unpackstr_ptr()?.map(str::to_owned))
    }

    pub fn unpackmem(&mut self) -> Result<Vec<u8>, PackError> {
        let len = self.unpack32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Unpack a string array. Absent elements decode as empty strings.
    pub fn unpackstr_array(&mut self) -> Result<Vec<String>, PackError> {
        let count = self.unpack32()? as usize;
        // Each element needs at least its 4-byte length prefix.
        self.check_count(count, 4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.unpackstr()?.unwrap_or_default());
        }
        Ok(out)
    }

    pub fn unpack32_array(&mut self) -> Result<Vec<u32>, PackError> {
        let count = self.unpack32()? as usize;
        self.check_count(count, 4)?;
        (0..count).map(|_| self.unpack32()).collect()
    }

    pub fn unpack_addr(&mut self) -> Result<Option<SocketAddr>, PackError> {
        match self.unpack16()? {
            ADDR_NONE => Ok(None),
            ADDR_V4 => {
                let octets: [u8; 4] = self.take_array()?;
                let port = self.unpack16()?;
                Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)))
            }
            ADDR_V6 => {
                let octets: [u8; 16] = self.take_array()?;
                let port = self.unpack16()?;
                Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
            }
            other => Err(PackError::InvalidAddressFamily(other)),
        }
    }

    /// Reject element counts that cannot possibly fit in the remaining input,
    /// before allocating for them.
    fn check_count(&self, count: usize, min_elem: usize) -> Result<(), PackError> {
        let needed = count.saturating_mul(min_elem);
        let remaining = self.remaining();
        if needed > remaining {
            return Err(PackError::Truncated { needed, remaining });
        }
        Ok(())
    }
}
