//! Outbound packet buffer
//!
//! Each session owns one `OutBuffer`. Writers reserve a region, fill it and
//! commit it; an uncommitted reservation is discarded when its guard drops, so
//! a half-built packet never reaches the wire.
//!
//! Also provides the little-endian field accessors the codec uses.

use std::ops::{Deref, DerefMut};

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;

/// Maximum packet size (64KB)
pub const MAX_PACKET_SIZE: usize = 65535;

/// Bounded outbound buffer
#[derive(Debug)]
pub struct OutBuffer {
    data: BytesMut,
    capacity: usize,
}

impl OutBuffer {
    /// Create a buffer that holds at most one maximum-size packet
    pub fn new() -> Self {
        Self::with_capacity(MAX_PACKET_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes committed and waiting to be flushed
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Reserve `len` zeroed bytes at the end of the buffer
    pub fn reserve(&mut self, len: usize) -> Result<WriteGuard<'_>, ProtocolError> {
        if len > self.remaining() {
            return Err(ProtocolError::BufferOverflow {
                requested: len,
                remaining: self.remaining(),
            });
        }
        let start = self.data.len();
        self.data.resize(start + len, 0);
        Ok(WriteGuard {
            buffer: self,
            start,
            len,
            committed: false,
        })
    }

    /// Copy a complete packet into the buffer
    pub fn push(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut guard = self.reserve(payload.len())?;
        guard.copy_from_slice(payload);
        guard.commit();
        Ok(())
    }

    /// Take everything committed so far, leaving the buffer empty
    pub fn take(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Default for OutBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved, writable region of an `OutBuffer`
pub struct WriteGuard<'a> {
    buffer: &'a mut OutBuffer,
    start: usize,
    len: usize,
    committed: bool,
}

impl WriteGuard<'_> {
    /// Keep the whole reservation
    pub fn commit(mut self) {
        self.committed = true;
    }

    /// Keep only the first `len` bytes of the reservation
    pub fn commit_len(mut self, len: usize) {
        let keep = len.min(self.len);
        self.buffer.data.truncate(self.start + keep);
        self.committed = true;
    }
}

impl Deref for WriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer.data[self.start..self.start + self.len]
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.data[self.start..self.start + self.len]
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.buffer.data.truncate(self.start);
        }
    }
}

// ============ Little-endian field access ============

#[inline]
pub fn get_u8(buf: &[u8], offset: usize) -> u8 {
    buf[offset]
}

#[inline]
pub fn get_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
pub fn get_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[inline]
pub fn put_u16_le(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Read a NUL-padded string field
pub fn get_cstr(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
