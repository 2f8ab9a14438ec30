//! Bounds-checked reads over one captured packet.
//!
//! A [`Buffer`] is an immutable view of the bytes the host captured for a
//! single packet, together with the length the packet had on the wire. The
//! two differ when the capture was truncated; reads are checked against the
//! captured length, while drain-on-corruption clamps the cursor to the
//! reported length.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::DecodeError;

/// Byte order of the multi-byte integers in a message, taken from the
/// endianness byte of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Endianness byte `l`.
    Little,
    /// Endianness byte `B`.
    Big,
}

/// Rounds `n` up to the next multiple of 2.
pub const fn round_to_2(n: usize) -> usize {
    (n + 1) & !1
}

/// Rounds `n` up to the next multiple of 4.
pub const fn round_to_4(n: usize) -> usize {
    (n + 3) & !3
}

/// Rounds `n` up to the next multiple of 8.
pub const fn round_to_8(n: usize) -> usize {
    (n + 7) & !7
}

/// Rounds `n` up to the next multiple of `align`, which must be a power of
/// two.
pub const fn round_to(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// One captured packet.
#[derive(Debug, Clone, Copy)]
pub struct Buffer<'a> {
    data: &'a [u8],
    reported_len: usize,
}

impl<'a> Buffer<'a> {
    /// Creates a view of a fully captured packet.
    pub fn new(data: &'a [u8]) -> Self {
        Buffer {
            data,
            reported_len: data.len(),
        }
    }

    /// Creates a view of a packet that was `reported_len` bytes on the wire
    /// but of which only `data` was captured.
    ///
    /// # Panics
    ///
    /// Panics if `reported_len` is smaller than the captured slice.
    pub fn with_reported_len(data: &'a [u8], reported_len: usize) -> Self {
        assert!(reported_len >= data.len());
        Buffer { data, reported_len }
    }

    /// The number of bytes actually captured.
    pub fn captured_len(&self) -> usize {
        self.data.len()
    }

    /// The length the packet had on the wire.
    pub fn reported_len(&self) -> usize {
        self.reported_len
    }

    /// Captured bytes remaining at `offset`.
    pub fn remaining(&self, offset: usize) -> usize {
        self.data.len().saturating_sub(offset)
    }

    /// A captured sub-slice, or an error if any of it is missing.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(&self.data[offset..end]),
            _ => Err(DecodeError::Truncated {
                offset,
                needed: len,
                captured: self.data.len(),
            }),
        }
    }

    /// Reads one byte.
    pub fn get_u8(&self, offset: usize) -> Result<u8, DecodeError> {
        Ok(self.slice(offset, 1)?[0])
    }

    /// Reads a 16-bit unsigned integer.
    pub fn get_u16(&self, offset: usize, endian: Endian) -> Result<u16, DecodeError> {
        let b = self.slice(offset, 2)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u16(b),
            Endian::Big => BigEndian::read_u16(b),
        })
    }

    /// Reads a 32-bit unsigned integer.
    pub fn get_u32(&self, offset: usize, endian: Endian) -> Result<u32, DecodeError> {
        let b = self.slice(offset, 4)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        })
    }

    /// Reads a 64-bit unsigned integer.
    pub fn get_u64(&self, offset: usize, endian: Endian) -> Result<u64, DecodeError> {
        let b = self.slice(offset, 8)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u64(b),
            Endian::Big => BigEndian::read_u64(b),
        })
    }

    /// Reads a 16-bit signed integer.
    pub fn get_i16(&self, offset: usize, endian: Endian) -> Result<i16, DecodeError> {
        Ok(self.get_u16(offset, endian)? as i16)
    }

    /// Reads a 32-bit signed integer.
    pub fn get_i32(&self, offset: usize, endian: Endian) -> Result<i32, DecodeError> {
        Ok(self.get_u32(offset, endian)? as i32)
    }

    /// Reads a 64-bit signed integer.
    pub fn get_i64(&self, offset: usize, endian: Endian) -> Result<i64, DecodeError> {
        Ok(self.get_u64(offset, endian)? as i64)
    }

    /// Reads an IEEE 754 double.
    pub fn get_f64(&self, offset: usize, endian: Endian) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.get_u64(offset, endian)?))
    }
}
