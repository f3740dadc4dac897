//! Bit-granular cursors over byte buffers.
//!
//! Bits are numbered most-significant first inside each byte, the order in
//! which bzip2 lays out its stream. [`BitReader`] walks an existing slice,
//! [`BitWriter`] appends to a growing buffer, and [`BitWriter::take`] moves a
//! run of bits from one to the other, copying whole bytes when both sides are
//! byte aligned.

use crate::error::{Error, Result};

/// Read cursor over a borrowed byte slice, positioned at an absolute bit.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: u64,
}

impl<'a> BitReader<'a> {
    /// Start reading `data` at bit `bit_offset` (0 is the top bit of byte 0).
    pub fn new(data: &'a [u8], bit_offset: u64) -> Self {
        Self { data, pos: bit_offset }
    }

    /// Absolute bit position of the next bit to be read.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        (self.data.len() as u64 * 8).saturating_sub(self.pos)
    }

    pub fn is_aligned(&self) -> bool {
        self.pos % 8 == 0
    }

    /// Skip `n` bits.
    pub fn drop_bits(&mut self, n: u64) -> Result<()> {
        if n > self.remaining() {
            return Err(Error::Eof { offset: self.data.len() as u64 });
        }
        self.pos += n;
        Ok(())
    }

    /// Read the next `n` bits (at most 32) as a big-endian integer.
    pub fn get(&mut self, n: u32) -> Result<u32> {
        debug_assert!(n <= 32);
        if u64::from(n) > self.remaining() {
            return Err(Error::Eof { offset: self.pos / 8 });
        }
        let mut left = n;
        let mut value: u64 = 0;
        while left > 0 {
            let byte = u32::from(self.data[(self.pos / 8) as usize]);
            let used = (self.pos % 8) as u32;
            let avail = 8 - used;
            let want = left.min(avail);
            let bits = (byte >> (avail - want)) & ((1u32 << want) - 1);
            value = (value << want) | u64::from(bits);
            self.pos += u64::from(want);
            left -= want;
        }
        Ok(value as u32)
    }

    /// Borrow `n` whole bytes starting at the current position, which must be
    /// byte aligned.
    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        debug_assert!(self.is_aligned());
        let start = (self.pos / 8) as usize;
        let end = start + n;
        if end > self.data.len() {
            return Err(Error::Eof { offset: self.data.len() as u64 });
        }
        self.pos += n as u64 * 8;
        Ok(&self.data[start..end])
    }
}

/// Append-only bit sink. The last byte is zero padded until it is filled.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    buf: Vec<u8>,
    bits: u64,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self { buf: Vec::with_capacity(bytes), bits: 0 }
    }

    /// Number of bits written so far.
    pub fn bit_len(&self) -> u64 {
        self.bits
    }

    pub fn is_aligned(&self) -> bool {
        self.bits % 8 == 0
    }

    /// Append the low `n` bits (at most 32) of `value`, most significant first.
    pub fn put(&mut self, n: u32, value: u32) {
        debug_assert!(n <= 32);
        let mut left = n;
        while left > 0 {
            let used = (self.bits % 8) as u32;
            if used == 0 {
                self.buf.push(0);
            }
            let room = 8 - used;
            let want = left.min(room);
            let chunk = ((u64::from(value) >> (left - want)) & ((1u64 << want) - 1)) as u8;
            if let Some(last) = self.buf.last_mut() {
                *last |= chunk << (room - want);
            }
            self.bits += u64::from(want);
            left -= want;
        }
    }

    pub fn put_byte(&mut self, byte: u8) {
        if self.is_aligned() {
            self.buf.push(byte);
            self.bits += 8;
        } else {
            self.put(8, u32::from(byte));
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        if self.is_aligned() {
            self.buf.extend_from_slice(bytes);
            self.bits += bytes.len() as u64 * 8;
        } else {
            for &b in bytes {
                self.put(8, u32::from(b));
            }
        }
    }

    /// Move `n` bits from `reader` to the end of this writer.
    pub fn take(&mut self, reader: &mut BitReader<'_>, n: u64) -> Result<()> {
        if n > reader.remaining() {
            return Err(Error::Eof { offset: reader.position() / 8 });
        }
        let mut left = n;

        // Fill the partial output byte first so the bulk below is aligned.
        let head = ((8 - self.bits % 8) % 8).min(left);
        if head > 0 {
            let v = reader.get(head as u32)?;
            self.put(head as u32, v);
            left -= head;
        }

        let whole = (left / 8) as usize;
        if reader.is_aligned() {
            let bytes = reader.take_bytes(whole)?;
            self.put_bytes(bytes);
        } else {
            for _ in 0..whole {
                let v = reader.get(8)?;
                self.put_byte(v as u8);
            }
        }
        left -= whole as u64 * 8;

        if left > 0 {
            let v = reader.get(left as u32)?;
            self.put(left as u32, v);
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
