//! Read-only access to compressed source files.
//!
//! Sources are memory mapped once and shared by every thread that decompresses
//! blocks out of them, so positioned reads are plain slice borrows.
//! [`ByteCursor`] layers sequential, byte-order aware scalar decoding on top of
//! any slice and reports running off the end as [`Error::Eof`].

use std::fs::File;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::error::{Error, Result};

/// A memory-mapped compressed file.
#[derive(Debug)]
pub struct SourceFile {
    path: PathBuf,
    // Zero-length files cannot be mapped on every platform.
    map: Option<Mmap>,
}

impl SourceFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let len = file.metadata().map_err(|e| Error::io(e, path))?.len();
        let map = if len == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only; sources are expected to stay
            // unmodified while they are open, as with any indexed archive.
            Some(unsafe { Mmap::map(&file) }.map_err(|e| Error::io(e, path))?)
        };
        Ok(Self { path: path.to_path_buf(), map })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// The whole file.
    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// `len` bytes starting at `offset`, or [`Error::Eof`] if the file is shorter.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let data = self.bytes();
        let start = usize::try_from(offset).map_err(|_| Error::Eof { offset })?;
        match start.checked_add(len) {
            Some(end) if end <= data.len() => Ok(&data[start..end]),
            _ => Err(Error::Eof { offset: data.len() as u64 }),
        }
    }

    /// Everything from `offset` to the end of the file.
    pub fn tail(&self, offset: u64) -> Result<&[u8]> {
        let data = self.bytes();
        match usize::try_from(offset) {
            Ok(start) if start <= data.len() => Ok(&data[start..]),
            _ => Err(Error::Eof { offset }),
        }
    }
}

/// Sequential reader over a byte slice with big/little-endian scalar reads.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_eof(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::Eof { offset: self.data.len() as u64 });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_u64_be(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.read_bytes(8)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn cursor_reads_both_byte_orders() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x78, 0x56, 0x34, 0x12, 0xff];
        let mut c = ByteCursor::new(&data);
        assert_eq!(c.read_u32_be().unwrap(), 0x1234_5678);
        assert_eq!(c.read_u32_le().unwrap(), 0x1234_5678);
        assert_eq!(c.read_u8().unwrap(), 0xff);
        assert!(c.is_eof());
        assert!(matches!(c.read_u8(), Err(Error::Eof { offset: 9 })));
    }

    #[test]
    fn source_positioned_reads() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let src = SourceFile::open(tmp.path()).unwrap();
        assert_eq!(src.len(), 11);
        assert_eq!(src.read_at(6, 5).unwrap(), b"world");
        assert!(src.read_at(7, 5).is_err());
        assert_eq!(src.tail(11).unwrap(), b"");
    }

    #[test]
    fn empty_source_has_no_bytes() {
        let tmp = NamedTempFile::new().unwrap();
        let src = SourceFile::open(tmp.path()).unwrap();
        assert!(src.is_empty());
        assert!(src.read_at(0, 1).is_err());
    }
}
