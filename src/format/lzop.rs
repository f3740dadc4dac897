//! lzop block discovery.
//!
//! lzop already writes its data as a sequence of independently compressed
//! blocks with explicit sizes, so indexing is a walk over block headers.
//! Several lzop members may be concatenated; each one brings its own header
//! and flag word, which decides the checksum layout of its blocks.

use std::path::Path;

use rust_lzo::{LZOContext, LZOError};
use tracing::debug;

use super::{strip_extension, Format, FormatIndexer};
use crate::block::{Block, BlockExtra, BlockIndex};
use crate::error::{Error, Result};
use crate::io::{ByteCursor, SourceFile};

pub const MAGIC: [u8; 9] = [0x89, b'L', b'Z', b'O', 0x00, b'\r', b'\n', 0x1a, b'\n'];

/// Newest "version needed to extract" we understand.
const DECODE_VERSION: u16 = 0x1040;
/// Headers from this version on carry the extra version, level and mtime fields.
const FULL_HEADER_VERSION: u16 = 0x0940;

pub const F_ADLER32_D: u32 = 1 << 0;
pub const F_ADLER32_C: u32 = 1 << 1;
pub const F_H_EXTRA_FIELD: u32 = 1 << 6;
pub const F_CRC32_D: u32 = 1 << 8;
pub const F_CRC32_C: u32 = 1 << 9;
pub const F_H_FILTER: u32 = 1 << 11;
pub const F_H_CRC32: u32 = 1 << 12;

fn adler32(data: &[u8]) -> u32 {
    adler::adler32_slice(data)
}

/// Bytes of checksums stored between a block's sizes and its data.
fn checksum_len(flags: u32, compressed: bool) -> u64 {
    let mut n = 0;
    for (flag, applies) in [
        (F_ADLER32_D, true),
        (F_CRC32_D, true),
        (F_ADLER32_C, compressed),
        (F_CRC32_C, compressed),
    ] {
        if applies && flags & flag != 0 {
            n += 4;
        }
    }
    n
}

/// Parse the member header at `pos`; returns its flags and the offset of the
/// first block.
fn parse_header(data: &[u8], pos: usize) -> Result<(u32, usize)> {
    let truncated = |e: Error| match e {
        Error::Eof { .. } => Error::format("lzop", "truncated header"),
        other => other,
    };
    let mut c = ByteCursor::at(data, pos);
    if c.read_bytes(MAGIC.len()).map_err(truncated)? != MAGIC {
        return Err(Error::format("lzop", "magic mismatch"));
    }

    let header_start = c.position() as usize;
    let flags = (|| {
        let version = c.read_u16_be()?;
        let _lib_version = c.read_u16_be()?;
        if version >= FULL_HEADER_VERSION {
            let needed = c.read_u16_be()?;
            if needed > DECODE_VERSION {
                return Err(Error::format("lzop", format!("version {needed:#x} too new")));
            }
        }
        let method = c.read_u8()?;
        if !(1..=3).contains(&method) {
            return Err(Error::format("lzop", format!("unsupported method {method}")));
        }
        if version >= FULL_HEADER_VERSION {
            let _level = c.read_u8()?;
        }
        let flags = c.read_u32_be()?;
        if flags & F_H_FILTER != 0 {
            return Err(Error::format("lzop", "filter not supported"));
        }
        c.skip(8)?; // mode, mtime
        if version >= FULL_HEADER_VERSION {
            c.skip(4)?; // mtime high
        }
        let name_len = c.read_u8()?;
        c.skip(usize::from(name_len))?;
        Ok(flags)
    })()
    .map_err(truncated)?;

    let header_end = c.position() as usize;
    let stored = c.read_u32_be().map_err(truncated)?;
    let header = &data[header_start..header_end];
    let actual = if flags & F_H_CRC32 != 0 { crc32fast::hash(header) } else { adler32(header) };
    if stored != actual {
        return Err(Error::format("lzop", "header checksum mismatch"));
    }

    if flags & F_H_EXTRA_FIELD != 0 {
        let len = c.read_u32_be().map_err(truncated)?;
        c.skip(len as usize + 4).map_err(truncated)?;
    }
    Ok((flags, c.position() as usize))
}

/// Walk the blocks of one member. Returns the offset after its terminator and
/// the uncompressed offset reached.
fn index_member(data: &[u8], pos: usize, flags: u32, mut uoff: u64, blocks: &mut Vec<Block>) -> Result<(usize, u64)> {
    let mut c = ByteCursor::at(data, pos);
    let truncated = |e: Error| match e {
        Error::Eof { offset } => Error::decode(offset, "truncated lzop block"),
        other => other,
    };
    loop {
        let usize = c.read_u32_be().map_err(truncated)?;
        if usize == 0 {
            return Ok((c.position() as usize, uoff));
        }
        let csize = c.read_u32_be().map_err(truncated)?;
        if csize > usize {
            return Err(Error::decode(c.position(), "compressed block larger than its data"));
        }
        c.skip(checksum_len(flags, csize != usize) as usize).map_err(truncated)?;
        let coff = c.position();
        c.skip(csize as usize).map_err(truncated)?;
        blocks.push(Block { uoff, usize, coff, csize, extra: BlockExtra::Lzop { flags } });
        uoff += u64::from(usize);
    }
}

fn verify(sums: &mut ByteCursor<'_>, flags: u32, adler_flag: u32, crc_flag: u32, data: &[u8], coff: u64) -> Result<()> {
    if flags & adler_flag != 0 && sums.read_u32_be()? != adler32(data) {
        return Err(Error::decode(coff, "Adler-32 mismatch"));
    }
    if flags & crc_flag != 0 && sums.read_u32_be()? != crc32fast::hash(data) {
        return Err(Error::decode(coff, "CRC-32 mismatch"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct LzopIndexer;

impl FormatIndexer for LzopIndexer {
    fn format(&self) -> Format {
        Format::Lzop
    }

    fn check_magic(&self, src: &SourceFile) -> Result<()> {
        parse_header(src.bytes(), 0).map(|_| ())
    }

    fn build_index(&self, src: &SourceFile) -> Result<BlockIndex> {
        let data = src.bytes();
        let mut blocks = Vec::new();
        let (mut flags, mut pos) = parse_header(data, 0)?;
        let mut uoff = 0;
        loop {
            (pos, uoff) = index_member(data, pos, flags, uoff, &mut blocks)?;
            if pos >= data.len() {
                break;
            }
            if !data[pos..].starts_with(&MAGIC) {
                debug!(offset = pos, "ignoring trailing bytes after last lzop member");
                break;
            }
            (flags, pos) = parse_header(data, pos)?;
        }
        BlockIndex::new(Format::Lzop, blocks)
    }

    fn decompress_block(&self, src: &SourceFile, block: &Block) -> Result<Vec<u8>> {
        let BlockExtra::Lzop { flags } = block.extra else {
            return Err(Error::decode(block.coff, "not an lzop block"));
        };
        let coff = block.coff;
        let compressed = block.csize != block.usize;
        let cdata = src.read_at(coff, block.csize as usize)?;

        let out = if compressed {
            let mut out = vec![0u8; block.usize as usize];
            let (written, err) = LZOContext::decompress_to_slice(cdata, &mut out);
            if !matches!(err, LZOError::OK) {
                return Err(Error::decode(coff, format!("lzo error {}", err as i32)));
            }
            if written.len() != block.usize as usize {
                return Err(Error::decode(
                    coff,
                    format!("block decoded to {} bytes, expected {}", written.len(), block.usize),
                ));
            }
            out
        } else {
            cdata.to_vec()
        };

        let sums_len = checksum_len(flags, compressed);
        let sums_at = coff
            .checked_sub(sums_len)
            .ok_or_else(|| Error::decode(coff, "checksums precede start of file"))?;
        let mut sums = ByteCursor::new(src.read_at(sums_at, sums_len as usize)?);
        verify(&mut sums, flags, F_ADLER32_D, F_CRC32_D, &out, coff)?;
        if compressed {
            verify(&mut sums, flags, F_ADLER32_C, F_CRC32_C, cdata, coff)?;
        }
        Ok(out)
    }

    fn destination_name(&self, path: &Path) -> String {
        strip_extension(path, &["tzo"], &["lzo"])
    }
}
