//! zstd block discovery.
//!
//! A zstd frame can only be decoded from its start, so blocks are whole
//! frames. Files written in the seekable format end with a seek table that
//! lists every frame's compressed and decompressed size (and optionally a
//! checksum); when it is present it is used as is. Otherwise frames are walked
//! from the start of the file with the library's frame-size queries, skipping
//! skippable frames.

use std::ffi::CStr;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;
use xxhash_rust::xxh64::xxh64;
use zstd_sys as zsys;

use super::{strip_extension, Format, FormatIndexer};
use crate::block::{Block, BlockExtra, BlockIndex};
use crate::error::{Error, Result};
use crate::io::{ByteCursor, SourceFile};

const FRAME_MAGIC: u32 = 0xfd2f_b528;
const SKIPPABLE_MAGIC: u32 = 0x184d_2a50;
const SKIPPABLE_MASK: u32 = 0xffff_fff0;
const SEEK_TABLE_MAGIC: u32 = 0x184d_2a5e;
const SEEKABLE_FOOTER_MAGIC: u32 = 0x8f92_eab1;
const SEEK_FOOTER_LEN: usize = 9;
const SKIPPABLE_HEADER_LEN: usize = 8;
const CHECKSUM_FLAG: u8 = 0x80;
const RESERVED_FLAGS: u8 = 0x7c;

// `ZSTD_getFrameContentSize` sentinels.
const CONTENT_SIZE_UNKNOWN: u64 = u64::MAX;
const CONTENT_SIZE_ERROR: u64 = u64::MAX - 1;

/// Check a size returned from zstd for the error flag.
fn check(code: usize) -> std::result::Result<usize, String> {
    if unsafe { zsys::ZSTD_isError(code) } != 0 {
        let name = unsafe { CStr::from_ptr(zsys::ZSTD_getErrorName(code)) };
        Err(name.to_string_lossy().into_owned())
    } else {
        Ok(code)
    }
}

/// One frame of the file.
#[derive(Debug, Clone, Copy)]
struct Frame {
    coff: u64,
    csize: u64,
    usize: u64,
    checksum: Option<u32>,
}

fn format_err(reason: impl Into<String>) -> Error {
    Error::format("zstd", reason)
}

/// Frames listed by a trailing seek table, if the file has one.
fn read_seek_table(data: &[u8]) -> Result<Option<Vec<Frame>>> {
    if data.len() < SKIPPABLE_HEADER_LEN + SEEK_FOOTER_LEN {
        return Ok(None);
    }
    let footer = &data[data.len() - SEEK_FOOTER_LEN..];
    if LittleEndian::read_u32(&footer[5..]) != SEEKABLE_FOOTER_MAGIC {
        return Ok(None);
    }
    let count = LittleEndian::read_u32(footer) as usize;
    let flags = footer[4];
    if flags & RESERVED_FLAGS != 0 {
        return Err(format_err("reserved seek table flags set"));
    }
    let has_checksum = flags & CHECKSUM_FLAG != 0;
    let entry_len = if has_checksum { 12 } else { 8 };

    let frame_len = count
        .checked_mul(entry_len)
        .and_then(|n| n.checked_add(SEEK_FOOTER_LEN))
        .ok_or_else(|| format_err("seek table too large"))?;
    let start = data
        .len()
        .checked_sub(frame_len + SKIPPABLE_HEADER_LEN)
        .ok_or_else(|| format_err("seek table larger than file"))?;

    let mut c = ByteCursor::at(data, start);
    if c.read_u32_le()? != SEEK_TABLE_MAGIC || c.read_u32_le()? as usize != frame_len {
        return Err(format_err("seek table frame header mismatch"));
    }

    let mut frames = Vec::with_capacity(count);
    let mut coff = 0u64;
    for _ in 0..count {
        let csize = u64::from(c.read_u32_le()?);
        let usize = u64::from(c.read_u32_le()?);
        let checksum = if has_checksum { Some(c.read_u32_le()?) } else { None };
        frames.push(Frame { coff, csize, usize, checksum });
        coff += csize;
    }
    if coff != start as u64 {
        return Err(format_err("seek table does not cover the frames"));
    }
    Ok(Some(frames))
}

/// Frames found by walking the file from the start.
fn walk_frames(data: &[u8]) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let mut c = ByteCursor::at(data, pos);
        let magic = c.read_u32_le().map_err(|_| format_err("trailing bytes after last frame"))?;
        if magic & SKIPPABLE_MASK == SKIPPABLE_MAGIC {
            let len = c.read_u32_le()? as usize;
            pos = match (pos + SKIPPABLE_HEADER_LEN).checked_add(len) {
                Some(next) if next <= data.len() => next,
                _ => return Err(Error::decode(pos as u64, "skippable frame runs past end of file")),
            };
            continue;
        }
        if magic != FRAME_MAGIC {
            return Err(Error::decode(pos as u64, "expected a zstd frame"));
        }

        let rest = &data[pos..];
        let csize = check(unsafe { zsys::ZSTD_findFrameCompressedSize(rest.as_ptr().cast(), rest.len()) })
            .map_err(|e| Error::decode(pos as u64, e))?;
        let frame = &rest[..csize];
        let content = unsafe { zsys::ZSTD_getFrameContentSize(frame.as_ptr().cast(), frame.len()) } as u64;
        let usize = match content {
            CONTENT_SIZE_ERROR => return Err(Error::decode(pos as u64, "invalid frame header")),
            CONTENT_SIZE_UNKNOWN => {
                debug!(coff = pos, "frame without content size, decoding to measure");
                ::zstd::stream::decode_all(frame).map_err(|e| Error::decode(pos as u64, e.to_string()))?.len() as u64
            }
            n => n,
        };
        frames.push(Frame { coff: pos as u64, csize: csize as u64, usize, checksum: None });
        pos += csize;
    }
    Ok(frames)
}

#[derive(Debug, Clone, Default)]
pub struct ZstdIndexer;

impl FormatIndexer for ZstdIndexer {
    fn format(&self) -> Format {
        Format::Zstd
    }

    fn check_magic(&self, src: &SourceFile) -> Result<()> {
        let head = src.read_at(0, 4).map_err(|_| format_err("file too short"))?;
        let magic = LittleEndian::read_u32(head);
        if magic == FRAME_MAGIC || magic & SKIPPABLE_MASK == SKIPPABLE_MAGIC {
            Ok(())
        } else {
            Err(format_err("magic mismatch"))
        }
    }

    fn build_index(&self, src: &SourceFile) -> Result<BlockIndex> {
        let data = src.bytes();
        let frames = match read_seek_table(data)? {
            Some(frames) => frames,
            None => walk_frames(data)?,
        };

        let mut blocks = Vec::with_capacity(frames.len());
        let mut uoff = 0u64;
        for f in frames {
            if f.usize == 0 {
                continue;
            }
            let too_large = || Error::decode(f.coff, "frame too large to index");
            blocks.push(Block {
                uoff,
                usize: u32::try_from(f.usize).map_err(|_| too_large())?,
                coff: f.coff,
                csize: u32::try_from(f.csize).map_err(|_| too_large())?,
                extra: BlockExtra::Zstd { checksum: f.checksum },
            });
            uoff += f.usize;
        }
        BlockIndex::new(Format::Zstd, blocks)
    }

    fn decompress_block(&self, src: &SourceFile, block: &Block) -> Result<Vec<u8>> {
        let BlockExtra::Zstd { checksum } = block.extra else {
            return Err(Error::decode(block.coff, "not a zstd block"));
        };
        let frame = src.read_at(block.coff, block.csize as usize)?;
        let out = ::zstd::bulk::decompress(frame, block.usize as usize)
            .map_err(|e| Error::decode(block.coff, e.to_string()))?;
        if out.len() != block.usize as usize {
            return Err(Error::decode(
                block.coff,
                format!("frame decoded to {} bytes, expected {}", out.len(), block.usize),
            ));
        }
        if let Some(expected) = checksum {
            if xxh64(&out, 0) as u32 != expected {
                return Err(Error::decode(block.coff, "frame checksum mismatch"));
            }
        }
        Ok(out)
    }

    fn destination_name(&self, path: &Path) -> String {
        strip_extension(path, &["tzst"], &["zst"])
    }
}
