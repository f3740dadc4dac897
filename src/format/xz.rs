//! xz block discovery.
//!
//! xz streams end with an index listing every block's sizes, so no scanning
//! is needed: the indexer walks backwards from the end of the file through
//! footer, index and header of each concatenated stream. Blocks are only
//! independent when the encoder wrote more than one (for example `pixz` or
//! `xz -T`); a plain single-threaded file yields a single block per stream.
//!
//! To decompress one block it is wrapped into a minimal stream of its own
//! (header, the block, a one-record index, footer) and handed to liblzma.

use std::io::Read;
use std::path::Path;

use xz2::read::XzDecoder;

use super::{strip_extension, Format, FormatIndexer};
use crate::block::{Block, BlockExtra, BlockIndex};
use crate::error::{Error, Result};
use crate::io::{ByteCursor, SourceFile};

const HEADER_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const FOOTER_MAGIC: [u8; 2] = *b"YZ";
const HEADER_LEN: usize = 12;
const FOOTER_LEN: usize = 12;

fn round4(n: u64) -> u64 {
    (n + 3) & !3
}

fn format_err(reason: impl Into<String>) -> Error {
    Error::format("xz", reason)
}

fn read_varint(c: &mut ByteCursor<'_>) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..9 {
        let byte = c.read_u8()?;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(format_err("varint too long"))
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// One block as listed in a stream index.
#[derive(Debug, Clone, Copy)]
struct Record {
    coff: u64,
    unpadded: u64,
    uncompressed: u64,
    check: u8,
}

/// Parse the stream ending at `end`. Returns its records and the offset of the
/// stream header.
fn parse_stream(data: &[u8], end: usize) -> Result<(Vec<Record>, usize)> {
    if end < HEADER_LEN + FOOTER_LEN {
        return Err(format_err("stream too short"));
    }
    let footer = &data[end - FOOTER_LEN..end];
    if footer[10..] != FOOTER_MAGIC {
        return Err(format_err("footer magic mismatch"));
    }
    let mut fc = ByteCursor::new(footer);
    let footer_crc = fc.read_u32_le()?;
    if footer_crc != crc32fast::hash(&footer[4..10]) {
        return Err(format_err("footer CRC mismatch"));
    }
    let backward_size = (u64::from(fc.read_u32_le()?) + 1) * 4;
    let flags = [footer[8], footer[9]];
    if flags[0] != 0 || flags[1] & 0xf0 != 0 {
        return Err(format_err("unsupported stream flags"));
    }
    let check = flags[1];

    let index_end = end - FOOTER_LEN;
    let index_start = usize::try_from(backward_size)
        .ok()
        .and_then(|n| index_end.checked_sub(n))
        .ok_or_else(|| format_err("index larger than file"))?;
    let index = &data[index_start..index_end];
    if index.len() < 8 || index[0] != 0 {
        return Err(format_err("missing index indicator"));
    }
    let (body, crc) = index.split_at(index.len() - 4);
    if ByteCursor::new(crc).read_u32_le()? != crc32fast::hash(body) {
        return Err(format_err("index CRC mismatch"));
    }

    let mut ic = ByteCursor::at(body, 1);
    let count = read_varint(&mut ic)?;
    let mut sizes = Vec::new();
    let mut blocks_len = 0u64;
    for _ in 0..count {
        let unpadded = read_varint(&mut ic)?;
        let uncompressed = read_varint(&mut ic)?;
        if unpadded == 0 {
            return Err(format_err("zero-sized block in index"));
        }
        blocks_len += round4(unpadded);
        sizes.push((unpadded, uncompressed));
    }
    if body[ic.position() as usize..].iter().any(|&b| b != 0) || (ic.position() as usize) + 3 < body.len() {
        return Err(format_err("index padding invalid"));
    }

    let start = usize::try_from(blocks_len)
        .ok()
        .and_then(|n| index_start.checked_sub(n))
        .and_then(|n| n.checked_sub(HEADER_LEN))
        .ok_or_else(|| format_err("blocks larger than file"))?;
    let header = &data[start..start + HEADER_LEN];
    if header[..6] != HEADER_MAGIC {
        return Err(format_err("header magic mismatch"));
    }
    if header[6..8] != flags {
        return Err(format_err("header and footer flags differ"));
    }
    if ByteCursor::new(&header[8..]).read_u32_le()? != crc32fast::hash(&header[6..8]) {
        return Err(format_err("header CRC mismatch"));
    }

    let mut coff = (start + HEADER_LEN) as u64;
    let records = sizes
        .into_iter()
        .map(|(unpadded, uncompressed)| {
            let rec = Record { coff, unpadded, uncompressed, check };
            coff += round4(unpadded);
            rec
        })
        .collect();
    Ok((records, start))
}

/// A stream holding only `block`, framed as liblzma expects.
fn single_block_stream(block: &[u8], check: u8, unpadded: u64, uncompressed: u64) -> Vec<u8> {
    let flags = [0u8, check];
    let mut s = Vec::with_capacity(block.len() + 64);
    s.extend_from_slice(&HEADER_MAGIC);
    s.extend_from_slice(&flags);
    s.extend_from_slice(&crc32fast::hash(&flags).to_le_bytes());
    s.extend_from_slice(block);

    let index_start = s.len();
    s.push(0);
    write_varint(&mut s, 1);
    write_varint(&mut s, unpadded);
    write_varint(&mut s, uncompressed);
    while (s.len() - index_start) % 4 != 0 {
        s.push(0);
    }
    let crc = crc32fast::hash(&s[index_start..]);
    s.extend_from_slice(&crc.to_le_bytes());

    let backward = ((s.len() - index_start) / 4 - 1) as u32;
    let mut tail = [0u8; 6];
    tail[..4].copy_from_slice(&backward.to_le_bytes());
    tail[4..].copy_from_slice(&flags);
    s.extend_from_slice(&crc32fast::hash(&tail).to_le_bytes());
    s.extend_from_slice(&tail);
    s.extend_from_slice(&FOOTER_MAGIC);
    s
}

#[derive(Debug, Clone, Default)]
pub struct XzIndexer;

impl FormatIndexer for XzIndexer {
    fn format(&self) -> Format {
        Format::Xz
    }

    fn check_magic(&self, src: &SourceFile) -> Result<()> {
        match src.read_at(0, HEADER_MAGIC.len()) {
            Ok(head) if head == HEADER_MAGIC => Ok(()),
            Ok(_) => Err(format_err("magic mismatch")),
            Err(_) => Err(format_err("file too short")),
        }
    }

    fn build_index(&self, src: &SourceFile) -> Result<BlockIndex> {
        let data = src.bytes();
        let mut streams = Vec::new();
        let mut end = data.len();
        loop {
            // Stream padding comes in groups of four zero bytes.
            while end >= 4 && data[end - 4..end] == [0u8; 4] {
                end -= 4;
            }
            if end == 0 {
                break;
            }
            let (records, start) = parse_stream(data, end).map_err(|e| match e {
                Error::Eof { .. } => format_err("truncated stream"),
                other => other,
            })?;
            streams.push(records);
            end = start;
        }

        let mut blocks = Vec::new();
        let mut uoff = 0u64;
        for rec in streams.into_iter().rev().flatten() {
            if rec.uncompressed == 0 {
                continue;
            }
            let too_large = || Error::decode(rec.coff, "block too large to index");
            let usize = u32::try_from(rec.uncompressed).map_err(|_| too_large())?;
            let csize = u32::try_from(rec.unpadded).map_err(|_| too_large())?;
            blocks.push(Block { uoff, usize, coff: rec.coff, csize, extra: BlockExtra::Xz { check: rec.check } });
            uoff += rec.uncompressed;
        }
        BlockIndex::new(Format::Xz, blocks)
    }

    fn decompress_block(&self, src: &SourceFile, block: &Block) -> Result<Vec<u8>> {
        let BlockExtra::Xz { check } = block.extra else {
            return Err(Error::decode(block.coff, "not an xz block"));
        };
        let unpadded = u64::from(block.csize);
        let bytes = src.read_at(block.coff, round4(unpadded) as usize)?;
        let stream = single_block_stream(bytes, check, unpadded, u64::from(block.usize));

        let mut out = Vec::with_capacity(block.usize as usize);
        XzDecoder::new(&stream[..])
            .read_to_end(&mut out)
            .map_err(|e| Error::decode(block.coff, e.to_string()))?;
        if out.len() != block.usize as usize {
            return Err(Error::decode(
                block.coff,
                format!("block decoded to {} bytes, expected {}", out.len(), block.usize),
            ));
        }
        Ok(out)
    }

    fn destination_name(&self, path: &Path) -> String {
        strip_extension(path, &["tpxz", "txz"], &["pxz", "xz"])
    }
}
