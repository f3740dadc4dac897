//! bzip2 block discovery.
//!
//! bzip2 blocks start with a 48-bit marker that is not byte aligned, so the
//! indexer first scans the file for every bit position holding a block or
//! end-of-stream marker. Checking every bit would be slow; instead a 256-entry
//! table says, for each byte value, how many bits of the previous byte a marker
//! would need if this byte were its first full byte. Only those bytes are
//! examined.
//!
//! Markers can also occur by chance inside compressed data. Each candidate end
//! is confirmed by cutting the bits between a known block start and the
//! candidate into a synthetic one-block stream and decoding it: false
//! positives fail to decode and are skipped.

use std::io::Read;
use std::path::Path;

use ::bzip2::read::BzDecoder;
use tracing::debug;

use super::{strip_extension, Format, FormatIndexer};
use crate::bits::{BitReader, BitWriter};
use crate::block::{Block, BlockExtra, BlockIndex};
use crate::error::{Error, Result};
use crate::io::SourceFile;

pub const BLOCK_MAGIC: u64 = 0x3141_5926_5359;
pub const EOS_MAGIC: u64 = 0x1772_4538_5090;
const MAGIC_MASK: u64 = (1 << 48) - 1;
const MAGIC_BITS: u64 = 48;
const CRC_BITS: u64 = 32;
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    Block,
    EndOfStream,
}

/// A marker found by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub kind: BoundaryKind,
    /// Absolute bit position of the marker's first bit.
    pub bit: u64,
}

fn shift_table() -> [i8; 256] {
    let mut table = [-1i8; 256];
    for magic in [BLOCK_MAGIC, EOS_MAGIC] {
        let first = ((magic >> 40) & 0xff) as u32;
        let second = ((magic >> 32) & 0xff) as u32;
        for shift in 0..8u32 {
            let byte = ((first << shift) | (second >> (8 - shift))) & 0xff;
            table[byte as usize] = shift as i8;
        }
    }
    table
}

/// Every bit position in `data` holding a block or end-of-stream marker, in order.
pub fn scan_boundaries(data: &[u8]) -> Vec<Boundary> {
    let table = shift_table();
    let total_bits = data.len() as u64 * 8;
    let mut found = Vec::new();
    for (i, &byte) in data.iter().enumerate() {
        let shift = table[byte as usize];
        if shift < 0 || (shift > 0 && i == 0) {
            continue;
        }
        let shift = shift as u64;
        let bit = i as u64 * 8 - shift;
        if bit + MAGIC_BITS > total_bits {
            break;
        }

        let mut word = [0u8; 8];
        let avail = (data.len() - i).min(8);
        word[..avail].copy_from_slice(&data[i..i + avail]);
        let mut v = u64::from_be_bytes(word) >> (16 + shift);
        if shift > 0 {
            v |= (u64::from(data[i - 1]) << (48 - shift)) & MAGIC_MASK;
        }

        let kind = match v {
            BLOCK_MAGIC => BoundaryKind::Block,
            EOS_MAGIC => BoundaryKind::EndOfStream,
            _ => continue,
        };
        found.push(Boundary { kind, bit });
    }
    found
}

/// Decode bits `[start, end)` of `data` as a stream holding just that block.
fn decode_block_bits(data: &[u8], level: u8, start: u64, end: u64) -> Result<Vec<u8>> {
    let coff = start / 8;
    let nbits = end
        .checked_sub(start)
        .filter(|&n| n >= MAGIC_BITS + CRC_BITS)
        .ok_or_else(|| Error::decode(coff, "block shorter than its header"))?;

    let mut w = BitWriter::with_capacity((nbits / 8) as usize + 16);
    w.put_bytes(b"BZh");
    w.put_byte(level);
    let mut r = BitReader::new(data, start);
    w.take(&mut r, nbits)?;
    w.put(24, (EOS_MAGIC >> 24) as u32);
    w.put(24, (EOS_MAGIC & 0xff_ffff) as u32);
    // The stream CRC of a one-block stream is the block CRC, which sits right
    // after the block marker.
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&w.as_bytes()[10..14]);
    w.put_bytes(&crc);

    let stream = w.into_bytes();
    let mut out = Vec::new();
    BzDecoder::new(&stream[..])
        .read_to_end(&mut out)
        .map_err(|e| Error::decode(coff, e.to_string()))?;
    Ok(out)
}

fn stream_level(data: &[u8], at: usize) -> Option<u8> {
    match data.get(at..at + HEADER_LEN) {
        Some([b'B', b'Z', b'h', level @ b'1'..=b'9']) => Some(*level),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bzip2Indexer;

impl Bzip2Indexer {
    /// Confirm the blocks of the stream whose header is at byte `stream_start`.
    /// `next` is the first candidate not yet consumed; returns the bit position
    /// of the stream's end marker.
    fn index_stream(
        &self,
        data: &[u8],
        candidates: &[Boundary],
        next: &mut usize,
        stream_start: usize,
        level: u8,
        uoff: &mut u64,
        blocks: &mut Vec<Block>,
    ) -> Result<u64> {
        let first_bit = (stream_start + HEADER_LEN) as u64 * 8;
        while *next < candidates.len() && candidates[*next].bit < first_bit {
            *next += 1;
        }
        let Some(first) = candidates.get(*next).filter(|c| c.bit == first_bit) else {
            return Err(Error::decode(first_bit / 8, "bzip2 stream does not start with a marker"));
        };
        if first.kind == BoundaryKind::EndOfStream {
            return Ok(first.bit);
        }

        let mut start = first.bit;
        loop {
            let mut confirmed = None;
            for (j, cand) in candidates.iter().enumerate().skip(*next + 1) {
                match decode_block_bits(data, level, start, cand.bit) {
                    Ok(out) => {
                        confirmed = Some((j, out.len()));
                        break;
                    }
                    Err(e) => debug!(bit = cand.bit, error = %e, "rejecting bzip2 marker candidate"),
                }
            }
            let Some((j, len)) = confirmed else {
                return Err(Error::decode(start / 8, "no valid end found for bzip2 block"));
            };
            let end = candidates[j].bit;
            if len > 0 {
                blocks.push(block_record(start, end, len, level, *uoff)?);
                *uoff += len as u64;
            }
            *next = j;
            if candidates[j].kind == BoundaryKind::EndOfStream {
                return Ok(end);
            }
            start = end;
        }
    }
}

fn block_record(start: u64, end: u64, len: usize, level: u8, uoff: u64) -> Result<Block> {
    let coff = start / 8;
    let cend = (end + 7) / 8;
    let too_large = || Error::decode(coff, "block too large to index");
    Ok(Block {
        uoff,
        usize: u32::try_from(len).map_err(|_| too_large())?,
        coff,
        csize: u32::try_from(cend - coff).map_err(|_| too_large())?,
        extra: BlockExtra::Bzip2 { bit: (start % 8) as u8, end_bit: (end % 8) as u8, level },
    })
}

impl FormatIndexer for Bzip2Indexer {
    fn format(&self) -> Format {
        Format::Bzip2
    }

    fn check_magic(&self, src: &SourceFile) -> Result<()> {
        let data = src.bytes();
        if stream_level(data, 0).is_none() {
            return Err(Error::format("bzip2", "magic mismatch"));
        }
        let marker = src
            .read_at(HEADER_LEN as u64, 6)
            .map_err(|_| Error::format("bzip2", "file too short"))?;
        let mut word = [0u8; 8];
        word[2..].copy_from_slice(marker);
        match u64::from_be_bytes(word) {
            BLOCK_MAGIC | EOS_MAGIC => Ok(()),
            _ => Err(Error::format("bzip2", "missing block marker")),
        }
    }

    fn build_index(&self, src: &SourceFile) -> Result<BlockIndex> {
        let data = src.bytes();
        let candidates = scan_boundaries(data);
        debug!(candidates = candidates.len(), "scanned bzip2 markers");

        let mut blocks = Vec::new();
        let mut uoff = 0;
        let mut next = 0;
        let mut stream_start = 0;
        while let Some(level) = stream_level(data, stream_start) {
            let eos = self.index_stream(data, &candidates, &mut next, stream_start, level, &mut uoff, &mut blocks)?;
            // End marker and combined CRC, then padding to a byte boundary.
            stream_start = ((eos + MAGIC_BITS + CRC_BITS + 7) / 8) as usize;
        }
        if stream_start < data.len() {
            debug!(offset = stream_start, "ignoring trailing bytes after last bzip2 stream");
        }
        BlockIndex::new(Format::Bzip2, blocks)
    }

    fn decompress_block(&self, src: &SourceFile, block: &Block) -> Result<Vec<u8>> {
        let BlockExtra::Bzip2 { bit, end_bit, level } = block.extra else {
            return Err(Error::decode(block.coff, "not a bzip2 block"));
        };
        let start = block.coff * 8 + u64::from(bit);
        let mut end = block.cend() * 8;
        if end_bit > 0 {
            end -= u64::from(8 - end_bit);
        }
        let out = decode_block_bits(src.bytes(), level, start, end)?;
        if out.len() != block.usize as usize {
            return Err(Error::decode(
                block.coff,
                format!("block decoded to {} bytes, expected {}", out.len(), block.usize),
            ));
        }
        Ok(out)
    }

    fn destination_name(&self, path: &Path) -> String {
        strip_extension(path, &["tbz2", "tbz"], &["bz2"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::bzip2::write::BzEncoder;
    use ::bzip2::Compression;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn compress(data: &[u8], level: u32) -> Vec<u8> {
        let mut enc = BzEncoder::new(Vec::new(), Compression::new(level));
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn random(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill(&mut data[..]);
        data
    }

    fn source(bytes: &[u8]) -> (NamedTempFile, SourceFile) {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(bytes).unwrap();
        let src = SourceFile::open(tmp.path()).unwrap();
        (tmp, src)
    }

    #[test]
    fn shift_table_covers_both_markers() {
        let table = shift_table();
        assert_eq!(table[0x31], 0);
        assert_eq!(table[0x17], 0);
        assert_eq!(table.iter().filter(|&&s| s >= 0).count(), 16);
    }

    #[test]
    fn finds_markers_at_every_shift() {
        for shift in 0..8u32 {
            let mut w = BitWriter::new();
            w.put(8, 0xff);
            w.put(shift, 0);
            w.put(24, (BLOCK_MAGIC >> 24) as u32);
            w.put(24, (BLOCK_MAGIC & 0xff_ffff) as u32);
            w.put(16, 0);
            let found = scan_boundaries(w.as_bytes());
            assert_eq!(found, vec![Boundary { kind: BoundaryKind::Block, bit: 8 + u64::from(shift) }]);
        }
    }

    #[test]
    fn two_block_file() {
        let data = random(150_000, 42);
        let file = compress(&data, 1);

        let found = scan_boundaries(&file);
        let kinds: Vec<_> = found.iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![BoundaryKind::Block, BoundaryKind::Block, BoundaryKind::EndOfStream]);
        assert_eq!(found[0].bit, 32);

        let (_tmp, src) = source(&file);
        let indexer = Bzip2Indexer;
        indexer.check_magic(&src).unwrap();
        let index = indexer.build_index(&src).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.uncompressed_size(), data.len() as u64);
        for b in index.blocks() {
            let out = indexer.decompress_block(&src, b).unwrap();
            assert_eq!(out, &data[b.uoff as usize..b.uend() as usize]);
        }
    }

    #[test]
    fn undecodable_candidate_is_skipped() {
        let data = random(150_000, 43);
        let file = compress(&data, 1);
        let real = scan_boundaries(&file);
        assert_eq!(real.len(), 3);

        // A marker-shaped match in the middle of the first block's data.
        let fake = Boundary { kind: BoundaryKind::Block, bit: (real[0].bit + real[1].bit) / 2 };
        let candidates = vec![real[0], fake, real[1], real[2]];

        let mut blocks = Vec::new();
        let (mut next, mut uoff) = (0, 0);
        let eos = Bzip2Indexer.index_stream(&file, &candidates, &mut next, 0, b'1', &mut uoff, &mut blocks).unwrap();
        assert_eq!(eos, real[2].bit);
        assert_eq!(next, 3);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].coff, real[0].bit / 8);
        assert_eq!(blocks[1].coff, real[1].bit / 8);
        assert_eq!(uoff, data.len() as u64);

        let (_tmp, src) = source(&file);
        assert_eq!(blocks, Bzip2Indexer.build_index(&src).unwrap().blocks());
        for b in &blocks {
            let out = Bzip2Indexer.decompress_block(&src, b).unwrap();
            assert_eq!(out, &data[b.uoff as usize..b.uend() as usize]);
        }
    }

    #[test]
    fn concatenated_streams() {
        let a = random(30_000, 1);
        let b = b"second stream ".repeat(2_000);
        let mut file = compress(&a, 9);
        file.extend(compress(b"", 9));
        file.extend(compress(&b, 5));
        let (_tmp, src) = source(&file);
        let index = Bzip2Indexer.build_index(&src).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.blocks()[1].uoff, a.len() as u64);
        let second = Bzip2Indexer.decompress_block(&src, &index.blocks()[1]).unwrap();
        assert_eq!(second, b);
    }

    #[test]
    fn rejects_non_bzip2() {
        let (_tmp, src) = source(b"BZh0 not really");
        assert!(matches!(Bzip2Indexer.check_magic(&src), Err(Error::Format { .. })));
    }

    #[test]
    fn destination_names() {
        assert_eq!(Bzip2Indexer.destination_name(Path::new("a/b.tbz2")), "b.tar");
        assert_eq!(Bzip2Indexer.destination_name(Path::new("b.csv.bz2")), "b.csv");
    }
}
