//! gzip block discovery.
//!
//! Deflate has no restart markers, so the indexer decodes the whole file once
//! with zlib stopping after every deflate block. At each block boundary it
//! takes a [`Snapshot`] and lets a second, dictionary-less decoder try to
//! produce a full 32 KiB window from there. If that works, nothing after the
//! boundary refers back across it and a new independent block starts there.
//! Otherwise the snapshot is dropped and the main decoder simply carries on,
//! so nothing has to be rewound. When independent boundaries are too rare the
//! indexer forces a block anyway and stores the current 32 KiB window as its
//! dictionary.
//!
//! Concatenated gzip members are indexed in turn; each member starts a block.

use std::path::Path;

use tracing::debug;

use super::zlib::{Flush, Inflater, Status, ZlibError};
use super::{strip_extension, Format, FormatIndexer};
use crate::block::{Block, BlockExtra, BlockIndex};
use crate::error::{Error, Result};
use crate::io::SourceFile;

/// Size of the deflate history window.
pub const WINDOW_SIZE: usize = 32 * 1024;

/// Default spacing of forced blocks, in windows.
pub const DEFAULT_BLOCK_FACTOR: u32 = 32;

const MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

fn zlib_err(coff: u64) -> impl Fn(ZlibError) -> Error {
    move |e| Error::decode(coff, e.to_string())
}

/// A deflate block boundary where decoding could restart.
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    /// Byte holding the boundary's first bit.
    coff: u64,
    /// Bits of that byte that still belong to the new block.
    prime_bits: u8,
    uoff: u64,
}

/// Ring buffer holding the most recent window of decoder output.
struct Window {
    buf: Box<[u8]>,
    have: usize,
    wrapped: bool,
}

impl Window {
    fn new() -> Self {
        Self { buf: vec![0u8; WINDOW_SIZE].into_boxed_slice(), have: 0, wrapped: false }
    }

    /// Space the decoder may write into next; never empty.
    fn free(&mut self) -> &mut [u8] {
        if self.have == self.buf.len() {
            self.have = 0;
            self.wrapped = true;
        }
        &mut self.buf[self.have..]
    }

    fn advance(&mut self, n: usize) {
        self.have += n;
    }

    /// The window in output order, oldest byte first.
    fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WINDOW_SIZE);
        if self.wrapped {
            out.extend_from_slice(&self.buf[self.have..]);
        }
        out.extend_from_slice(&self.buf[..self.have]);
        out
    }
}

/// Block being accumulated by the scanner.
struct OpenBlock {
    start: Snapshot,
    dictionary: Vec<u8>,
}

impl OpenBlock {
    /// Close the block at compressed byte `cend` and uncompressed offset `uend`.
    /// Empty blocks are dropped.
    fn close(self, cend: u64, uend: u64, blocks: &mut Vec<Block>) -> Result<()> {
        if uend == self.start.uoff {
            return Ok(());
        }
        let coff = self.start.coff;
        let usize = u32::try_from(uend - self.start.uoff)
            .map_err(|_| Error::decode(coff, "block too large to index"))?;
        let csize = u32::try_from(cend - coff).map_err(|_| Error::decode(coff, "block too large to index"))?;
        blocks.push(Block {
            uoff: self.start.uoff,
            usize,
            coff,
            csize,
            extra: BlockExtra::Gzip { prime_bits: self.start.prime_bits, dictionary: self.dictionary },
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GzipIndexer {
    block_factor: u32,
}

impl Default for GzipIndexer {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_FACTOR)
    }
}

impl GzipIndexer {
    pub fn new(block_factor: u32) -> Self {
        Self { block_factor: block_factor.max(1) }
    }

    /// Uncompressed distance after which a block with a dictionary is forced.
    fn max_distance(&self) -> u64 {
        u64::from(self.block_factor) * WINDOW_SIZE as u64
    }

    /// Index one gzip member starting at `start`. Returns the byte after the
    /// member's trailer and the uncompressed offset reached.
    fn index_member(&self, data: &[u8], start: usize, uoff: u64, blocks: &mut Vec<Block>) -> Result<(usize, u64)> {
        let mut inf = Inflater::gzip().map_err(zlib_err(start as u64))?;
        let mut window = Window::new();
        let mut probe_buf = vec![0u8; WINDOW_SIZE];
        let mut ipos = start;
        let mut upos = uoff;
        let mut deflate_end = None;
        let mut open: Option<OpenBlock> = None;

        loop {
            let step = inf
                .inflate(&data[ipos..], window.free(), Flush::Block)
                .map_err(zlib_err(ipos as u64))?;
            window.advance(step.produced);
            ipos += step.consumed;
            upos += step.produced as u64;

            match step.status {
                Status::StreamEnd => {
                    if let Some(block) = open.take() {
                        let cend = deflate_end.unwrap_or(ipos) as u64;
                        block.close(cend, upos, blocks)?;
                    }
                    return Ok((ipos, upos));
                }
                Status::BufError => {
                    return Err(Error::decode(ipos as u64, "gzip member is truncated"));
                }
                Status::Ok => {}
            }

            let data_type = inf.data_type();
            if data_type & 128 == 0 {
                continue;
            }
            if data_type & 64 != 0 {
                // After the final deflate block; only the trailer is left.
                deflate_end = Some(ipos);
                continue;
            }

            let prime_bits = (data_type & 7) as u8;
            let here = Snapshot {
                coff: (ipos - usize::from(prime_bits > 0)) as u64,
                prime_bits,
                uoff: upos,
            };

            let Some(current) = open.as_ref() else {
                // End of the gzip header: every member starts a block.
                open = Some(OpenBlock { start: here, dictionary: Vec::new() });
                continue;
            };

            let distance = upos - current.start.uoff;
            if distance == 0 {
                continue;
            }
            let next = if distance >= WINDOW_SIZE as u64 && probe(data, &here, &mut probe_buf)? {
                debug!(coff = here.coff, uoff = here.uoff, "independent deflate boundary");
                Some(OpenBlock { start: here, dictionary: Vec::new() })
            } else if distance > self.max_distance() {
                debug!(coff = here.coff, uoff = here.uoff, "forcing block with dictionary");
                Some(OpenBlock { start: here, dictionary: window.contents() })
            } else {
                None
            };
            if let Some(next) = next {
                if let Some(done) = open.replace(next) {
                    done.close(ipos as u64, upos, blocks)?;
                }
            }
        }
    }
}

/// Try decoding a full window from `at` without any history. Success means the
/// data after `at` never refers back across it.
fn probe(data: &[u8], at: &Snapshot, out: &mut [u8]) -> Result<bool> {
    let mut inf = Inflater::raw().map_err(zlib_err(at.coff))?;
    let mut ipos = at.coff as usize;
    if at.prime_bits > 0 {
        inf.prime(at.prime_bits, data[ipos] >> (8 - at.prime_bits))
            .map_err(zlib_err(at.coff))?;
        ipos += 1;
    }
    let mut produced = 0;
    while produced < out.len() {
        let step = match inf.inflate(&data[ipos..], &mut out[produced..], Flush::None) {
            Ok(step) => step,
            // Typically "invalid distance too far back".
            Err(_) => return Ok(false),
        };
        ipos += step.consumed;
        produced += step.produced;
        match step.status {
            Status::StreamEnd => return Ok(true),
            Status::BufError => return Ok(false),
            Status::Ok if step.consumed == 0 && step.produced == 0 => return Ok(false),
            Status::Ok => {}
        }
    }
    Ok(true)
}

impl FormatIndexer for GzipIndexer {
    fn format(&self) -> Format {
        Format::Gzip
    }

    fn check_magic(&self, src: &SourceFile) -> Result<()> {
        match src.read_at(0, MAGIC.len()) {
            Ok(head) if head == MAGIC => Ok(()),
            Ok(_) => Err(Error::format("gzip", "magic mismatch")),
            Err(_) => Err(Error::format("gzip", "file too short")),
        }
    }

    fn build_index(&self, src: &SourceFile) -> Result<BlockIndex> {
        let data = src.bytes();
        let mut blocks = Vec::new();
        let mut pos = 0;
        let mut uoff = 0;
        loop {
            let (end, uend) = self.index_member(data, pos, uoff, &mut blocks)?;
            pos = end;
            uoff = uend;
            if !data[pos..].starts_with(&MAGIC) {
                if pos < data.len() {
                    debug!(offset = pos, "ignoring trailing bytes after last gzip member");
                }
                break;
            }
        }
        BlockIndex::new(Format::Gzip, blocks)
    }

    fn decompress_block(&self, src: &SourceFile, block: &Block) -> Result<Vec<u8>> {
        let BlockExtra::Gzip { prime_bits, dictionary } = &block.extra else {
            return Err(Error::decode(block.coff, "not a gzip block"));
        };
        let coff = block.coff;
        let mut inf = Inflater::raw().map_err(zlib_err(coff))?;
        let mut ipos = coff;
        if *prime_bits > 0 {
            let byte = src.read_at(coff, 1)?[0];
            inf.prime(*prime_bits, byte >> (8 - *prime_bits)).map_err(zlib_err(coff))?;
            ipos += 1;
        }
        if !dictionary.is_empty() {
            inf.set_dictionary(dictionary).map_err(zlib_err(coff))?;
        }

        let input = src.tail(ipos)?;
        let mut out = vec![0u8; block.usize as usize];
        let mut consumed = 0;
        let mut produced = 0;
        while produced < out.len() {
            let step = inf
                .inflate(&input[consumed..], &mut out[produced..], Flush::None)
                .map_err(zlib_err(coff))?;
            consumed += step.consumed;
            produced += step.produced;
            let stalled = step.consumed == 0 && step.produced == 0;
            if produced < out.len() && (step.status != Status::Ok || stalled) {
                return Err(Error::decode(
                    coff,
                    format!("deflate data ended after {produced} of {} bytes", out.len()),
                ));
            }
        }
        Ok(out)
    }

    fn destination_name(&self, path: &Path) -> String {
        strip_extension(path, &["tgz"], &["gz"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn gzip(data: &[u8]) -> Vec<u8> {
        gzip_with(data, Compression::default())
    }

    fn gzip_with(data: &[u8], level: Compression) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), level);
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn source(bytes: &[u8]) -> (NamedTempFile, SourceFile) {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(bytes).unwrap();
        let src = SourceFile::open(tmp.path()).unwrap();
        (tmp, src)
    }

    fn words(len: usize, seed: u64) -> Vec<u8> {
        const VOCAB: [&str; 8] = ["alpha ", "beta ", "gamma ", "delta ", "omega ", "kappa ", "zeta ", "sigma "];
        let mut rng = StdRng::seed_from_u64(seed);
        let mut out = Vec::with_capacity(len + 8);
        while out.len() < len {
            out.extend_from_slice(VOCAB[rng.gen_range(0..VOCAB.len())].as_bytes());
        }
        out.truncate(len);
        out
    }

    fn decompress_all(indexer: &GzipIndexer, src: &SourceFile, index: &BlockIndex) -> Vec<u8> {
        let mut out = Vec::new();
        for b in index.blocks() {
            out.extend(indexer.decompress_block(src, b).unwrap());
        }
        out
    }

    #[test]
    fn small_block_factor_forces_dictionary_blocks() {
        let data = words(1024 * 1024, 7);
        let (_tmp, src) = source(&gzip(&data));
        let indexer = GzipIndexer::new(2);
        indexer.check_magic(&src).unwrap();
        let index = indexer.build_index(&src).unwrap();

        assert!(index.len() >= 2, "expected several blocks, got {}", index.len());
        assert_eq!(index.uncompressed_size(), data.len() as u64);
        assert!(index
            .blocks()
            .iter()
            .skip(1)
            .any(|b| matches!(&b.extra, BlockExtra::Gzip { dictionary, .. } if dictionary.len() == WINDOW_SIZE)));

        // A later block decodes on its own from its stored state.
        let second = &index.blocks()[1];
        let alone = indexer.decompress_block(&src, second).unwrap();
        assert_eq!(alone, &data[second.uoff as usize..second.uend() as usize]);

        assert_eq!(decompress_all(&indexer, &src, &index), data);
    }

    #[test]
    fn stored_data_yields_independent_blocks() {
        let mut data = vec![0u8; 300 * 1024];
        StdRng::seed_from_u64(3).fill(&mut data[..]);
        let (_tmp, src) = source(&gzip_with(&data, Compression::none()));
        let indexer = GzipIndexer::default();
        let index = indexer.build_index(&src).unwrap();

        assert!(index.len() >= 2);
        for b in index.blocks() {
            assert!(matches!(&b.extra, BlockExtra::Gzip { dictionary, .. } if dictionary.is_empty()));
        }
        assert_eq!(decompress_all(&indexer, &src, &index), data);
    }

    #[test]
    fn members_are_indexed_in_turn() {
        let a = words(50_000, 1);
        let b = words(70_000, 2);
        let mut file = gzip(&a);
        file.extend(gzip(b""));
        file.extend(gzip(&b));
        let (_tmp, src) = source(&file);
        let indexer = GzipIndexer::default();
        let index = indexer.build_index(&src).unwrap();

        assert!(index.blocks().iter().any(|blk| blk.uoff == a.len() as u64));
        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        assert_eq!(decompress_all(&indexer, &src, &index), expected);
    }

    #[test]
    fn truncated_member_fails_to_index() {
        let data = words(100_000, 9);
        let mut file = gzip(&data);
        file.truncate(file.len() / 2);
        let (_tmp, src) = source(&file);
        assert!(matches!(GzipIndexer::default().build_index(&src), Err(Error::Decode { .. })));
    }

    #[test]
    fn rejects_other_formats() {
        let (_tmp, src) = source(b"BZh91AY&SY");
        assert!(matches!(GzipIndexer::default().check_magic(&src), Err(Error::Format { .. })));
    }
}
