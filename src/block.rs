//! Block records and the per-file block index.
//!
//! A [`Block`] maps a contiguous range of uncompressed bytes to the range of
//! compressed bytes that produces it, plus whatever a format needs to restart
//! decoding there ([`BlockExtra`]). A [`BlockIndex`] is the ordered, gap-free
//! list of blocks for one file; it is built once and never changes afterwards.

use crate::error::{Error, Result};
use crate::format::Format;

/// Format-specific data needed to decompress a block on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockExtra {
    Lzop {
        /// Header flags of the lzop member holding the block.
        flags: u32,
    },
    Gzip {
        /// Bits of byte `coff` that belong to this block (0 when byte aligned).
        prime_bits: u8,
        /// Preceding window needed for back references; empty for independent blocks.
        dictionary: Vec<u8>,
    },
    Bzip2 {
        /// Bit offset of the block marker inside byte `coff`.
        bit: u8,
        /// Bits of the last byte that belong to the block (0 when the end is aligned).
        end_bit: u8,
        /// Block size level, `b'1'..=b'9'`.
        level: u8,
    },
    Xz {
        check: u8,
    },
    Zstd {
        checksum: Option<u32>,
    },
}

impl std::fmt::Display for BlockExtra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockExtra::Lzop { flags } => write!(f, "flags={flags:#x}"),
            BlockExtra::Gzip { prime_bits, dictionary } => {
                write!(f, "prime_bits={prime_bits} dictionary={}", dictionary.len())
            }
            BlockExtra::Bzip2 { bit, end_bit, level } => {
                write!(f, "bit={bit} end_bit={end_bit} level={}", char::from(*level))
            }
            BlockExtra::Xz { check } => write!(f, "check={check}"),
            BlockExtra::Zstd { checksum: Some(sum) } => write!(f, "checksum={sum:08x}"),
            BlockExtra::Zstd { checksum: None } => f.write_str("checksum=none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Offset of the block's first byte in the uncompressed data.
    pub uoff: u64,
    pub usize: u32,
    /// Offset of the block's first compressed byte in the source file.
    pub coff: u64,
    pub csize: u32,
    pub extra: BlockExtra,
}

impl Block {
    /// One past the last uncompressed byte.
    pub fn uend(&self) -> u64 {
        self.uoff + u64::from(self.usize)
    }

    pub fn cend(&self) -> u64 {
        self.coff + u64::from(self.csize)
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.uoff && offset < self.uend()
    }
}

/// Ordered blocks of one compressed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    format: Format,
    blocks: Vec<Block>,
}

impl BlockIndex {
    /// Wrap `blocks`, checking that they tile the uncompressed data without
    /// gaps: the first starts at 0, each begins where the previous one ends,
    /// none is empty, and compressed offsets never go backwards.
    pub fn new(format: Format, blocks: Vec<Block>) -> Result<Self> {
        let mut expect_uoff = 0u64;
        let mut last_coff = 0u64;
        for (i, b) in blocks.iter().enumerate() {
            if b.usize == 0 {
                return Err(Error::CorruptIndex(format!("block {i} is empty")));
            }
            if b.uoff != expect_uoff {
                return Err(Error::CorruptIndex(format!(
                    "block {i} starts at {} but previous block ends at {expect_uoff}",
                    b.uoff
                )));
            }
            if b.coff < last_coff {
                return Err(Error::CorruptIndex(format!("block {i} compressed offset goes backwards")));
            }
            expect_uoff = b.uend();
            last_coff = b.coff;
        }
        Ok(Self { format, blocks })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&Block> {
        self.blocks.get(pos)
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.blocks.last().map_or(0, Block::uend)
    }

    /// Largest single block, in uncompressed bytes.
    pub fn max_block_size(&self) -> u32 {
        self.blocks.iter().map(|b| b.usize).max().unwrap_or(0)
    }

    /// Position of the block containing uncompressed `offset`.
    pub fn find_block(&self, offset: u64) -> Result<usize> {
        let size = self.uncompressed_size();
        if offset >= size {
            return Err(Error::OutOfRange { offset, size });
        }
        // First block whose end is past the offset.
        Ok(self.blocks.partition_point(|b| b.uend() <= offset))
    }
}
