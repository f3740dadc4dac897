//! Compression formats.
//!
//! Every supported format implements [`FormatIndexer`]: it recognises its
//! files, finds the block boundaries of a file, and decompresses one block in
//! isolation. The indexers are stateless apart from configuration, so a single
//! instance is shared by every thread decompressing out of a file; codec state
//! lives only for the duration of one call.

use std::fmt;
use std::path::Path;

use crate::block::{Block, BlockIndex};
use crate::config::Config;
use crate::error::Result;
use crate::io::SourceFile;

pub mod bzip2;
pub mod gzip;
pub mod lzop;
pub mod xz;
mod zlib;
pub mod zstd;

/// The closed set of supported formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Lzop,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Format {
    /// Detection order used when opening a file.
    pub const ALL: [Format; 5] = [Format::Lzop, Format::Gzip, Format::Bzip2, Format::Xz, Format::Zstd];

    pub fn name(self) -> &'static str {
        match self {
            Format::Lzop => "lzop",
            Format::Gzip => "gzip",
            Format::Bzip2 => "bzip2",
            Format::Xz => "xz",
            Format::Zstd => "zstd",
        }
    }

    /// Build the indexer for this format.
    pub fn indexer(self, config: &Config) -> Box<dyn FormatIndexer> {
        match self {
            Format::Lzop => Box::new(lzop::LzopIndexer),
            Format::Gzip => Box::new(gzip::GzipIndexer::new(config.gzip_block_factor)),
            Format::Bzip2 => Box::new(bzip2::Bzip2Indexer),
            Format::Xz => Box::new(xz::XzIndexer),
            Format::Zstd => Box::new(zstd::ZstdIndexer),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-format block discovery and decompression.
pub trait FormatIndexer: Send + Sync {
    fn format(&self) -> Format;

    /// Succeeds if `src` looks like this format, otherwise fails with
    /// [`Error::Format`](crate::Error::Format).
    fn check_magic(&self, src: &SourceFile) -> Result<()>;

    /// Scan the whole file and produce its block index.
    fn build_index(&self, src: &SourceFile) -> Result<BlockIndex>;

    /// Decompress exactly one block.
    fn decompress_block(&self, src: &SourceFile, block: &Block) -> Result<Vec<u8>>;

    /// Name the uncompressed data should be exposed under.
    fn destination_name(&self, path: &Path) -> String;
}

/// Basename of `path` with a tarball extension mapped to `.tar` or a plain
/// compression extension removed. The first matching rule wins.
pub(crate) fn strip_extension(path: &Path, tar_exts: &[&str], plain_exts: &[&str]) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for ext in tar_exts {
        if let Some(stem) = strip_suffix_ext(&base, ext) {
            return format!("{stem}.tar");
        }
    }
    for ext in plain_exts {
        if let Some(stem) = strip_suffix_ext(&base, ext) {
            return stem.to_string();
        }
    }
    base
}

fn strip_suffix_ext<'a>(name: &'a str, ext: &str) -> Option<&'a str> {
    let stem = name.strip_suffix(ext)?.strip_suffix('.')?;
    (!stem.is_empty()).then_some(stem)
}
