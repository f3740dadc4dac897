//! An opened compressed file: its bytes, its format and its block index.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::block::{Block, BlockIndex};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::format::{Format, FormatIndexer};
use crate::index_store;
use crate::io::SourceFile;

/// Process-unique identity of an opened file, used to key cached blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl FileId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FileId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct CompressedFile {
    id: FileId,
    source: SourceFile,
    indexer: Box<dyn FormatIndexer>,
    index: BlockIndex,
}

impl std::fmt::Debug for CompressedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedFile")
            .field("id", &self.id)
            .field("path", &self.source.path())
            .field("format", &self.index.format())
            .field("blocks", &self.index.len())
            .finish()
    }
}

impl CompressedFile {
    /// Open `path`, detecting its format by trying every supported one in
    /// turn. The block index comes from the sidecar when it is usable and is
    /// rebuilt (and saved, if configured) otherwise.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> Result<Arc<Self>> {
        let source = SourceFile::open(path)?;
        let format = detect(&source, config)?;
        Self::with_indexer(source, format.indexer(config), config)
    }

    /// Open `path` as `format` without detection.
    pub fn open_as(path: impl AsRef<Path>, format: Format, config: &Config) -> Result<Arc<Self>> {
        let source = SourceFile::open(path)?;
        let indexer = format.indexer(config);
        indexer.check_magic(&source)?;
        Self::with_indexer(source, indexer, config)
    }

    fn with_indexer(source: SourceFile, indexer: Box<dyn FormatIndexer>, config: &Config) -> Result<Arc<Self>> {
        let index = load_or_build(&source, indexer.as_ref(), config)?;
        let largest = index.max_block_size() as usize;
        if largest > config.cache_size {
            warn!(
                path = %source.path().display(),
                largest,
                cache_size = config.cache_size,
                "blocks too large to cache, every read of them decompresses again"
            );
        }
        Ok(Arc::new(Self { id: FileId::next(), source, indexer, index }))
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.source.path()
    }

    pub fn format(&self) -> Format {
        self.index.format()
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.index.uncompressed_size()
    }

    pub fn block(&self, pos: usize) -> Result<&Block> {
        self.index.get(pos).ok_or(Error::OutOfRange { offset: pos as u64, size: self.index.len() as u64 })
    }

    /// Decompress the block at position `pos` of the index.
    pub fn decompress_block(&self, pos: usize) -> Result<Vec<u8>> {
        let block = self.block(pos)?;
        self.indexer.decompress_block(&self.source, block)
    }

    pub fn destination_name(&self) -> String {
        self.indexer.destination_name(self.source.path())
    }
}

/// Format of the file at `path`.
pub fn detect_format(path: impl AsRef<Path>, config: &Config) -> Result<Format> {
    detect(&SourceFile::open(path)?, config)
}

fn detect(source: &SourceFile, config: &Config) -> Result<Format> {
    for format in Format::ALL {
        match format.indexer(config).check_magic(source) {
            Ok(()) => return Ok(format),
            Err(Error::Format { reason, .. }) => {
                debug!(path = %source.path().display(), %format, %reason, "format rejected");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::UnknownFormat { path: source.path().to_path_buf() })
}

/// A sidecar older than its source describes some earlier version of it.
fn is_stale(source: &Path, sidecar: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified());
    matches!((modified(source), modified(sidecar)), (Ok(s), Ok(i)) if s > i)
}

fn load_or_build(source: &SourceFile, indexer: &dyn FormatIndexer, config: &Config) -> Result<BlockIndex> {
    let format = indexer.format();
    let sidecar = index_store::sidecar_path(source.path(), &config.index_suffix);

    if is_stale(source.path(), &sidecar) {
        debug!(sidecar = %sidecar.display(), "sidecar older than source, rebuilding");
    } else {
        match index_store::load(&sidecar, format, source.len()) {
            Ok(index) => {
                debug!(sidecar = %sidecar.display(), blocks = index.len(), "loaded block index");
                return Ok(index);
            }
            Err(Error::Io { source: e, .. }) if e.kind() == io::ErrorKind::NotFound => {
                debug!(sidecar = %sidecar.display(), "no sidecar, building index");
            }
            Err(e) => debug!(sidecar = %sidecar.display(), error = %e, "sidecar unusable, rebuilding"),
        }
    }

    let started = Instant::now();
    let index = indexer.build_index(source)?;
    info!(
        path = %source.path().display(),
        %format,
        blocks = index.len(),
        uncompressed = index.uncompressed_size(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "built block index"
    );
    if config.write_index {
        if let Err(e) = index_store::save(&sidecar, &index) {
            warn!(sidecar = %sidecar.display(), error = %e, "could not save block index");
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use xz2::write::XzEncoder;

    fn write_xz(path: &Path, data: &[u8]) {
        let mut enc = XzEncoder::new(Vec::new(), 1);
        enc.write_all(data).unwrap();
        fs::write(path, enc.finish().unwrap()).unwrap();
    }

    #[test]
    fn detects_format_and_writes_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txz");
        write_xz(&path, b"hello there");

        let file = CompressedFile::open(&path, &Config::default()).unwrap();
        assert_eq!(file.format(), Format::Xz);
        assert_eq!(file.uncompressed_size(), 11);
        assert_eq!(file.destination_name(), "notes.tar");
        assert_eq!(file.decompress_block(0).unwrap(), b"hello there");
        assert!(dir.path().join("notes.txz.blockIdx").exists());
    }

    #[test]
    fn no_sidecar_when_disabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.xz");
        write_xz(&path, b"abc");
        let config = Config { write_index: false, ..Config::default() };
        CompressedFile::open(&path, &config).unwrap();
        assert!(!dir.path().join("a.xz.blockIdx").exists());
    }

    #[test]
    fn distinct_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.xz");
        write_xz(&path, b"abc");
        let a = CompressedFile::open(&path, &Config::default()).unwrap();
        let b = CompressedFile::open(&path, &Config::default()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn unknown_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, b"just text, nothing compressed here").unwrap();
        assert!(matches!(
            CompressedFile::open(&path, &Config::default()),
            Err(Error::UnknownFormat { .. })
        ));
    }

    #[test]
    fn out_of_range_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.xz");
        write_xz(&path, b"abc");
        let file = CompressedFile::open(&path, &Config::default()).unwrap();
        assert!(matches!(file.decompress_block(1), Err(Error::OutOfRange { .. })));
    }
}
