//! Sidecar persistence for block indexes.
//!
//! An index is stored next to its source as a flat list of big-endian
//! records, `usize: u32, csize: u32, coff: u64` followed by the format's own
//! fields, closed by a record whose `usize` is zero. Uncompressed offsets are
//! not stored; they are the running sum of block sizes.
//!
//! | format | extra fields |
//! |--------|--------------|
//! | lzop   | `flags: u32` |
//! | gzip   | `prime_bits: u8, dict_len: u32, dict` |
//! | bzip2  | `bit: u8, end_bit: u8, level: u8` |
//! | xz     | `check: u8` |
//! | zstd   | `has_checksum: u8, checksum: u32` |
//!
//! Any problem reading a sidecar is reported as [`Error::CorruptIndex`] (or
//! [`Error::Io`]) so the caller can rebuild the index from the source.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::block::{Block, BlockExtra, BlockIndex};
use crate::error::{Error, Result};
use crate::format::gzip::WINDOW_SIZE;
use crate::format::Format;

/// Default sidecar suffix appended to the source path.
pub const DEFAULT_SUFFIX: &str = ".blockIdx";

/// `<source><suffix>`, e.g. `data.tar.gz.blockIdx`.
pub fn sidecar_path(source: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn read_err(path: &Path) -> impl Fn(io::Error) -> Error + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::CorruptIndex(format!("'{}' is truncated", path.display()))
        } else {
            Error::io(e, path)
        }
    }
}

fn write_extra<W: Write>(w: &mut W, extra: &BlockExtra) -> io::Result<()> {
    match extra {
        BlockExtra::Lzop { flags } => w.write_u32::<BigEndian>(*flags),
        BlockExtra::Gzip { prime_bits, dictionary } => {
            w.write_u8(*prime_bits)?;
            w.write_u32::<BigEndian>(dictionary.len() as u32)?;
            w.write_all(dictionary)
        }
        BlockExtra::Bzip2 { bit, end_bit, level } => {
            w.write_u8(*bit)?;
            w.write_u8(*end_bit)?;
            w.write_u8(*level)
        }
        BlockExtra::Xz { check } => w.write_u8(*check),
        BlockExtra::Zstd { checksum } => {
            w.write_u8(u8::from(checksum.is_some()))?;
            w.write_u32::<BigEndian>(checksum.unwrap_or(0))
        }
    }
}

fn read_extra<R: Read>(r: &mut R, format: Format, path: &Path) -> Result<BlockExtra> {
    let err = read_err(path);
    let corrupt = |what: &str| Error::CorruptIndex(format!("'{}': {what}", path.display()));
    Ok(match format {
        Format::Lzop => BlockExtra::Lzop { flags: r.read_u32::<BigEndian>().map_err(&err)? },
        Format::Gzip => {
            let prime_bits = r.read_u8().map_err(&err)?;
            if prime_bits > 7 {
                return Err(corrupt("invalid prime bit count"));
            }
            let len = r.read_u32::<BigEndian>().map_err(&err)? as usize;
            if len > WINDOW_SIZE {
                return Err(corrupt("dictionary larger than a window"));
            }
            let mut dictionary = vec![0u8; len];
            r.read_exact(&mut dictionary).map_err(&err)?;
            BlockExtra::Gzip { prime_bits, dictionary }
        }
        Format::Bzip2 => {
            let bit = r.read_u8().map_err(&err)?;
            let end_bit = r.read_u8().map_err(&err)?;
            let level = r.read_u8().map_err(&err)?;
            if bit > 7 || end_bit > 7 || !(b'1'..=b'9').contains(&level) {
                return Err(corrupt("invalid bzip2 block fields"));
            }
            BlockExtra::Bzip2 { bit, end_bit, level }
        }
        Format::Xz => BlockExtra::Xz { check: r.read_u8().map_err(&err)? },
        Format::Zstd => {
            let has = r.read_u8().map_err(&err)?;
            let sum = r.read_u32::<BigEndian>().map_err(&err)?;
            match has {
                0 => BlockExtra::Zstd { checksum: None },
                1 => BlockExtra::Zstd { checksum: Some(sum) },
                _ => return Err(corrupt("invalid checksum flag")),
            }
        }
    })
}

/// Write `index` to `path`, replacing any previous sidecar atomically.
pub fn save(path: &Path, index: &BlockIndex) -> Result<()> {
    let tmp = sidecar_path(path, ".tmp");
    let write = || -> io::Result<()> {
        let mut w = BufWriter::new(File::create(&tmp)?);
        for b in index.blocks() {
            w.write_u32::<BigEndian>(b.usize)?;
            w.write_u32::<BigEndian>(b.csize)?;
            w.write_u64::<BigEndian>(b.coff)?;
            write_extra(&mut w, &b.extra)?;
        }
        w.write_u32::<BigEndian>(0)?;
        w.write_u32::<BigEndian>(0)?;
        w.write_u64::<BigEndian>(0)?;
        w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io(e, path)
    })
}

/// Read the sidecar at `path` for a `format` file of `source_len` bytes.
pub fn load(path: &Path, format: Format, source_len: u64) -> Result<BlockIndex> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut r = BufReader::new(file);
    let err = read_err(path);

    let mut blocks = Vec::new();
    let mut uoff = 0u64;
    loop {
        let usize = r.read_u32::<BigEndian>().map_err(&err)?;
        let csize = r.read_u32::<BigEndian>().map_err(&err)?;
        let coff = r.read_u64::<BigEndian>().map_err(&err)?;
        if usize == 0 {
            break;
        }
        let extra = read_extra(&mut r, format, path)?;
        blocks.push(Block { uoff, usize, coff, csize, extra });
        uoff += u64::from(usize);
    }

    let index = BlockIndex::new(format, blocks)?;
    if let Some(last) = index.blocks().last() {
        if last.cend() > source_len {
            return Err(Error::CorruptIndex(format!(
                "'{}' refers past the end of the source ({} > {source_len})",
                path.display(),
                last.cend()
            )));
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn gzip_index() -> BlockIndex {
        BlockIndex::new(
            Format::Gzip,
            vec![
                Block { uoff: 0, usize: 100, coff: 10, csize: 40, extra: BlockExtra::Gzip { prime_bits: 0, dictionary: vec![] } },
                Block {
                    uoff: 100,
                    usize: 70_000,
                    coff: 49,
                    csize: 9_000,
                    extra: BlockExtra::Gzip { prime_bits: 5, dictionary: (0..WINDOW_SIZE).map(|i| i as u8).collect() },
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn roundtrip_is_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.gz.blockIdx");
        let index = gzip_index();
        save(&path, &index).unwrap();
        assert_eq!(load(&path, Format::Gzip, 1 << 20).unwrap(), index);
    }

    #[test]
    fn every_format_roundtrips() {
        let dir = tempdir().unwrap();
        let extras = [
            (Format::Lzop, BlockExtra::Lzop { flags: 0x301 }),
            (Format::Bzip2, BlockExtra::Bzip2 { bit: 3, end_bit: 6, level: b'9' }),
            (Format::Xz, BlockExtra::Xz { check: 4 }),
            (Format::Zstd, BlockExtra::Zstd { checksum: Some(0xdead_beef) }),
            (Format::Zstd, BlockExtra::Zstd { checksum: None }),
        ];
        for (i, (format, extra)) in extras.into_iter().enumerate() {
            let path = dir.path().join(format!("{i}.blockIdx"));
            let index = BlockIndex::new(
                format,
                vec![
                    Block { uoff: 0, usize: 5, coff: 0, csize: 5, extra: extra.clone() },
                    Block { uoff: 5, usize: 7, coff: 5, csize: 3, extra },
                ],
            )
            .unwrap();
            save(&path, &index).unwrap();
            assert_eq!(load(&path, format, 100).unwrap(), index);
        }
    }

    #[test]
    fn truncated_sidecar_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.blockIdx");
        save(&path, &gzip_index()).unwrap();
        let bytes = fs::read(&path).unwrap();
        // Drop the sentinel and part of the last dictionary.
        fs::write(&path, &bytes[..bytes.len() - 100]).unwrap();
        assert!(matches!(load(&path, Format::Gzip, 1 << 20), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn sidecar_past_end_of_source_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.blockIdx");
        save(&path, &gzip_index()).unwrap();
        assert!(matches!(load(&path, Format::Gzip, 1_000), Err(Error::CorruptIndex(_))));
    }

    #[test]
    fn missing_sidecar_is_io() {
        let dir = tempdir().unwrap();
        assert!(matches!(load(&dir.path().join("nope"), Format::Xz, 0), Err(Error::Io { .. })));
    }

    #[test]
    fn sidecar_name() {
        assert_eq!(sidecar_path(Path::new("/a/b.gz"), DEFAULT_SUFFIX), PathBuf::from("/a/b.gz.blockIdx"));
    }
}
