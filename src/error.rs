use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `zseek` crate.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred, typically while reading a source or sidecar file.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// The file does not look like the given format. Recovered by trying the
    /// next format during detection.
    #[error("not a {format} file: {reason}")]
    Format { format: &'static str, reason: String },

    /// A sidecar index could not be used. Recovered by rebuilding the index.
    #[error("corrupt block index: {0}")]
    CorruptIndex(String),

    /// A block failed to decompress, or decompressed to the wrong size or checksum.
    #[error("decode error in block at compressed offset {coff}: {reason}")]
    Decode { coff: u64, reason: String },

    /// A lookup past the end of the uncompressed data.
    #[error("offset {offset} is out of range (uncompressed size {size})")]
    OutOfRange { offset: u64, size: u64 },

    /// A read ran past the end of the available bytes.
    #[error("unexpected end of data at offset {offset}")]
    Eof { offset: u64 },

    /// A job was submitted after the worker pool started shutting down.
    #[error("worker pool is shut down")]
    PoolClosed,

    /// None of the supported formats recognised the file.
    #[error("unrecognised compressed file '{}'", path.display())]
    UnknownFormat { path: PathBuf },
}

impl Error {
    pub(crate) fn format(format: &'static str, reason: impl Into<String>) -> Self {
        Error::Format { format, reason: reason.into() }
    }

    pub(crate) fn decode(coff: u64, reason: impl Into<String>) -> Self {
        Error::Decode { coff, reason: reason.into() }
    }

    pub(crate) fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Error::Io { source, path: path.into() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io { source: err, path: PathBuf::new() } // Generic path
    }
}

pub type Result<T> = std::result::Result<T, Error>;
