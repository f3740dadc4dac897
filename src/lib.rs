//! # zseek Core Library
//!
//! Random-access reads into the uncompressed contents of gzip, bzip2, lzop,
//! xz and zstd files without decompressing the whole file for every access.
//!
//! Each source file is split into *blocks*: byte ranges of the compressed file
//! whose output can be produced on their own (sometimes with a stored 32 KiB
//! dictionary). The list of blocks is built once per file, persisted next to it
//! as a sidecar index, and every read only decompresses the blocks it overlaps,
//! through a shared weight-bounded cache filled by a worker pool.
//!
//! ## Key Modules
//!
//! - [`format`]: per-format block discovery and single-block decompression.
//! - [`block`]: the [`Block`] record and the immutable [`BlockIndex`].
//! - [`index_store`]: sidecar persistence of block indexes.
//! - [`cache`]: weighted LRU cache of decompressed blocks.
//! - [`workers`]: the fixed-size thread pool that fills the cache.
//! - [`reader`]: positioned reads on top of everything above.
//!
//! ## Examples
//!
//! ```no_run
//! use zseek::{CompressedFile, Config, RandomAccessReader};
//!
//! let config = Config::from_env();
//! let file = CompressedFile::open("data.tar.gz", &config)?;
//! let reader = RandomAccessReader::with_config(&config)?;
//! let mut buf = vec![0u8; 4096];
//! let n = reader.read(&file, &mut buf, 1 << 20)?;
//! println!("read {n} bytes");
//! # Ok::<(), zseek::Error>(())
//! ```

pub mod bits;
pub mod block;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod file;
pub mod format;
pub mod index_store;
pub mod io;
pub mod reader;
pub mod workers;

pub use block::{Block, BlockExtra, BlockIndex};
pub use cache::{BlockCache, BlockData, CacheStats, WeightedLru};
pub use config::Config;
pub use error::{Error, Result};
pub use file::{CompressedFile, FileId};
pub use format::{Format, FormatIndexer};
pub use reader::RandomAccessReader;
pub use workers::WorkerPool;
