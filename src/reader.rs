//! Positioned reads of uncompressed data.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{BlockCache, BlockData};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::file::CompressedFile;
use crate::workers::WorkerPool;

pub struct RandomAccessReader {
    cache: BlockCache,
}

impl RandomAccessReader {
    pub fn new(cache: BlockCache) -> Self {
        Self { cache }
    }

    /// A reader with its own worker pool and cache sized from `config`.
    pub fn with_config(config: &Config) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new(config.threads)?);
        Ok(Self::new(BlockCache::new(config.cache_size, pool)))
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Read up to `buf.len()` uncompressed bytes of `file` starting at
    /// `offset`. Returns the number of bytes read, which is only short at the
    /// end of the data and 0 at or past it.
    pub fn read(&self, file: &Arc<CompressedFile>, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = file.uncompressed_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        let end = offset + len as u64;
        let first = file.index().find_block(offset)?;

        let received: Arc<Mutex<Vec<(usize, BlockData)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        self.cache.get_blocks(file, first, end, Arc::new(move |pos: usize, data: BlockData| sink.lock().push((pos, data))))?;

        let received = std::mem::take(&mut *received.lock());
        for (pos, data) in received {
            let block = file.block(pos)?;
            if data.len() != block.usize as usize {
                return Err(Error::decode(
                    block.coff,
                    format!("cached block holds {} bytes, expected {}", data.len(), block.usize),
                ));
            }
            let from = offset.max(block.uoff);
            let to = end.min(block.uend());
            if from >= to {
                continue;
            }
            let src = &data[(from - block.uoff) as usize..(to - block.uoff) as usize];
            buf[(from - offset) as usize..(to - offset) as usize].copy_from_slice(src);
        }
        Ok(len)
    }
}
