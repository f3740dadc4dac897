//! Cache of decompressed blocks shared by every open file.
//!
//! [`WeightedLru`] bounds the cache by the total size of its buffers rather
//! than by entry count. [`BlockCache`] puts one behind a mutex and fills it
//! on demand through the worker pool.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::file::{CompressedFile, FileId};
use crate::workers::WorkerPool;

/// A decompressed block, shared between the cache and readers.
pub type BlockData = Arc<[u8]>;

/// Receives `(block position, data)` for every requested block.
pub type BlockCallback = Arc<dyn Fn(usize, BlockData) + Send + Sync>;

/// Returned when an entry alone is heavier than the whole cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("entry of {weight} bytes exceeds cache capacity of {max_weight} bytes")]
pub struct OverWeight {
    pub weight: usize,
    pub max_weight: usize,
}

/// LRU map whose capacity is a total weight.
pub struct WeightedLru<K: Hash + Eq, V> {
    map: LruCache<K, (V, usize)>,
    weight: usize,
    max_weight: usize,
}

impl<K: Hash + Eq, V> WeightedLru<K, V> {
    pub fn new(max_weight: usize) -> Self {
        Self { map: LruCache::unbounded(), weight: 0, max_weight }
    }

    /// Insert `value`, evicting least recently used entries until it fits.
    /// An existing entry under `key` is replaced.
    pub fn insert(&mut self, key: K, value: V, weight: usize) -> std::result::Result<(), OverWeight> {
        if weight > self.max_weight {
            return Err(OverWeight { weight, max_weight: self.max_weight });
        }
        if let Some((_, old)) = self.map.pop(&key) {
            self.weight -= old;
        }
        self.evict_to(self.max_weight - weight);
        self.map.put(key, (value, weight));
        self.weight += weight;
        Ok(())
    }

    /// Look up `key`, marking it most recently used.
    pub fn find(&mut self, key: &K) -> Option<&V> {
        self.map.get(key).map(|(v, _)| v)
    }

    /// Look up `key` without touching the LRU order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map.peek(key).map(|(v, _)| v)
    }

    pub fn weight(&self) -> usize {
        self.weight
    }

    pub fn max_weight(&self) -> usize {
        self.max_weight
    }

    /// Change the capacity; shrinking evicts right away.
    pub fn set_max_weight(&mut self, max_weight: usize) {
        self.max_weight = max_weight;
        self.evict_to(max_weight);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict_to(&mut self, limit: usize) {
        while self.weight > limit {
            match self.map.pop_lru() {
                Some((_, (_, w))) => self.weight -= w,
                None => break,
            }
        }
    }
}

/// Counters reported by [`BlockCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub weight: usize,
    pub max_weight: usize,
    pub entries: usize,
}

type Key = (FileId, usize);

/// Waits for a known number of jobs.
struct Countdown {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl Countdown {
    fn new(n: usize) -> Self {
        Self { remaining: Mutex::new(n), done: Condvar::new() }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.done.wait(&mut remaining);
        }
    }
}

/// Bookkeeping for one queued block job. Dropping it always releases the
/// caller, and records an error if the job never ran to completion.
struct PendingBlock {
    countdown: Arc<Countdown>,
    first_error: Arc<Mutex<Option<Error>>>,
    coff: u64,
    started: bool,
    finished: bool,
}

impl PendingBlock {
    fn fail(&self, e: Error) {
        self.first_error.lock().get_or_insert(e);
    }
}

impl Drop for PendingBlock {
    fn drop(&mut self) {
        if !self.finished {
            self.fail(if self.started {
                Error::decode(self.coff, "decompression job panicked")
            } else {
                Error::PoolClosed
            });
        }
        self.countdown.count_down();
    }
}

pub struct BlockCache {
    lru: Arc<Mutex<WeightedLru<Key, BlockData>>>,
    pool: Arc<WorkerPool>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    pub fn new(max_weight: usize, pool: Arc<WorkerPool>) -> Self {
        Self {
            lru: Arc::new(Mutex::new(WeightedLru::new(max_weight))),
            pool,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Deliver every block of `file` from position `first` up to the block
    /// holding byte `end - 1` to `callback`.
    ///
    /// Cached blocks are delivered first, in order, on the calling thread.
    /// The rest are decompressed on the pool and delivered as they finish.
    /// Returns once every block was delivered, or with the first error any
    /// job hit.
    pub fn get_blocks(&self, file: &Arc<CompressedFile>, first: usize, end: u64, callback: BlockCallback) -> Result<()> {
        let blocks = file.index().blocks();
        let mut hits = Vec::new();
        let mut misses = Vec::new();
        {
            let mut lru = self.lru.lock();
            for (pos, block) in blocks.iter().enumerate().skip(first) {
                if block.uoff >= end {
                    break;
                }
                match lru.find(&(file.id(), pos)) {
                    Some(data) => hits.push((pos, Arc::clone(data))),
                    None => misses.push(pos),
                }
            }
        }
        self.hits.fetch_add(hits.len() as u64, Ordering::Relaxed);
        self.misses.fetch_add(misses.len() as u64, Ordering::Relaxed);
        for (pos, data) in hits {
            callback(pos, data);
        }
        if misses.is_empty() {
            return Ok(());
        }

        let countdown = Arc::new(Countdown::new(misses.len()));
        let first_error = Arc::new(Mutex::new(None));
        for pos in misses {
            let pending = PendingBlock {
                countdown: Arc::clone(&countdown),
                first_error: Arc::clone(&first_error),
                coff: blocks[pos].coff,
                started: false,
                finished: false,
            };
            let file = Arc::clone(file);
            let lru = Arc::clone(&self.lru);
            let callback = Arc::clone(&callback);
            // A refused job drops `pending`, which records the failure.
            let _ = self.pool.enqueue(move || {
                let mut pending = pending;
                pending.started = true;
                match fetch(&file, pos, &lru) {
                    Ok(data) => callback(pos, data),
                    Err(e) => pending.fail(e),
                }
                pending.finished = true;
            });
        }
        countdown.wait();

        let err = first_error.lock().take();
        err.map_or(Ok(()), Err)
    }

    pub fn set_max_weight(&self, max_weight: usize) {
        self.lru.lock().set_max_weight(max_weight);
    }

    pub fn stats(&self) -> CacheStats {
        let lru = self.lru.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            weight: lru.weight(),
            max_weight: lru.max_weight(),
            entries: lru.len(),
        }
    }
}

/// Cached copy of a block, decompressing and inserting it if another job has
/// not done so in the meantime.
fn fetch(file: &CompressedFile, pos: usize, lru: &Mutex<WeightedLru<Key, BlockData>>) -> Result<BlockData> {
    let key = (file.id(), pos);
    if let Some(data) = lru.lock().find(&key) {
        return Ok(Arc::clone(data));
    }
    let data: BlockData = Arc::from(file.decompress_block(pos)?);
    if let Err(refused) = lru.lock().insert(key, Arc::clone(&data), data.len()) {
        debug!(path = %file.path().display(), block = pos, %refused, "block not cached");
    }
    Ok(data)
}
