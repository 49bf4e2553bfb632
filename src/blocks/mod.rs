//! Blocks: fixed-size byte ranges of one object at one generation.
//!
//! A block's identity is its [CacheKey]; the generation participates so an
//! overwrite of the backing object can never alias old bytes. Blocks are
//! filled by download tasks on the worker pool and handed to readers through
//! the [cache::BlockCache].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bucket::ReadRange;
use crate::{Error, Result};

mod cache;
pub mod pool;

pub use cache::{BlockCache, BlockRef, BlockRequest};
pub use pool::{Buffer, BufferPool};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub name: String,
    pub generation: i64,
    pub index: u64,
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.name, self.generation, self.index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockState {
    Downloading,
    Ready,
    Failed(Error),
}

/// One cached block. The buffer is written by exactly one download task and
/// becomes readable once the state is [BlockState::Ready].
pub struct Block {
    key: CacheKey,
    /// Object byte range this block covers.
    range: ReadRange,
    buf: Mutex<Option<Buffer>>,
    state: watch::Sender<BlockState>,
    /// Holders of a [BlockRef] to this block. Mutated only under the cache
    /// lock; atomic so state can be observed without it.
    refcount: AtomicU32,
    /// Cooperative cancel signal for the download task.
    cancel: CancellationToken,
    failed_at: Mutex<Option<Instant>>,
}

impl Block {
    fn new(key: CacheKey, range: ReadRange, buf: Buffer) -> Self {
        let (state, _) = watch::channel(BlockState::Downloading);
        Self {
            key,
            range,
            buf: Mutex::new(Some(buf)),
            state,
            refcount: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            failed_at: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Object byte range covered by this block.
    pub fn range(&self) -> ReadRange {
        self.range
    }

    pub fn state(&self) -> BlockState {
        self.state.borrow().clone()
    }

    fn set_state(&self, new: BlockState) {
        if matches!(new, BlockState::Failed(ref e) if *e != Error::Cancelled) {
            *self.failed_at.lock() = Some(Instant::now());
        }
        self.state.send_replace(new);
    }

    fn failed_since(&self) -> Option<Instant> {
        *self.failed_at.lock()
    }

    /// Bytes filled so far.
    fn filled(&self) -> usize {
        self.buf.lock().as_ref().map_or(0, Buffer::len)
    }

    fn append(&self, src: &[u8]) -> Result<()> {
        let mut guard = self.buf.lock();
        match guard.as_mut() {
            Some(buf) => buf.append(src),
            None => Err(Error::Cancelled),
        }
    }

    /// Copies `len` bytes starting `offset` into the block. Requires the
    /// block to be [BlockState::Ready]; the result is clamped to the filled
    /// length.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<Bytes> {
        match self.state() {
            BlockState::Ready => {}
            BlockState::Failed(e) => return Err(e),
            BlockState::Downloading => {
                return Err(Error::Io(format!("block {} still downloading", self.key)))
            }
        }
        let guard = self.buf.lock();
        let data = guard
            .as_ref()
            .ok_or_else(|| Error::Io(format!("block {} evicted", self.key)))?
            .as_slice();
        let start = offset.min(data.len());
        let end = (offset + len).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    /// Takes the buffer back out of the block, releasing its pool permit
    /// once dropped. Called by the cache on eviction.
    fn reclaim_buffer(&self) -> Option<Buffer> {
        self.buf.lock().take()
    }
}

/// Download outcome counters, the metrics surface the core owns.
#[derive(Default)]
pub struct DownloadStats {
    started: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadCounts {
    pub started: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl DownloadStats {
    fn record_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn record_outcome(&self, outcome: &str) {
        let counter = match outcome {
            "successful" => &self.successful,
            "cancelled" => &self.cancelled,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> DownloadCounts {
        DownloadCounts {
            started: self.started.load(Ordering::SeqCst),
            successful: self.successful.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }
}
