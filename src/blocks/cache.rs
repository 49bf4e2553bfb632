use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pool::{Buffer, BufferPool};
use super::{Block, BlockState, CacheKey, DownloadCounts, DownloadStats};
use crate::bucket::{Bucket, ReadRange};
use crate::workers::{Priority, WorkerPool};
use crate::{Error, Result};

/// How long a failed block keeps coalescing duplicate failures before it is
/// eligible for re-download.
const FAILED_BLOCK_TTL: Duration = Duration::from_secs(1);

/// A block the cache should produce: one `block_size` slice of an object at
/// a pinned generation.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub name: String,
    pub generation: i64,
    pub index: u64,
    pub object_size: u64,
}

impl BlockRequest {
    fn key(&self) -> CacheKey {
        CacheKey {
            name: self.name.clone(),
            generation: self.generation,
            index: self.index,
        }
    }

    fn range(&self, block_size: u64) -> ReadRange {
        let start = self.index * block_size;
        ReadRange {
            start,
            limit: (start + block_size).min(self.object_size),
        }
    }
}

struct CacheInner {
    blocks: HashMap<CacheKey, Arc<Block>>,
    /// Refcount-zero Ready/Failed blocks in eviction order.
    idle: LruCache<CacheKey, ()>,
}

/// Block cache and download manager.
///
/// For any [CacheKey] at most one block exists and at most one download task
/// is in flight; concurrent requesters share the block and await the same
/// completion signal. Memory is bounded by the [BufferPool]: when no buffer
/// is free, idle blocks are evicted LRU-first, and if everything is pinned
/// the requester queues on the pool semaphore.
pub struct BlockCache {
    bucket: Arc<dyn Bucket>,
    pool: Arc<BufferPool>,
    workers: Arc<WorkerPool>,
    inner: Mutex<CacheInner>,
    stats: Arc<DownloadStats>,
}

impl BlockCache {
    pub fn new(bucket: Arc<dyn Bucket>, pool: Arc<BufferPool>, workers: Arc<WorkerPool>) -> Self {
        Self {
            bucket,
            pool,
            workers,
            inner: Mutex::new(CacheInner {
                blocks: HashMap::new(),
                idle: LruCache::unbounded(),
            }),
            stats: Arc::new(DownloadStats::default()),
        }
    }

    pub fn download_counts(&self) -> DownloadCounts {
        self.stats.snapshot()
    }

    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Number of blocks currently resident, any state.
    pub fn resident(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    /// Returns a reference to the block for `req`, scheduling a download if
    /// none is resident. The returned [BlockRef] may still be downloading;
    /// await [BlockRef::wait_ready] before slicing bytes out of it.
    pub async fn get_or_schedule(
        self: &Arc<Self>,
        req: &BlockRequest,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<BlockRef> {
        let key = req.key();
        let range = req.range(self.pool.block_size() as u64);

        loop {
            let to_schedule = {
                let mut inner = self.inner.lock();

                if let Some(existing) = inner.blocks.get(&key).cloned() {
                    let expired = matches!(existing.state(), BlockState::Failed(_))
                        && existing.refcount.load(Ordering::SeqCst) == 0
                        && existing
                            .failed_since()
                            .is_some_and(|at| at.elapsed() >= FAILED_BLOCK_TTL);
                    if expired {
                        inner.blocks.remove(&key);
                        inner.idle.pop(&key);
                        drop(existing.reclaim_buffer());
                    } else {
                        if existing.refcount.fetch_add(1, Ordering::SeqCst) == 0 {
                            inner.idle.pop(&key);
                        }
                        return Ok(BlockRef {
                            block: existing,
                            cache: self.clone(),
                        });
                    }
                }

                match self.try_allocate(&mut inner) {
                    Some(buf) => Some(self.insert(&mut inner, key.clone(), range, buf)),
                    None => None,
                }
            };

            if let Some(block) = to_schedule {
                self.schedule_download(&block, priority);
                return Ok(BlockRef {
                    block,
                    cache: self.clone(),
                });
            }

            // Every buffer is pinned; wait our turn on the pool, then
            // re-check in case another caller inserted the same key.
            let buf = self.pool.acquire(cancel).await?;
            let inserted = {
                let mut inner = self.inner.lock();
                if inner.blocks.contains_key(&key) {
                    drop(buf);
                    None
                } else {
                    Some(self.insert(&mut inner, key.clone(), range, buf))
                }
            };
            if let Some(block) = inserted {
                self.schedule_download(&block, priority);
                return Ok(BlockRef {
                    block,
                    cache: self.clone(),
                });
            }
        }
    }

    /// Like [Self::get_or_schedule] but never waits for a buffer: when the
    /// pool has no free capacity the request is simply not scheduled.
    /// Used for readahead, which must not stall the read it runs ahead of.
    pub fn try_get_or_schedule(
        self: &Arc<Self>,
        req: &BlockRequest,
        priority: Priority,
    ) -> Option<BlockRef> {
        let key = req.key();
        let range = req.range(self.pool.block_size() as u64);

        let (block, schedule) = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.blocks.get(&key).cloned() {
                if existing.refcount.fetch_add(1, Ordering::SeqCst) == 0 {
                    inner.idle.pop(&key);
                }
                (existing, false)
            } else {
                let buf = self.try_allocate(&mut inner)?;
                (self.insert(&mut inner, key, range, buf), true)
            }
        };
        if schedule {
            self.schedule_download(&block, priority);
        }
        Some(BlockRef {
            block,
            cache: self.clone(),
        })
    }

    /// Cancels the in-flight download for `key`, provided nobody holds a
    /// reference to the block.
    pub fn cancel(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(block) = inner.blocks.get(key).cloned() {
            if matches!(block.state(), BlockState::Downloading)
                && block.refcount.load(Ordering::SeqCst) == 0
            {
                block.cancel.cancel();
                inner.blocks.remove(key);
                inner.idle.pop(key);
            }
        }
    }

    /// Tries to produce a buffer without waiting, evicting idle blocks
    /// LRU-first until one frees up.
    fn try_allocate(&self, inner: &mut CacheInner) -> Option<Buffer> {
        if let Some(buf) = self.pool.try_acquire() {
            return Some(buf);
        }
        while let Some((victim, ())) = inner.idle.pop_lru() {
            if let Some(block) = inner.blocks.remove(&victim) {
                debug!(block = %victim, "evicting idle block");
                drop(block.reclaim_buffer());
            }
            if let Some(buf) = self.pool.try_acquire() {
                return Some(buf);
            }
        }
        None
    }

    fn insert(
        &self,
        inner: &mut CacheInner,
        key: CacheKey,
        range: ReadRange,
        buf: Buffer,
    ) -> Arc<Block> {
        let block = Arc::new(Block::new(key.clone(), range, buf));
        block.refcount.store(1, Ordering::SeqCst);
        inner.blocks.insert(key, block.clone());
        block
    }

    fn schedule_download(&self, block: &Arc<Block>, priority: Priority) {
        self.stats.record_started();
        let bucket = self.bucket.clone();
        let stats = self.stats.clone();
        let block = block.clone();
        let cancel = block.cancel.clone();

        let fut = async move {
            let started = Instant::now();
            let result = download(bucket, &block).await;
            let outcome = match &result {
                Ok(()) => "successful",
                Err(Error::Cancelled) => "cancelled",
                Err(_) => "failed",
            };
            stats.record_outcome(outcome);
            debug!(
                block = %block.key,
                latency_ms = started.elapsed().as_millis() as u64,
                outcome,
                "block download finished"
            );
            match result {
                Ok(()) => block.set_state(BlockState::Ready),
                Err(e) => block.set_state(BlockState::Failed(e)),
            }
        }
        .boxed();

        self.workers.submit(priority, cancel, fut);
    }

    fn release(&self, block: &Arc<Block>) {
        let mut inner = self.inner.lock();
        let prev = block.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "block released more often than acquired");
        if prev != 1 {
            return;
        }
        match block.state() {
            BlockState::Downloading => {
                // Last holder walked away mid-download: cancel it and forget
                // the block. Its buffer returns to the pool when the task
                // observes the signal and drops its reference.
                block.cancel.cancel();
                inner.blocks.remove(block.key());
                inner.idle.pop(block.key());
            }
            BlockState::Ready | BlockState::Failed(_) => {
                if inner.blocks.contains_key(block.key()) {
                    inner.idle.put(block.key().clone(), ());
                }
            }
        }
    }
}

/// Fills the block's buffer from a ranged read at the pinned generation,
/// observing cancellation between chunks.
async fn download(bucket: Arc<dyn Bucket>, block: &Arc<Block>) -> Result<()> {
    let cancel = block.cancel.clone();
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        reader = bucket.new_reader(&block.key.name, block.key.generation, block.range) => reader?,
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => block.append(&bytes)?,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
    }

    let filled = block.filled() as u64;
    if filled < block.range.len() {
        return Err(Error::Io(format!(
            "short read on {}: got {} of {} bytes",
            block.key,
            filled,
            block.range.len()
        )));
    }
    Ok(())
}

/// Counted reference to a cached block. Dropping it releases the block; the
/// last holder of a still-downloading block cancels the download.
pub struct BlockRef {
    block: Arc<Block>,
    cache: Arc<BlockCache>,
}

impl BlockRef {
    pub fn key(&self) -> &CacheKey {
        self.block.key()
    }

    pub fn state(&self) -> BlockState {
        self.block.state()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.block.state(), BlockState::Ready)
    }

    /// Object byte range the block covers.
    pub fn range(&self) -> ReadRange {
        self.block.range()
    }

    /// Resolves once the download completes; `Err` carries the download
    /// failure, or [Error::Cancelled] if `cancel` fires first. A cancelled
    /// wait does not by itself cancel the download; that happens when the
    /// last reference is dropped.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.block.state.subscribe();
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            changed = rx.wait_for(|s| !matches!(s, BlockState::Downloading)) => match changed {
                Ok(state) => (*state).clone(),
                Err(_) => BlockState::Failed(Error::Cancelled),
            },
        };
        match state {
            BlockState::Ready => Ok(()),
            BlockState::Failed(e) => Err(e),
            BlockState::Downloading => unreachable!("wait_for filtered Downloading"),
        }
    }

    /// Copies bytes out of the block, `offset` relative to the block start.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<bytes::Bytes> {
        self.block.bytes(offset, len)
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        self.cache.release(&self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryBucket;

    fn request(name: &str, generation: i64, index: u64, object_size: u64) -> BlockRequest {
        BlockRequest {
            name: name.into(),
            generation,
            index,
            object_size,
        }
    }

    fn cache_with(
        bucket: &MemoryBucket,
        block_size: usize,
        capacity: usize,
    ) -> Arc<BlockCache> {
        Arc::new(BlockCache::new(
            Arc::new(bucket.clone()),
            Arc::new(BufferPool::new(block_size, capacity)),
            Arc::new(WorkerPool::new(4)),
        ))
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_download() {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("obj", vec![7u8; 4096]).await;
        bucket.set_read_delay(Some(Duration::from_millis(20)));

        let cache = cache_with(&bucket, 1024, 4);
        let req = request("obj", record.generation, 2, 4096);
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            {
                let cache = cache.clone();
                let req = req.clone();
                let cancel = cancel.clone();
                async move {
                    let block = cache.get_or_schedule(&req, Priority::Urgent, &cancel).await?;
                    block.wait_ready(&cancel).await?;
                    block.bytes(0, 1024)
                }
            },
            {
                let cache = cache.clone();
                let req = req.clone();
                let cancel = cancel.clone();
                async move {
                    let block = cache.get_or_schedule(&req, Priority::Urgent, &cancel).await?;
                    block.wait_ready(&cancel).await?;
                    block.bytes(0, 1024)
                }
            }
        );

        let (a, b) = (a.expect("read a"), b.expect("read b"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 1024);
        assert_eq!(bucket.read_count(), 1);
        assert_eq!(cache.download_counts().successful, 1);
    }

    #[tokio::test]
    async fn idle_blocks_are_evicted_lru_first() {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("obj", vec![1u8; 4096]).await;

        let cache = cache_with(&bucket, 1024, 2);
        let cancel = CancellationToken::new();

        for index in 0..2u64 {
            let block = cache
                .get_or_schedule(
                    &request("obj", record.generation, index, 4096),
                    Priority::Urgent,
                    &cancel,
                )
                .await
                .expect("schedule");
            block.wait_ready(&cancel).await.expect("download");
        }
        assert_eq!(cache.resident(), 2);

        // Both blocks idle now; a third request must evict block 0.
        let block = cache
            .get_or_schedule(
                &request("obj", record.generation, 2, 4096),
                Priority::Urgent,
                &cancel,
            )
            .await
            .expect("schedule");
        block.wait_ready(&cancel).await.expect("download");

        assert_eq!(cache.resident(), 2);
        assert_eq!(bucket.read_count(), 3);

        // Block 1 survived the eviction and serves without a new download.
        let block = cache
            .get_or_schedule(
                &request("obj", record.generation, 1, 4096),
                Priority::Urgent,
                &cancel,
            )
            .await
            .expect("schedule");
        assert!(block.is_ready());
        assert_eq!(bucket.read_count(), 3);
    }

    #[tokio::test]
    async fn failed_download_is_coalesced_then_retried() {
        let bucket = MemoryBucket::new();
        let cache = cache_with(&bucket, 1024, 2);
        let cancel = CancellationToken::new();
        let req = request("missing", 1, 0, 1024);

        let block = cache
            .get_or_schedule(&req, Priority::Urgent, &cancel)
            .await
            .expect("schedule");
        assert!(matches!(
            block.wait_ready(&cancel).await,
            Err(Error::NotFound(_))
        ));
        drop(block);
        assert_eq!(bucket.read_count(), 1);

        // Within the retention window the failure is served from cache.
        let block = cache
            .get_or_schedule(&req, Priority::Urgent, &cancel)
            .await
            .expect("schedule");
        assert!(matches!(
            block.wait_ready(&cancel).await,
            Err(Error::NotFound(_))
        ));
        drop(block);
        assert_eq!(bucket.read_count(), 1);

        // Past the window the block is evicted and re-downloaded.
        tokio::time::sleep(FAILED_BLOCK_TTL + Duration::from_millis(100)).await;
        let block = cache
            .get_or_schedule(&req, Priority::Urgent, &cancel)
            .await
            .expect("schedule");
        let _ = block.wait_ready(&cancel).await;
        assert_eq!(bucket.read_count(), 2);
    }

    #[tokio::test]
    async fn dropping_the_last_reference_cancels_the_download() {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("obj", vec![2u8; 65536 * 4]).await;
        bucket.set_read_delay(Some(Duration::from_millis(50)));

        let cache = cache_with(&bucket, 65536 * 4, 2);
        let cancel = CancellationToken::new();

        let block = cache
            .get_or_schedule(
                &request("obj", record.generation, 0, 65536 * 4),
                Priority::Urgent,
                &cancel,
            )
            .await
            .expect("schedule");
        drop(block);

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.download_counts().cancelled == 0 {
            assert!(Instant::now() < deadline, "download was never cancelled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.resident(), 0);
    }
}
