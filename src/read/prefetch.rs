use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::PinnedObject;
use crate::blocks::{BlockCache, BlockRef, BlockRequest};
use crate::workers::Priority;
use crate::Result;

/// Sequential reader backed by the block cache.
///
/// Keeps a sliding window of upcoming blocks scheduled: the block under the
/// current offset at urgent priority, the rest as readahead. The window
/// doubles on every sequential read up to its ceiling and snaps back to the
/// start size whenever the reader is rebuilt. Readahead never waits for pool
/// capacity; when every buffer is pinned the window simply stays short.
pub struct PrefetchReader {
    object: PinnedObject,
    cache: Arc<BlockCache>,
    window: u64,
    max_window: u64,
    held: BTreeMap<u64, BlockRef>,
}

impl PrefetchReader {
    pub fn new(
        object: PinnedObject,
        cache: Arc<BlockCache>,
        start_window: u64,
        max_window: u64,
    ) -> Self {
        Self {
            object,
            cache,
            window: start_window.clamp(1, max_window.max(1)),
            max_window: max_window.max(1),
            held: BTreeMap::new(),
        }
    }

    /// Blocks currently held by this handle.
    pub fn held_blocks(&self) -> usize {
        self.held.len()
    }

    pub async fn read_at(
        &mut self,
        offset: u64,
        len: usize,
        sequential: bool,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let block_size = self.cache.block_size() as u64;
        let end = offset + len as u64;
        let mut out = BytesMut::with_capacity(len);
        let mut pos = offset;

        while pos < end {
            let index = pos / block_size;
            self.slide_window(index, cancel).await?;

            let block = self
                .held
                .get(&index)
                .expect("slide_window pins the current block");
            block.wait_ready(cancel).await?;

            let offset_in_block = (pos - index * block_size) as usize;
            let want = ((end - pos) as usize).min((block.range().limit - pos) as usize);
            let chunk = block.bytes(offset_in_block, want)?;
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len() as u64;
            out.extend_from_slice(&chunk);

            if pos >= block.range().limit {
                // Consumed the block; release it so the window slides.
                self.held.remove(&index);
            }
        }

        if sequential {
            self.window = (self.window * 2).min(self.max_window);
        }
        Ok(out.freeze())
    }

    /// Pins the block under `current` (waiting for pool capacity if it has
    /// to) and opportunistically schedules the rest of the window. Blocks
    /// that fell behind the offset are released.
    async fn slide_window(&mut self, current: u64, cancel: &CancellationToken) -> Result<()> {
        self.held.retain(|&index, _| index >= current);

        if !self.held.contains_key(&current) {
            let req = self.request(current);
            let block = self
                .cache
                .get_or_schedule(&req, Priority::Urgent, cancel)
                .await?;
            self.held.insert(current, block);
        }

        let last_block = match self.object.size {
            0 => return Ok(()),
            size => (size - 1) / self.cache.block_size() as u64,
        };
        let horizon = current
            .saturating_add(self.window)
            .min(last_block.saturating_add(1));
        for index in current + 1..horizon {
            if self.held.contains_key(&index) {
                continue;
            }
            match self
                .cache
                .try_get_or_schedule(&self.request(index), Priority::Normal)
            {
                Some(block) => {
                    self.held.insert(index, block);
                }
                None => {
                    trace!(object = %self.object.name, index, "pool exhausted, readahead truncated");
                    break;
                }
            }
        }
        Ok(())
    }

    fn request(&self, index: u64) -> BlockRequest {
        BlockRequest {
            name: self.object.name.clone(),
            generation: self.object.generation,
            index,
            object_size: self.object.size,
        }
    }

    /// Drops every held block. Downloads nobody else subscribed to are
    /// cancelled by the cache when the last reference goes.
    pub fn close(&mut self) {
        self.held.clear();
    }
}

impl Drop for PrefetchReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BufferPool;
    use crate::bucket::MemoryBucket;
    use crate::workers::WorkerPool;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn setup(
        data: &[u8],
        block_size: usize,
        capacity: usize,
    ) -> (MemoryBucket, Arc<BlockCache>, PinnedObject) {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("obj", data.to_vec()).await;
        let cache = Arc::new(BlockCache::new(
            Arc::new(bucket.clone()),
            Arc::new(BufferPool::new(block_size, capacity)),
            Arc::new(WorkerPool::new(4)),
        ));
        let object = PinnedObject {
            name: record.name,
            generation: record.generation,
            size: record.size,
        };
        (bucket, cache, object)
    }

    #[tokio::test]
    async fn reads_cross_block_boundaries() {
        let data = content(10_000);
        let (_bucket, cache, object) = setup(&data, 1024, 16).await;
        let mut reader = PrefetchReader::new(object, cache, 2, 8);
        let cancel = CancellationToken::new();

        let bytes = reader
            .read_at(1000, 2100, true, &cancel)
            .await
            .expect("read");
        assert_eq!(&bytes[..], &data[1000..3100]);
    }

    #[tokio::test]
    async fn window_doubles_up_to_the_ceiling() {
        let data = content(64 * 1024);
        let (_bucket, cache, object) = setup(&data, 1024, 64).await;
        let mut reader = PrefetchReader::new(object, cache, 2, 8);
        let cancel = CancellationToken::new();

        let mut offset = 0u64;
        for _ in 0..5 {
            reader
                .read_at(offset, 512, true, &cancel)
                .await
                .expect("read");
            offset += 512;
        }
        assert_eq!(reader.window, 8);
    }

    #[tokio::test]
    async fn close_releases_every_block() {
        let data = content(32 * 1024);
        let (_bucket, cache, object) = setup(&data, 1024, 64).await;
        let mut reader = PrefetchReader::new(object, cache.clone(), 4, 8);
        let cancel = CancellationToken::new();

        reader.read_at(0, 512, true, &cancel).await.expect("read");
        assert!(reader.held_blocks() > 0);

        reader.close();
        assert_eq!(reader.held_blocks(), 0);
    }

    #[tokio::test]
    async fn readahead_skips_when_pool_is_full() {
        let data = content(16 * 1024);
        // Pool of one buffer: the current block fits, readahead does not.
        let (bucket, cache, object) = setup(&data, 1024, 1).await;
        let mut reader = PrefetchReader::new(object, cache, 4, 8);
        let cancel = CancellationToken::new();

        let bytes = reader.read_at(0, 512, true, &cancel).await.expect("read");
        assert_eq!(&bytes[..], &data[..512]);
        assert_eq!(reader.held_blocks(), 1);
        assert_eq!(bucket.read_count(), 1);
    }
}
