use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Bounded pool of fixed-size byte buffers.
///
/// A global semaphore accounts for every buffer in circulation; its capacity
/// is the hard memory bound of the block cache. Waiters queue FIFO and can be
/// cancelled. Returned buffers go on a free list so steady-state reads do not
/// allocate.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    block_size: usize,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    freelist: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                block_size,
                capacity,
                semaphore: Arc::new(Semaphore::new(capacity)),
                freelist: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Buffers that could be acquired right now without waiting.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Waits for a buffer, FIFO with other waiters.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Buffer> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.inner.semaphore.clone().acquire_owned() => permit
                .map_err(|_| Error::ResourceExhausted("buffer pool closed".into()))?,
        };
        Ok(self.inner.new_buffer(permit))
    }

    pub fn try_acquire(&self) -> Option<Buffer> {
        let permit = self.inner.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.inner.new_buffer(permit))
    }
}

impl PoolInner {
    fn new_buffer(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Buffer {
        let data = self
            .freelist
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.block_size].into_boxed_slice());
        Buffer {
            data: Some(data),
            len: 0,
            pool: self.clone(),
            _permit: permit,
        }
    }
}

/// One pool-backed buffer. Filled front to back by a download task; the
/// backing memory returns to the pool on drop.
#[derive(Debug)]
pub struct Buffer {
    data: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Buffer {
    pub fn capacity(&self) -> usize {
        self.pool.block_size
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_deref().expect("buffer present until drop")[..self.len]
    }

    /// Appends bytes after the already-filled region.
    pub fn append(&mut self, src: &[u8]) -> Result<()> {
        let data = self.data.as_deref_mut().expect("buffer present until drop");
        if self.len + src.len() > data.len() {
            return Err(Error::Io(format!(
                "block overflow: {} + {} bytes into a {} byte buffer",
                self.len,
                src.len(),
                data.len()
            )));
        }
        data[self.len..self.len + src.len()].copy_from_slice(src);
        self.len += src.len();
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.freelist.lock().push(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capacity_is_enforced() {
        let pool = BufferPool::new(16, 2);
        let a = pool.try_acquire().expect("first buffer");
        let _b = pool.try_acquire().expect("second buffer");
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn acquire_can_be_cancelled() {
        let pool = BufferPool::new(16, 1);
        let _held = pool.try_acquire().expect("must acquire");

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(pool.acquire(&cancel).await.unwrap_err(), Error::Cancelled);
    }

    #[tokio::test]
    async fn append_fills_and_bounds() {
        let pool = BufferPool::new(4, 1);
        let mut buf = pool.try_acquire().expect("must acquire");
        buf.append(b"ab").expect("fits");
        buf.append(b"cd").expect("fits");
        assert_eq!(buf.as_slice(), b"abcd");
        assert!(buf.append(b"e").is_err());
    }
}
