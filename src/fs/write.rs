//! Hand-off between the write-back subsystem and the read path.
//!
//! Dirty content is staged in a temp file per handle. Reads on a dirty
//! handle are served from the stage, so a process sees its own writes before
//! they are flushed. Flushing uploads the stage with the source generation
//! as precondition; a mismatch means a third party clobbered the object, the
//! staged bytes are preserved and the error surfaces.

use std::sync::Arc;

use async_tempfile::TempFile;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, instrument};

use crate::bucket::{Bucket, CreateRequest, ObjectRecord, ReadRange};
use crate::read::PinnedObject;
use crate::{Error, Result};

pub struct WriteProxy {
    object_name: String,
    /// Generation the stage was built from, the flush precondition.
    base_generation: i64,
    file: TempFile,
    size: u64,
    dirty: bool,
}

impl WriteProxy {
    async fn empty(object_name: String, base_generation: i64) -> Result<Self> {
        let file = TempFile::new()
            .await
            .map_err(|e| Error::Io(format!("write staging: {e}")))?;
        Ok(Self {
            object_name,
            base_generation,
            file,
            size: 0,
            dirty: false,
        })
    }

    /// Stages the current content of `object` so writes land on top of it.
    #[instrument(skip(bucket), fields(object = %object.name), level = "debug")]
    pub async fn stage(bucket: &Arc<dyn Bucket>, object: &PinnedObject) -> Result<Self> {
        let mut proxy = Self::empty(object.name.clone(), object.generation).await?;
        if object.size > 0 {
            let mut stream = bucket
                .new_reader(
                    &object.name,
                    object.generation,
                    ReadRange {
                        start: 0,
                        limit: object.size,
                    },
                )
                .await?;
            while let Some(chunk) = stream.next().await {
                proxy.file.write_all(&chunk?).await?;
            }
            proxy.file.flush().await?;
            proxy.size = object.size;
        }
        Ok(proxy)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.size = self.size.max(offset + data.len() as u64);
        self.dirty = true;
        Ok(data.len())
    }

    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        if offset >= self.size {
            return Ok(Bytes::new());
        }
        let len = len.min((self.size - offset) as usize);
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    pub async fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size).await?;
        self.size = size;
        self.dirty = true;
        Ok(())
    }

    /// Uploads the staged bytes. Returns the new record, or `None` when the
    /// stage was clean and nothing happened.
    #[instrument(skip(self, bucket), fields(object = %self.object_name), level = "debug")]
    pub async fn flush(&mut self, bucket: &Arc<dyn Bucket>) -> Result<Option<ObjectRecord>> {
        if !self.dirty {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(0)).await?;
        let mut contents = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut contents).await?;

        let record = bucket
            .create_object(CreateRequest {
                name: self.object_name.clone(),
                contents: Bytes::from(contents),
                metadata: Default::default(),
                generation_precondition: Some(self.base_generation),
            })
            .await?;
        debug!(generation = record.generation, size = record.size, "flushed");

        self.base_generation = record.generation;
        self.dirty = false;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryBucket;

    fn pinned(record: &ObjectRecord) -> PinnedObject {
        PinnedObject {
            name: record.name.clone(),
            generation: record.generation,
            size: record.size,
        }
    }

    #[tokio::test]
    async fn writes_are_readable_before_flush() {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("f", &b"hello world"[..]).await;
        let bucket: Arc<dyn Bucket> = Arc::new(bucket);

        let mut proxy = WriteProxy::stage(&bucket, &pinned(&record)).await.expect("stage");
        assert!(!proxy.is_dirty());

        proxy.write_at(6, b"rust!").await.expect("write");
        assert!(proxy.is_dirty());
        assert_eq!(proxy.read_at(0, 64).await.expect("read"), "hello rust!");

        // Nothing reached the store yet.
        assert_eq!(bucket.stat_object("f").await.expect("stat").size, 11);
    }

    #[tokio::test]
    async fn flush_round_trips_and_bumps_the_generation() {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("f", &b"aaaa"[..]).await;
        let bucket: Arc<dyn Bucket> = Arc::new(bucket);

        let mut proxy = WriteProxy::stage(&bucket, &pinned(&record)).await.expect("stage");
        proxy.write_at(4, b"bbbb").await.expect("write");

        let flushed = proxy
            .flush(&bucket)
            .await
            .expect("flush")
            .expect("was dirty");
        assert!(flushed.generation > record.generation);
        assert_eq!(flushed.size, 8);

        // A clean flush is a no-op.
        assert_eq!(proxy.flush(&bucket).await.expect("flush"), None);

        // A second dirty flush preconditions on the new generation.
        proxy.write_at(0, b"c").await.expect("write");
        proxy.flush(&bucket).await.expect("flush").expect("was dirty");
    }

    #[tokio::test]
    async fn clobbered_flush_preserves_the_stage() {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("f", &b"mine"[..]).await;
        let arc: Arc<dyn Bucket> = Arc::new(bucket.clone());

        let mut proxy = WriteProxy::stage(&arc, &pinned(&record)).await.expect("stage");
        proxy.write_at(0, b"ours").await.expect("write");

        // A third party overwrites the object underneath us.
        bucket.put_object("f", &b"theirs"[..]).await;

        assert_eq!(
            proxy.flush(&arc).await,
            Err(Error::PreconditionFailed("f".into()))
        );
        assert!(proxy.is_dirty());
        assert_eq!(proxy.read_at(0, 64).await.expect("read"), "ours");
    }

    #[tokio::test]
    async fn truncate_extends_and_shrinks() {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("f", &b"123456"[..]).await;
        let bucket: Arc<dyn Bucket> = Arc::new(bucket);

        let mut proxy = WriteProxy::stage(&bucket, &pinned(&record)).await.expect("stage");
        proxy.truncate(3).await.expect("shrink");
        assert_eq!(proxy.read_at(0, 64).await.expect("read"), "123");

        proxy.truncate(5).await.expect("extend");
        assert_eq!(proxy.read_at(0, 64).await.expect("read"), &b"123\0\0"[..]);
    }
}
