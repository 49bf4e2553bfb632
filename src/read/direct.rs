use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::PinnedObject;
use crate::bucket::{Bucket, ReadRange};
use crate::{Error, Result};

/// Random-access reader: every read is one uncached ranged read against the
/// pinned generation. Cancellation is observed between chunks.
pub struct DirectReader {
    object: PinnedObject,
    bucket: Arc<dyn Bucket>,
}

impl DirectReader {
    pub fn new(object: PinnedObject, bucket: Arc<dyn Bucket>) -> Self {
        Self { object, bucket }
    }

    pub async fn read_at(
        &mut self,
        offset: u64,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let range = ReadRange {
            start: offset,
            limit: (offset + len as u64).min(self.object.size),
        };
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            reader = self
                .bucket
                .new_reader(&self.object.name, self.object.generation, range) => reader?,
        };

        let mut out = BytesMut::with_capacity(range.len() as usize);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => out.extend_from_slice(&bytes),
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                }
            }
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryBucket;

    #[tokio::test]
    async fn ranged_reads_are_uncached() {
        let bucket = MemoryBucket::new();
        let data: Vec<u8> = (0..200_000).map(|i| (i % 256) as u8).collect();
        let record = bucket.put_object("obj", data.clone()).await;

        let mut reader = DirectReader::new(
            PinnedObject {
                name: record.name,
                generation: record.generation,
                size: record.size,
            },
            Arc::new(bucket.clone()),
        );
        let cancel = CancellationToken::new();

        let bytes = reader.read_at(100, 1000, &cancel).await.expect("read");
        assert_eq!(&bytes[..], &data[100..1100]);

        let bytes = reader.read_at(100, 1000, &cancel).await.expect("read");
        assert_eq!(&bytes[..], &data[100..1100]);
        assert_eq!(bucket.read_count(), 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_read() {
        let bucket = MemoryBucket::new();
        let record = bucket
            .put_object("obj", vec![0u8; 512 * 1024])
            .await;
        bucket.set_read_delay(Some(std::time::Duration::from_millis(50)));

        let mut reader = DirectReader::new(
            PinnedObject {
                name: record.name,
                generation: record.generation,
                size: record.size,
            },
            Arc::new(bucket),
        );

        let cancel = CancellationToken::new();
        let caller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            caller.cancel();
        });

        assert_eq!(
            reader.read_at(0, 512 * 1024, &cancel).await,
            Err(Error::Cancelled)
        );
    }
}
