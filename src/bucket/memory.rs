use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::instrument;

use super::{
    Bucket, ByteStream, CreateRequest, ListRequest, Listing, ObjectRecord, ReadRange,
    GENERATION_ABSENT,
};
use crate::{Error, Result};

/// Chunk size for ranged-read streams, small enough that tests exercise the
/// chunked read loop.
const READ_CHUNK: usize = 64 * 1024;

const DEFAULT_PAGE_SIZE: usize = 1000;

struct Stored {
    record: ObjectRecord,
    data: Bytes,
}

#[derive(Default)]
struct State {
    /// Live namespace, sorted by name so delimited listings are one range
    /// scan.
    live: BTreeMap<String, Arc<Stored>>,
    /// Bytes by (name, generation), retained after overwrite or delete so
    /// readers pinned to an old generation keep working.
    archive: HashMap<(String, i64), Bytes>,
    next_generation: i64,
}

/// In-memory [Bucket] used throughout the test suite.
///
/// Mirrors the visible semantics of a versioned object store: per-name
/// monotonic generations, create preconditions, delimited listings with
/// continuation tokens. Reads can be artificially delayed to open race
/// windows in concurrency tests.
#[derive(Clone, Default)]
pub struct MemoryBucket {
    state: Arc<RwLock<State>>,
    reads_started: Arc<AtomicU64>,
    read_delay: Arc<RwLock<Option<Duration>>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ranged reads opened so far.
    pub fn read_count(&self) -> u64 {
        self.reads_started.load(Ordering::SeqCst)
    }

    /// Delays every chunk of every subsequent ranged read.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.write() = delay;
    }

    /// Unconditionally stores an object, returning its record.
    pub async fn put_object(&self, name: &str, contents: impl Into<Bytes>) -> ObjectRecord {
        self.create_object(CreateRequest {
            name: name.to_owned(),
            contents: contents.into(),
            ..Default::default()
        })
        .await
        .expect("unconditional create cannot fail")
    }
}

#[async_trait::async_trait]
impl Bucket for MemoryBucket {
    #[instrument(skip(self), level = "debug")]
    async fn stat_object(&self, name: &str) -> Result<ObjectRecord> {
        let state = self.state.read();
        match state.live.get(name) {
            Some(stored) => Ok(stored.record.clone()),
            None => Err(Error::NotFound(name.to_owned())),
        }
    }

    #[instrument(skip(self, req), fields(prefix = %req.prefix), level = "debug")]
    async fn list_objects(&self, req: &ListRequest) -> Result<Listing> {
        let state = self.state.read();
        let page_size = req.max_results.unwrap_or(DEFAULT_PAGE_SIZE).max(1);

        let mut listing = Listing::default();
        let mut results = 0usize;
        let mut last_key: Option<&str> = None;

        let start = match &req.continuation_token {
            Some(token) => token.clone(),
            None => req.prefix.clone(),
        };

        for (name, stored) in state.live.range(start..) {
            // The token names the last key of the previous page.
            if req
                .continuation_token
                .as_deref()
                .is_some_and(|token| name.as_str() <= token)
            {
                continue;
            }
            if !name.starts_with(&req.prefix) {
                break;
            }
            if results >= page_size {
                listing.next_token = last_key.map(str::to_owned);
                return Ok(listing);
            }

            let remainder = &name[req.prefix.len()..];
            match req.delimiter.and_then(|d| remainder.find(d)) {
                Some(idx) => {
                    let collapsed = &name[..req.prefix.len() + idx + 1];
                    if listing.collapsed_prefixes.last().map(String::as_str) != Some(collapsed) {
                        listing.collapsed_prefixes.push(collapsed.to_owned());
                        results += 1;
                    }
                }
                None => {
                    listing.objects.push(stored.record.clone());
                    results += 1;
                }
            }
            last_key = Some(name);
        }

        Ok(listing)
    }

    #[instrument(skip(self), level = "debug")]
    async fn new_reader(
        &self,
        name: &str,
        generation: i64,
        range: ReadRange,
    ) -> Result<ByteStream> {
        self.reads_started.fetch_add(1, Ordering::SeqCst);

        let data = {
            let state = self.state.read();
            match state.live.get(name) {
                Some(stored) if stored.record.generation == generation => stored.data.clone(),
                _ => match state.archive.get(&(name.to_owned(), generation)) {
                    Some(data) => data.clone(),
                    None => return Err(Error::NotFound(name.to_owned())),
                },
            }
        };

        let start = (range.start as usize).min(data.len());
        let limit = (range.limit as usize).min(data.len());
        let mut window = data.slice(start..limit.max(start));
        let delay = *self.read_delay.read();

        Ok(Box::pin(async_stream::try_stream! {
            while !window.is_empty() {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let chunk = window.split_to(window.len().min(READ_CHUNK));
                yield chunk;
            }
        }))
    }

    #[instrument(skip(self, req), fields(object.name = %req.name), level = "debug")]
    async fn create_object(&self, req: CreateRequest) -> Result<ObjectRecord> {
        if req.name.is_empty() || req.name.contains('\n') {
            return Err(Error::InvalidArgument(format!(
                "invalid object name: {:?}",
                req.name
            )));
        }

        let mut state = self.state.write();

        let live_generation = state.live.get(&req.name).map(|s| s.record.generation);
        match req.generation_precondition {
            Some(GENERATION_ABSENT) if live_generation.is_some() => {
                return Err(Error::PreconditionFailed(req.name));
            }
            Some(expected) if expected != GENERATION_ABSENT && live_generation != Some(expected) => {
                return Err(Error::PreconditionFailed(req.name));
            }
            _ => {}
        }

        state.next_generation += 1;
        let record = ObjectRecord {
            name: req.name.clone(),
            generation: state.next_generation,
            size: req.contents.len() as u64,
            updated: SystemTime::now(),
            metadata: req.metadata,
        };
        state
            .archive
            .insert((req.name.clone(), record.generation), req.contents.clone());
        state.live.insert(
            req.name,
            Arc::new(Stored {
                record: record.clone(),
                data: req.contents,
            }),
        );

        Ok(record)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_object(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        match state.live.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(name.to_owned())),
        }
    }

    #[instrument(skip(self, metadata), level = "debug")]
    async fn update_object(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectRecord> {
        let mut state = self.state.write();
        match state.live.get_mut(name) {
            Some(stored) => {
                let mut record = stored.record.clone();
                record.metadata.extend(metadata);
                record.updated = SystemTime::now();
                *stored = Arc::new(Stored {
                    record: record.clone(),
                    data: stored.data.clone(),
                });
                Ok(record)
            }
            None => Err(Error::NotFound(name.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    async fn collect(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .expect("stream must not fail")
    }

    #[tokio::test]
    async fn stat_and_read() {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("dir/file", &b"hello world"[..]).await;

        let stat = bucket.stat_object("dir/file").await.expect("must exist");
        assert_eq!(stat, record);
        assert_eq!(stat.size, 11);

        let stream = bucket
            .new_reader("dir/file", record.generation, ReadRange { start: 6, limit: 11 })
            .await
            .expect("must open");
        assert_eq!(collect(stream).await, b"world");

        assert_eq!(
            bucket.stat_object("missing").await,
            Err(Error::NotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn read_past_end_is_short() {
        let bucket = MemoryBucket::new();
        let record = bucket.put_object("f", &b"abc"[..]).await;

        let stream = bucket
            .new_reader("f", record.generation, ReadRange { start: 1, limit: 100 })
            .await
            .expect("must open");
        assert_eq!(collect(stream).await, b"bc");

        let stream = bucket
            .new_reader("f", record.generation, ReadRange { start: 10, limit: 20 })
            .await
            .expect("must open");
        assert!(collect(stream).await.is_empty());
    }

    #[tokio::test]
    async fn old_generation_survives_overwrite_and_delete() {
        let bucket = MemoryBucket::new();
        let first = bucket.put_object("f", &b"old"[..]).await;
        let second = bucket.put_object("f", &b"new"[..]).await;
        assert!(second.generation > first.generation);

        let stream = bucket
            .new_reader("f", first.generation, ReadRange { start: 0, limit: 3 })
            .await
            .expect("pinned generation must stay readable");
        assert_eq!(collect(stream).await, b"old");

        bucket.delete_object("f").await.expect("must delete");
        let stream = bucket
            .new_reader("f", second.generation, ReadRange { start: 0, limit: 3 })
            .await
            .expect("pinned generation must stay readable");
        assert_eq!(collect(stream).await, b"new");
    }

    #[tokio::test]
    async fn create_preconditions() {
        let bucket = MemoryBucket::new();

        let record = bucket
            .create_object(CreateRequest {
                name: "f".into(),
                contents: Bytes::from_static(b"x"),
                generation_precondition: Some(GENERATION_ABSENT),
                ..Default::default()
            })
            .await
            .expect("fresh create must succeed");

        // A second exclusive create must fail.
        assert_eq!(
            bucket
                .create_object(CreateRequest {
                    name: "f".into(),
                    contents: Bytes::new(),
                    generation_precondition: Some(GENERATION_ABSENT),
                    ..Default::default()
                })
                .await,
            Err(Error::PreconditionFailed("f".into()))
        );

        // Conditional overwrite against the live generation succeeds once.
        bucket
            .create_object(CreateRequest {
                name: "f".into(),
                contents: Bytes::from_static(b"y"),
                generation_precondition: Some(record.generation),
                ..Default::default()
            })
            .await
            .expect("matching precondition must succeed");

        assert_eq!(
            bucket
                .create_object(CreateRequest {
                    name: "f".into(),
                    contents: Bytes::from_static(b"z"),
                    generation_precondition: Some(record.generation),
                    ..Default::default()
                })
                .await,
            Err(Error::PreconditionFailed("f".into()))
        );
    }

    #[tokio::test]
    async fn newline_in_name_rejected() {
        let bucket = MemoryBucket::new();
        assert!(matches!(
            bucket
                .create_object(CreateRequest {
                    name: "foo\n".into(),
                    ..Default::default()
                })
                .await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn delimited_listing() {
        let bucket = MemoryBucket::new();
        for name in ["a", "dir/", "dir/x", "dir/y", "dir/sub/z", "e"] {
            bucket.put_object(name, &b"."[..]).await;
        }

        let listing = bucket
            .list_objects(&ListRequest {
                prefix: String::new(),
                delimiter: Some('/'),
                ..Default::default()
            })
            .await
            .expect("must list");

        let names: Vec<_> = listing.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a", "e"]);
        assert_eq!(listing.collapsed_prefixes, vec!["dir/"]);
        assert!(listing.next_token.is_none());

        let listing = bucket
            .list_objects(&ListRequest {
                prefix: "dir/".into(),
                delimiter: Some('/'),
                ..Default::default()
            })
            .await
            .expect("must list");
        let names: Vec<_> = listing.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["dir/", "dir/x", "dir/y"]);
        assert_eq!(listing.collapsed_prefixes, vec!["dir/sub/"]);
    }

    #[tokio::test]
    async fn listing_pagination() {
        let bucket = MemoryBucket::new();
        for name in ["p/a", "p/b", "p/c", "p/d"] {
            bucket.put_object(name, &b"."[..]).await;
        }

        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let listing = bucket
                .list_objects(&ListRequest {
                    prefix: "p/".into(),
                    delimiter: Some('/'),
                    continuation_token: token.take(),
                    max_results: Some(2),
                })
                .await
                .expect("must list");
            seen.extend(listing.objects.into_iter().map(|o| o.name));
            match listing.next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(seen, vec!["p/a", "p/b", "p/c", "p/d"]);
    }
}
