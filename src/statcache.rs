//! TTL-bounded metadata caches.
//!
//! [CachedBucket] wraps any [Bucket] and absorbs repeated stats, including
//! negative ones, to ride out the store's list-after-write lag. Writes from
//! this process update the cache synchronously, so intra-process visibility
//! never waits on a TTL. External mutations become visible as entries age
//! out.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::instrument;

use crate::bucket::{
    Bucket, ByteStream, CreateRequest, ListRequest, Listing, ObjectRecord, ReadRange,
};
use crate::listing::Child;
use crate::{Error, Result};

struct StatEntry {
    expires_at: Instant,
    /// `None` caches a confirmed miss.
    record: Option<ObjectRecord>,
}

/// Stat-caching decorator over a [Bucket].
pub struct CachedBucket {
    inner: Arc<dyn Bucket>,
    ttl: Duration,
    stats: Mutex<LruCache<String, StatEntry>>,
}

impl CachedBucket {
    pub fn new(inner: Arc<dyn Bucket>, capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            stats: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cached(&self, name: &str) -> Option<Option<ObjectRecord>> {
        let mut stats = self.stats.lock();
        match stats.get(name) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.record.clone()),
            Some(_) => {
                stats.pop(name);
                None
            }
            None => None,
        }
    }

    fn remember(&self, name: String, record: Option<ObjectRecord>) {
        self.stats.lock().put(
            name,
            StatEntry {
                expires_at: Instant::now() + self.ttl,
                record,
            },
        );
    }

    fn forget(&self, name: &str) {
        self.stats.lock().pop(name);
    }

    /// Drops cached misses shadowing `name`: the name itself and every
    /// parent directory name above it. A fresh object can turn any of those
    /// prefixes into an implicit directory.
    fn forget_negatives_above(&self, name: &str) {
        let mut stats = self.stats.lock();
        let stale: Vec<String> = stats
            .iter()
            .filter(|(key, entry)| entry.record.is_none() && name.starts_with(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            stats.pop(&key);
        }
    }
}

#[async_trait::async_trait]
impl Bucket for CachedBucket {
    #[instrument(skip(self), level = "debug")]
    async fn stat_object(&self, name: &str) -> Result<ObjectRecord> {
        if let Some(cached) = self.cached(name) {
            return match cached {
                Some(record) => Ok(record),
                None => Err(Error::NotFound(name.to_owned())),
            };
        }
        match self.inner.stat_object(name).await {
            Ok(record) => {
                self.remember(name.to_owned(), Some(record.clone()));
                Ok(record)
            }
            Err(Error::NotFound(_)) => {
                self.remember(name.to_owned(), None);
                Err(Error::NotFound(name.to_owned()))
            }
            Err(e) => Err(e),
        }
    }

    async fn list_objects(&self, req: &ListRequest) -> Result<Listing> {
        let listing = self.inner.list_objects(req).await?;
        // Listings come with full records; seed the cache so the follow-up
        // stats that readdir tends to trigger are free.
        for record in &listing.objects {
            self.remember(record.name.clone(), Some(record.clone()));
        }
        Ok(listing)
    }

    async fn new_reader(
        &self,
        name: &str,
        generation: i64,
        range: ReadRange,
    ) -> Result<ByteStream> {
        self.inner.new_reader(name, generation, range).await
    }

    async fn create_object(&self, req: CreateRequest) -> Result<ObjectRecord> {
        let record = self.inner.create_object(req).await?;
        self.forget_negatives_above(&record.name);
        self.remember(record.name.clone(), Some(record.clone()));
        Ok(record)
    }

    async fn delete_object(&self, name: &str) -> Result<()> {
        let result = self.inner.delete_object(name).await;
        match &result {
            Ok(()) => self.remember(name.to_owned(), None),
            Err(_) => self.forget(name),
        }
        result
    }

    async fn update_object(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectRecord> {
        let record = self.inner.update_object(name, metadata).await?;
        self.remember(name.to_owned(), Some(record.clone()));
        Ok(record)
    }
}

/// Remembers how a child name last resolved (dir, file, or symlink), so
/// repeated lookups of hot names skip the stat-plus-list dance entirely.
pub struct TypeCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, (Instant, Child)>>,
}

impl TypeCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// `key` is the qualified bare name (no trailing slash, no suffix).
    pub fn get(&self, key: &str) -> Option<Child> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((expires_at, child)) if *expires_at > Instant::now() => Some(child.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, child: Child) {
        self.entries
            .lock()
            .put(key, (Instant::now() + self.ttl, child));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().pop(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryBucket;
    use bytes::Bytes;

    fn cached(bucket: &MemoryBucket, ttl: Duration) -> CachedBucket {
        CachedBucket::new(
            Arc::new(bucket.clone()),
            NonZeroUsize::new(128).expect("nonzero"),
            ttl,
        )
    }

    #[tokio::test]
    async fn positive_and_negative_hits() {
        let bucket = MemoryBucket::new();
        bucket.put_object("present", &b"x"[..]).await;
        let cached = cached(&bucket, Duration::from_secs(60));

        let first = cached.stat_object("present").await.expect("hit");
        // Mutate behind the cache's back; the cached record keeps serving.
        bucket.put_object("present", &b"xx"[..]).await;
        let second = cached.stat_object("present").await.expect("hit");
        assert_eq!(first, second);

        // Negative entries stick the same way.
        assert!(matches!(
            cached.stat_object("ghost").await,
            Err(Error::NotFound(_))
        ));
        bucket.put_object("ghost", &b"x"[..]).await;
        assert!(matches!(
            cached.stat_object("ghost").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn entries_expire() {
        let bucket = MemoryBucket::new();
        bucket.put_object("f", &b"1"[..]).await;
        let cached = cached(&bucket, Duration::from_millis(10));

        let first = cached.stat_object("f").await.expect("hit");
        bucket.put_object("f", &b"22"[..]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = cached.stat_object("f").await.expect("hit");
        assert_ne!(first.generation, second.generation);
        assert_eq!(second.size, 2);
    }

    #[tokio::test]
    async fn own_writes_are_visible_immediately() {
        let bucket = MemoryBucket::new();
        let cached = cached(&bucket, Duration::from_secs(60));

        // Prime a negative entry, then create through the cache.
        assert!(cached.stat_object("f").await.is_err());
        cached
            .create_object(CreateRequest {
                name: "f".into(),
                contents: Bytes::from_static(b"data"),
                ..Default::default()
            })
            .await
            .expect("create");
        assert_eq!(cached.stat_object("f").await.expect("hit").size, 4);

        cached.delete_object("f").await.expect("delete");
        assert!(cached.stat_object("f").await.is_err());
    }

    #[tokio::test]
    async fn create_clears_negative_parents() {
        let bucket = MemoryBucket::new();
        let cached = cached(&bucket, Duration::from_secs(60));

        // Prime negative entries for a directory that does not exist yet.
        assert!(cached.stat_object("a/").await.is_err());
        assert!(cached.stat_object("a/b/").await.is_err());

        cached
            .create_object(CreateRequest {
                name: "a/b/c".into(),
                ..Default::default()
            })
            .await
            .expect("create");

        // The placeholders still do not exist, but the cached misses must
        // be gone so an implicit-dir probe asks the store again.
        bucket.put_object("a/", &b""[..]).await;
        assert!(cached.stat_object("a/").await.is_ok());
    }

    #[tokio::test]
    async fn type_cache_expires_and_invalidates() {
        let cache = TypeCache::new(
            NonZeroUsize::new(16).expect("nonzero"),
            Duration::from_millis(10),
        );
        let child = Child {
            kind: crate::listing::EntryKind::Dir,
            object_name: "d/".into(),
            record: None,
            implicit: true,
        };

        cache.insert("d".into(), child.clone());
        assert_eq!(cache.get("d"), Some(child.clone()));

        cache.invalidate("d");
        assert_eq!(cache.get("d"), None);

        cache.insert("d".into(), child);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("d"), None);
    }
}
