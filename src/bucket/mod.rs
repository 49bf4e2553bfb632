//! The narrow interface the filesystem consumes from the object store.
//!
//! The store is flat: names may contain `/` but there are no directories.
//! Every object carries a generation, a monotonically increasing integer
//! per name identifying one version of its bytes. Listing with a delimiter
//! collapses deeper names into prefixes, which is all the structure the
//! directory layer gets to work with.

use std::collections::HashMap;
use std::io;
use std::time::SystemTime;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::Result;

mod memory;

pub use memory::MemoryBucket;

/// Objects carrying this metadata key are symlinks; the value is the target.
pub const SYMLINK_METADATA_KEY: &str = "gcsfuse_symlink_target";

/// Generation precondition meaning "the object must not exist yet".
pub const GENERATION_ABSENT: i64 = 0;

/// One version of one object, as reported by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub name: String,
    pub generation: i64,
    pub size: u64,
    pub updated: SystemTime,
    pub metadata: HashMap<String, String>,
}

impl ObjectRecord {
    pub fn is_symlink(&self) -> bool {
        self.metadata.contains_key(SYMLINK_METADATA_KEY)
    }

    pub fn symlink_target(&self) -> Option<&str> {
        self.metadata.get(SYMLINK_METADATA_KEY).map(String::as_str)
    }

    /// Directory placeholders are objects whose name ends with `/`.
    pub fn is_dir_placeholder(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// A delimited, paginated listing request.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: String,
    pub delimiter: Option<char>,
    pub continuation_token: Option<String>,
    pub max_results: Option<usize>,
}

/// One page of listing results.
#[derive(Debug, Default)]
pub struct Listing {
    pub objects: Vec<ObjectRecord>,
    /// Child prefixes collapsed at the delimiter, each ending with it.
    pub collapsed_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

/// Half-open byte range `[start, limit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    pub start: u64,
    pub limit: u64,
}

impl ReadRange {
    pub fn len(&self) -> u64 {
        self.limit.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.limit <= self.start
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    pub contents: Bytes,
    pub metadata: HashMap<String, String>,
    /// `None` writes unconditionally; `Some(GENERATION_ABSENT)` requires the
    /// name to be unused; any other value must match the live generation.
    pub generation_precondition: Option<i64>,
}

/// Bytes of a ranged read, delivered in store-sized chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// The object-store operations the core consumes.
///
/// Implementations apply their own retry policy for transient failures; the
/// core treats any error that survives as final. There is one production
/// implementation (out of tree) and [MemoryBucket] for tests.
#[async_trait::async_trait]
pub trait Bucket: Send + Sync {
    async fn stat_object(&self, name: &str) -> Result<ObjectRecord>;

    async fn list_objects(&self, req: &ListRequest) -> Result<Listing>;

    /// Opens a ranged read against one pinned generation. Reading a range
    /// past the object's end yields the bytes that exist and a clean end of
    /// stream.
    async fn new_reader(&self, name: &str, generation: i64, range: ReadRange)
        -> Result<ByteStream>;

    async fn create_object(&self, req: CreateRequest) -> Result<ObjectRecord>;

    async fn delete_object(&self, name: &str) -> Result<()>;

    async fn update_object(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectRecord>;
}
