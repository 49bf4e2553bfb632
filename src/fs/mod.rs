//! The filesystem dispatcher: every kernel-facing operation, implemented
//! over the bucket adapter, the inode table, the listing engine, and the
//! per-handle readers.
//!
//! Lock discipline: one coarse lock guards the inode table's structure,
//! per-inode locks guard mutable inode fields, per-handle locks serialize a
//! handle's operations. No lock is ever held across a call into the bucket.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::blocks::{BlockCache, BufferPool};
use crate::bucket::{Bucket, CreateRequest, ListRequest, ObjectRecord, GENERATION_ABSENT, SYMLINK_METADATA_KEY};
use crate::config::Config;
use crate::listing::{self, Child, DirEntry, EntryKind, CONFLICT_SUFFIX};
use crate::read::{AdaptiveReader, PinnedObject, ReadOptions};
use crate::statcache::{CachedBucket, TypeCache};
use crate::workers::WorkerPool;
use crate::{Error, Result};

pub mod handles;
pub mod inode_table;
pub mod inodes;
pub mod write;

#[cfg(feature = "fuse")]
pub mod fuse;


use handles::{DirHandle, FileHandle};
use inode_table::InodeTable;
use inodes::{Attributes, Inode, InodeKind};
use write::WriteProxy;

pub use inodes::ROOT_INODE_ID;

/// A mounted view of one bucket.
///
/// All state lives here for the lifetime of the mount; nothing is global
/// and nothing is persisted locally.
pub struct BucketFs {
    config: Config,
    bucket: Arc<dyn Bucket>,
    inodes: RwLock<InodeTable>,
    file_handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
    dir_handles: RwLock<HashMap<u64, Arc<tokio::sync::Mutex<DirHandle>>>>,
    next_handle: AtomicU64,
    cache: Arc<BlockCache>,
    workers: Arc<WorkerPool>,
    type_cache: Option<TypeCache>,
}

impl BucketFs {
    /// Must be called from within a tokio runtime; the download workers are
    /// spawned onto it.
    pub fn new(bucket: Arc<dyn Bucket>, config: Config) -> Self {
        let bucket: Arc<dyn Bucket> = match NonZeroUsize::new(config.stat_cache_capacity) {
            Some(capacity) => Arc::new(CachedBucket::new(
                bucket,
                capacity,
                config.stat_cache_ttl(),
            )),
            None => bucket,
        };

        let workers = Arc::new(WorkerPool::new(config.download_workers));
        let pool = Arc::new(BufferPool::new(
            config.block_size(),
            config.global_max_blocks,
        ));
        let cache = Arc::new(BlockCache::new(bucket.clone(), pool, workers.clone()));

        let type_cache = NonZeroUsize::new(config.stat_cache_capacity).map(|capacity| {
            TypeCache::new(capacity, config.dir_type_cache_ttl())
        });

        Self {
            inodes: RwLock::new(InodeTable::new(&config)),
            file_handles: RwLock::new(HashMap::new()),
            dir_handles: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            cache,
            workers,
            type_cache,
            bucket,
            config,
        }
    }

    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Cancels outstanding work and stops the download workers.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.file_handles.read().values().cloned().collect();
        for handle in handles {
            handle.cancel.cancel();
        }
        self.workers.shutdown().await;
    }

    fn inode(&self, ino: u64) -> Result<Arc<Inode>> {
        self.inodes
            .read()
            .get(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {ino}")))
    }

    fn dir_inode(&self, ino: u64) -> Result<Arc<Inode>> {
        let inode = self.inode(ino)?;
        if !inode.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "inode {ino} is not a directory"
            )));
        }
        Ok(inode)
    }

    fn file_handle(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.file_handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown file handle {fh}")))
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn type_cache_key(prefix: &str, name: &str) -> String {
        format!("{prefix}{name}")
    }

    async fn resolve_child(&self, prefix: &str, name: &str) -> Result<Option<Child>> {
        let key = Self::type_cache_key(prefix, name);
        if let Some(cache) = &self.type_cache {
            if let Some(child) = cache.get(&key) {
                return Ok(Some(child));
            }
        }
        let child =
            listing::lookup_child(&self.bucket, prefix, name, self.config.implicit_dirs).await?;
        if let (Some(cache), Some(child)) = (&self.type_cache, &child) {
            cache.insert(key, child.clone());
        }
        Ok(child)
    }

    fn invalidate_type(&self, prefix: &str, name: &str) {
        if let Some(cache) = &self.type_cache {
            cache.invalidate(&Self::type_cache_key(prefix, name));
        }
    }

    fn pinned(inode: &Inode) -> Result<PinnedObject> {
        let generation = inode
            .generation()
            .ok_or_else(|| Error::InvalidArgument(format!("{:?} is not a file", inode.name())))?;
        Ok(PinnedObject {
            name: inode.name().to_owned(),
            generation,
            size: inode.attributes().size,
        })
    }

    // ---- lookup / attributes ------------------------------------------

    /// Resolves `name` within the parent directory, minting an inode if
    /// needed, and takes one kernel reference on it.
    #[instrument(skip(self), fields(rq.parent = parent, rq.name = name), level = "debug")]
    pub async fn look_up_inode(&self, parent: u64, name: &str) -> Result<(u64, Attributes)> {
        let parent = self.dir_inode(parent)?;
        let child = self
            .resolve_child(parent.name(), name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{}{}", parent.name(), name)))?;

        let inode = {
            let mut table = self.inodes.write();
            let inode = table.lookup_or_create(&child);
            table.increment_lookup(inode.id());
            inode
        };
        Ok((inode.id(), inode.attributes()))
    }

    /// Attributes for an inode. Files revalidate against the store so a
    /// deletion or overwrite behind our back shows up as `nlink == 0`.
    #[instrument(skip(self), fields(rq.inode = ino), level = "debug")]
    pub async fn get_attr(&self, ino: u64) -> Result<Attributes> {
        let inode = self.inode(ino)?;
        let mut attrs = inode.attributes();
        if !inode.is_dir() && attrs.nlink > 0 {
            match self.bucket.stat_object(inode.name()).await {
                Ok(record) if Some(record.generation) == inode.generation() => {}
                Ok(_) | Err(Error::NotFound(_)) => attrs.nlink = 0,
                Err(e) => return Err(e),
            }
        }
        Ok(attrs)
    }

    #[instrument(skip(self), fields(rq.inode = ino), level = "debug")]
    pub fn forget(&self, ino: u64, n: u64) {
        self.inodes.write().forget(ino, n);
    }

    #[instrument(skip(self), fields(rq.inode = ino), level = "debug")]
    pub fn read_link(&self, ino: u64) -> Result<String> {
        let inode = self.inode(ino)?;
        match inode.kind() {
            InodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(Error::InvalidArgument(format!("inode {ino} is not a symlink"))),
        }
    }

    // ---- file handles --------------------------------------------------

    /// Allocates a handle. No I/O happens here; the reader and the write
    /// stage appear lazily on first use.
    #[instrument(skip(self), fields(rq.inode = ino), level = "debug")]
    pub fn open_file(&self, ino: u64, writable: bool) -> Result<u64> {
        if writable {
            self.check_writable()?;
        }
        let inode = self.inode(ino)?;
        if inode.is_dir() {
            return Err(Error::InvalidArgument(format!("inode {ino} is a directory")));
        }
        let fh = self.alloc_handle();
        self.file_handles
            .write()
            .insert(fh, Arc::new(FileHandle::new(inode, writable)));
        Ok(fh)
    }

    /// Reads through the handle's adaptive reader, or from the dirty write
    /// stage when one exists. Short reads at end of object are not errors.
    #[instrument(skip(self, cancel), fields(rq.fh = fh, rq.offset = offset, rq.size = size), level = "debug")]
    pub async fn read_file(
        &self,
        fh: u64,
        offset: u64,
        size: usize,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let handle = self.file_handle(fh)?;

        let mut state = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => return Err(Error::Cancelled),
            guard = handle.state.lock() => guard,
        };

        if let Some(writer) = state.writer.as_mut() {
            return writer.read_at(offset, size).await;
        }

        if state.reader.is_none() {
            state.reader = Some(AdaptiveReader::new(
                Self::pinned(&handle.inode)?,
                self.bucket.clone(),
                self.cache.clone(),
                ReadOptions::from(&self.config),
            ));
        }
        let reader = state.reader.as_mut().expect("installed above");

        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => Err(Error::Cancelled),
            bytes = reader.read_at(offset, size, cancel) => bytes,
        }
    }

    #[instrument(skip(self, data), fields(rq.fh = fh, rq.offset = offset, rq.len = data.len()), level = "debug")]
    pub async fn write_file(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let handle = self.file_handle(fh)?;
        if !handle.writable {
            return Err(Error::InvalidArgument(format!(
                "handle {fh} is not open for writing"
            )));
        }

        let mut state = handle.state.lock().await;
        self.ensure_writer(&handle, &mut state).await?;
        let writer = state.writer.as_mut().expect("staged above");
        writer.write_at(offset, data).await
    }

    /// Truncation via `SetAttr(size)`; other attribute changes are not
    /// supported.
    #[instrument(skip(self), fields(rq.fh = fh, rq.size = size), level = "debug")]
    pub async fn truncate(&self, fh: u64, size: u64) -> Result<()> {
        self.check_writable()?;
        let handle = self.file_handle(fh)?;
        if !handle.writable {
            return Err(Error::InvalidArgument(format!(
                "handle {fh} is not open for writing"
            )));
        }
        let mut state = handle.state.lock().await;
        self.ensure_writer(&handle, &mut state).await?;
        state.writer.as_mut().expect("staged above").truncate(size).await
    }

    async fn ensure_writer(
        &self,
        handle: &FileHandle,
        state: &mut handles::FileHandleState,
    ) -> Result<()> {
        if state.writer.is_none() {
            let staged = WriteProxy::stage(&self.bucket, &Self::pinned(&handle.inode)?).await?;
            state.writer = Some(staged);
        }
        Ok(())
    }

    /// Uploads the handle's dirty bytes, if any, and re-indexes the inode at
    /// the resulting generation.
    #[instrument(skip(self), fields(rq.fh = fh), level = "debug")]
    pub async fn flush_file(&self, fh: u64) -> Result<()> {
        let handle = self.file_handle(fh)?;
        let mut state = handle.state.lock().await;
        let Some(writer) = state.writer.as_mut() else {
            return Ok(());
        };
        if let Some(record) = writer.flush(&self.bucket).await? {
            self.inodes.write().reindex_file(
                &handle.inode,
                record.generation,
                record.size,
                record.updated,
            );
        }
        Ok(())
    }

    /// Drops the handle, cancelling reader work nobody else waits on.
    #[instrument(skip(self), fields(rq.fh = fh), level = "debug")]
    pub async fn release_file_handle(&self, fh: u64) {
        let Some(handle) = self.file_handles.write().remove(&fh) else {
            debug!("file handle {fh} not found");
            return;
        };
        handle.cancel.cancel();
        let mut state = handle.state.lock().await;
        if let Some(reader) = state.reader.as_mut() {
            reader.close();
        }
        state.reader = None;
        state.writer = None;
    }

    // ---- directory handles ---------------------------------------------

    #[instrument(skip(self), fields(rq.inode = ino), level = "debug")]
    pub fn open_dir(&self, ino: u64) -> Result<u64> {
        let inode = self.dir_inode(ino)?;
        let fh = self.alloc_handle();
        self.dir_handles
            .write()
            .insert(fh, Arc::new(tokio::sync::Mutex::new(DirHandle::new(inode))));
        Ok(fh)
    }

    /// Entries from `offset` on. Offset 0 rewinds: the snapshot is rebuilt
    /// from a fresh listing. An offset past the end of the snapshot is an
    /// error; an offset exactly at the end is an empty page.
    #[instrument(skip(self), fields(rq.fh = fh, rq.offset = offset), level = "debug")]
    pub async fn read_dir(&self, fh: u64, offset: u64) -> Result<Vec<DirEntry>> {
        let handle = self
            .dir_handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown dir handle {fh}")))?;
        let mut handle = handle.lock().await;

        if offset == 0 {
            handle.invalidate();
            let prefix = handle.inode.name().to_owned();
            handle.entries =
                listing::list_directory(&self.bucket, &prefix, self.config.implicit_dirs).await?;
            handle.entries_valid = true;
        }

        let offset = offset as usize;
        if offset > handle.entries.len() {
            return Err(Error::InvalidArgument(format!(
                "readdir offset {offset} past end ({})",
                handle.entries.len()
            )));
        }
        Ok(handle.entries[offset..].to_vec())
    }

    #[instrument(skip(self), fields(rq.fh = fh), level = "debug")]
    pub fn release_dir_handle(&self, fh: u64) {
        self.dir_handles.write().remove(&fh);
    }

    // ---- mutations -----------------------------------------------------

    fn validate_new_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') || name.contains(CONFLICT_SUFFIX) {
            return Err(Error::InvalidArgument(format!("invalid name {name:?}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(rq.parent = parent, rq.name = name), level = "debug")]
    pub async fn mkdir(&self, parent: u64, name: &str) -> Result<(u64, Attributes)> {
        self.check_writable()?;
        Self::validate_new_name(name)?;
        let parent = self.dir_inode(parent)?;
        let object_name = format!("{}{}/", parent.name(), name);

        let record = self
            .bucket
            .create_object(CreateRequest {
                name: object_name.clone(),
                contents: Bytes::new(),
                metadata: Default::default(),
                generation_precondition: Some(GENERATION_ABSENT),
            })
            .await?;
        self.invalidate_type(parent.name(), name);

        let inode = self.link_child(Child {
            kind: EntryKind::Dir,
            object_name,
            record: Some(record),
            implicit: false,
        });
        Ok((inode.id(), inode.attributes()))
    }

    /// Creates an empty object and opens a writable handle on it, as the
    /// `Create` opcode demands.
    #[instrument(skip(self), fields(rq.parent = parent, rq.name = name), level = "debug")]
    pub async fn create_file(&self, parent: u64, name: &str) -> Result<(u64, Attributes, u64)> {
        self.check_writable()?;
        Self::validate_new_name(name)?;
        let parent = self.dir_inode(parent)?;
        let object_name = format!("{}{}", parent.name(), name);

        let record = self
            .bucket
            .create_object(CreateRequest {
                name: object_name.clone(),
                contents: Bytes::new(),
                metadata: Default::default(),
                generation_precondition: Some(GENERATION_ABSENT),
            })
            .await?;
        self.invalidate_type(parent.name(), name);

        let inode = self.link_child(Child {
            kind: EntryKind::File,
            object_name,
            record: Some(record),
            implicit: false,
        });

        let fh = self.alloc_handle();
        self.file_handles
            .write()
            .insert(fh, Arc::new(FileHandle::new(inode.clone(), true)));
        Ok((inode.id(), inode.attributes(), fh))
    }

    #[instrument(skip(self), fields(rq.parent = parent, rq.name = name), level = "debug")]
    pub async fn create_symlink(
        &self,
        parent: u64,
        name: &str,
        target: &str,
    ) -> Result<(u64, Attributes)> {
        self.check_writable()?;
        Self::validate_new_name(name)?;
        let parent = self.dir_inode(parent)?;
        let object_name = format!("{}{}", parent.name(), name);

        let record = self
            .bucket
            .create_object(CreateRequest {
                name: object_name.clone(),
                contents: Bytes::new(),
                metadata: [(SYMLINK_METADATA_KEY.to_owned(), target.to_owned())].into(),
                generation_precondition: Some(GENERATION_ABSENT),
            })
            .await?;
        self.invalidate_type(parent.name(), name);

        let inode = self.link_child(Child {
            kind: EntryKind::Symlink,
            object_name,
            record: Some(record),
            implicit: false,
        });
        Ok((inode.id(), inode.attributes()))
    }

    fn link_child(&self, child: Child) -> Arc<Inode> {
        let mut table = self.inodes.write();
        let inode = table.lookup_or_create(&child);
        table.increment_lookup(inode.id());
        inode
    }

    /// Removes the file or symlink. The object disappears from listings and
    /// indexes immediately; open handles keep reading their pinned
    /// generation.
    #[instrument(skip(self), fields(rq.parent = parent, rq.name = name), level = "debug")]
    pub async fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        self.check_writable()?;
        let parent = self.dir_inode(parent)?;
        let bare = name.strip_suffix(CONFLICT_SUFFIX).unwrap_or(name);
        let object_name = format!("{}{}", parent.name(), bare);

        self.bucket.delete_object(&object_name).await?;
        self.invalidate_type(parent.name(), name);
        self.invalidate_type(parent.name(), bare);
        self.inodes.write().unlink_file(&object_name);
        Ok(())
    }

    #[instrument(skip(self), fields(rq.parent = parent, rq.name = name), level = "debug")]
    pub async fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        self.check_writable()?;
        let parent = self.dir_inode(parent)?;
        let object_name = format!("{}{}/", parent.name(), name);

        // Refuse before mutating anything if the directory has entries.
        let listing = self
            .bucket
            .list_objects(&ListRequest {
                prefix: object_name.clone(),
                delimiter: Some('/'),
                continuation_token: None,
                max_results: Some(2),
            })
            .await?;
        let occupied = !listing.collapsed_prefixes.is_empty()
            || listing.objects.iter().any(|o| o.name != object_name);
        if occupied {
            return Err(Error::NotEmpty(object_name));
        }

        self.bucket.delete_object(&object_name).await?;
        self.invalidate_type(parent.name(), name);
        // The directory's death also retires the conflict alias of any
        // same-named file.
        self.invalidate_type(parent.name(), &format!("{name}{CONFLICT_SUFFIX}"));
        self.inodes.write().remove_dir(&object_name);
        Ok(())
    }

    // ---- introspection -------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The record backing an inode as the store currently reports it.
    /// Mostly useful to tooling; the read path never consults this.
    pub async fn stat_inode(&self, ino: u64) -> Result<ObjectRecord> {
        let inode = self.inode(ino)?;
        self.bucket.stat_object(inode.name()).await
    }
}
