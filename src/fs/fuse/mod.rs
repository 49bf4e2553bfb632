//! The kernel-FUSE transport surface: a [FileSystem] implementation
//! bridging the sync dispatch threads into the async core, and a daemon
//! that mounts it.

use std::ffi::CStr;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fuse_backend_rs::abi::fuse_abi::{stat64, CreateIn};
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry as FuseDirEntry, Entry, FileSystem, FsOptions, OpenOptions, SetattrValid,
    ZeroCopyReader, ZeroCopyWriter,
};
use fuse_backend_rs::transport::FuseSession;
use parking_lot::Mutex;
use threadpool::ThreadPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::inodes::InodeKind;
use super::BucketFs;
use crate::listing::{Child, DirEntry, EntryKind};
use crate::Error;

mod file_attr;

use file_attr::attr_for;

fn errno(err: &Error) -> libc::c_int {
    match err {
        Error::NotFound(_) => libc::ENOENT,
        Error::PreconditionFailed(_) => libc::EEXIST,
        Error::Io(_) => libc::EIO,
        Error::Cancelled => libc::EINTR,
        Error::ResourceExhausted(_) => libc::EAGAIN,
        Error::InvalidArgument(_) => libc::EINVAL,
        Error::NotImplemented(_) => libc::ENOSYS,
        Error::NotEmpty(_) => libc::ENOTEMPTY,
        Error::ReadOnly => libc::EROFS,
    }
}

fn fuse_error(err: Error) -> io::Error {
    io::Error::from_raw_os_error(errno(&err))
}

fn parse_name(name: &CStr) -> io::Result<&str> {
    name.to_str()
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Adapts [BucketFs] to the synchronous [FileSystem] contract the FUSE
/// server threads drive. Every handler hops onto the tokio runtime the
/// filesystem was created on.
pub struct FuseAdapter {
    fs: Arc<BucketFs>,
    tokio_handle: tokio::runtime::Handle,
    /// Fired at unmount; outstanding reads observe it.
    cancel: CancellationToken,
}

impl FuseAdapter {
    /// Must be called from within the runtime that also created `fs`.
    pub fn new(fs: Arc<BucketFs>) -> Self {
        Self {
            fs,
            tokio_handle: tokio::runtime::Handle::current(),
            cancel: CancellationToken::new(),
        }
    }

    fn attr_ttl(&self) -> Duration {
        self.fs.config().stat_cache_ttl()
    }

    fn entry(&self, ino: u64, kind: &InodeKind, attrs: &super::inodes::Attributes) -> Entry {
        Entry {
            inode: ino,
            attr: attr_for(ino, kind, attrs).into(),
            attr_timeout: self.attr_ttl(),
            entry_timeout: self.attr_ttl(),
            ..Default::default()
        }
    }

    fn entry_for_inode(&self, ino: u64) -> io::Result<Entry> {
        let inode = self
            .fs
            .inode(ino)
            .map_err(fuse_error)?;
        Ok(self.entry(ino, inode.kind(), &inode.attributes()))
    }
}

impl FileSystem for FuseAdapter {
    type Handle = u64;
    type Inode = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    fn destroy(&self) {
        self.cancel.cancel();
        let fs = self.fs.clone();
        self.tokio_handle.spawn(async move { fs.shutdown().await });
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let name = parse_name(name)?;
        let (ino, _) = self
            .tokio_handle
            .block_on(self.fs.look_up_inode(parent, name))
            .map_err(fuse_error)?;
        self.entry_for_inode(ino)
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.count = count))]
    fn forget(&self, _ctx: &Context, inode: Self::Inode, count: u64) {
        self.fs.forget(inode, count);
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let attrs = self
            .tokio_handle
            .block_on(self.fs.get_attr(inode))
            .map_err(fuse_error)?;
        let node = self.fs.inode(inode).map_err(fuse_error)?;
        Ok((attr_for(inode, node.kind(), &attrs).into(), self.attr_ttl()))
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn setattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        attr: stat64,
        handle: Option<Self::Handle>,
        valid: SetattrValid,
    ) -> io::Result<(stat64, Duration)> {
        if valid.contains(SetattrValid::SIZE) {
            let fh = handle.ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
            self.tokio_handle
                .block_on(self.fs.truncate(fh, attr.st_size as u64))
                .map_err(fuse_error)?;
        } else if valid.intersects(
            SetattrValid::MODE
                | SetattrValid::UID
                | SetattrValid::GID
                | SetattrValid::ATIME
                | SetattrValid::MTIME,
        ) {
            // chmod/chown/chtimes have no object-store counterpart.
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        self.getattr(_ctx, inode, handle)
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        self.fs
            .read_link(inode)
            .map(String::into_bytes)
            .map_err(fuse_error)
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn symlink(
        &self,
        _ctx: &Context,
        linkname: &CStr,
        parent: Self::Inode,
        name: &CStr,
    ) -> io::Result<Entry> {
        let name = parse_name(name)?;
        let target = parse_name(linkname)?;
        let (ino, _) = self
            .tokio_handle
            .block_on(self.fs.create_symlink(parent, name, target))
            .map_err(fuse_error)?;
        self.entry_for_inode(ino)
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn mkdir(
        &self,
        _ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        _mode: u32,
        _umask: u32,
    ) -> io::Result<Entry> {
        let name = parse_name(name)?;
        let (ino, _) = self
            .tokio_handle
            .block_on(self.fs.mkdir(parent, name))
            .map_err(fuse_error)?;
        self.entry_for_inode(ino)
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn unlink(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let name = parse_name(name)?;
        self.tokio_handle
            .block_on(self.fs.unlink(parent, name))
            .map_err(fuse_error)
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn rmdir(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let name = parse_name(name)?;
        self.tokio_handle
            .block_on(self.fs.rmdir(parent, name))
            .map_err(fuse_error)
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions, Option<u32>)> {
        let node = self.fs.inode(inode).map_err(fuse_error)?;
        if node.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        }
        let writable = (flags as i32 & libc::O_ACCMODE) != libc::O_RDONLY;
        let fh = self.fs.open_file(inode, writable).map_err(fuse_error)?;
        Ok((Some(fh), OpenOptions::empty(), None))
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn create(
        &self,
        _ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        _args: CreateIn,
    ) -> io::Result<(Entry, Option<Self::Handle>, OpenOptions, Option<u32>)> {
        let name = parse_name(name)?;
        let (ino, _, fh) = self
            .tokio_handle
            .block_on(self.fs.create_file(parent, name))
            .map_err(fuse_error)?;
        Ok((self.entry_for_inode(ino)?, Some(fh), OpenOptions::empty(), None))
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.fh = handle, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let bytes = self
            .tokio_handle
            .block_on(
                self.fs
                    .read_file(handle, offset, size as usize, &self.cancel),
            )
            .map_err(fuse_error)?;
        w.write(&bytes)
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.fh = handle, rq.offset = offset, rq.size = size))]
    fn write(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        let mut data = vec![0u8; size as usize];
        r.read_exact(&mut data)?;
        self.tokio_handle
            .block_on(self.fs.write_file(handle, offset, &data))
            .map_err(fuse_error)
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.fh = handle))]
    fn flush(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        _lock_owner: u64,
    ) -> io::Result<()> {
        self.tokio_handle
            .block_on(self.fs.flush_file(handle))
            .map_err(|e| match e {
                // A clobbered flush is an I/O failure to the caller, not a
                // name collision.
                Error::PreconditionFailed(_) => io::Error::from_raw_os_error(libc::EIO),
                other => fuse_error(other),
            })
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.fh = handle))]
    fn fsync(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        _datasync: bool,
        handle: Self::Handle,
    ) -> io::Result<()> {
        self.flush(ctx, inode, handle, 0)
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.fh = handle))]
    fn release(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        self.tokio_handle
            .block_on(self.fs.release_file_handle(handle));
        Ok(())
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn opendir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        let fh = self.fs.open_dir(inode).map_err(fuse_error)?;
        Ok((Some(fh), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.fh = handle, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(FuseDirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let parent = self.fs.inode(inode).map_err(fuse_error)?;
        let entries = self
            .tokio_handle
            .block_on(self.fs.read_dir(handle, offset))
            .map_err(fuse_error)?;

        for entry in entries {
            let ino = {
                let mut table = self.fs.inodes.write();
                table.lookup_or_create(&child_of(parent.name(), &entry)).id()
            };
            let type_ = match entry.kind {
                #[allow(clippy::unnecessary_cast)]
                EntryKind::Dir => libc::S_IFDIR as u32,
                #[allow(clippy::unnecessary_cast)]
                EntryKind::File => libc::S_IFREG as u32,
                #[allow(clippy::unnecessary_cast)]
                EntryKind::Symlink => libc::S_IFLNK as u32,
            };
            let written = add_entry(FuseDirEntry {
                ino,
                offset: entry.offset,
                type_,
                name: entry.name.as_bytes(),
            })?;
            // A full buffer reports 0; the kernel resumes at the offset of
            // the last accepted entry.
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.fh = handle))]
    fn releasedir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
    ) -> io::Result<()> {
        self.fs.release_dir_handle(handle);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn statfs(&self, _ctx: &Context, _inode: Self::Inode) -> io::Result<libc::statvfs64> {
        // Fixed generous geometry; the store has no meaningful capacity.
        let mut st: libc::statvfs64 = unsafe { std::mem::zeroed() };
        st.f_bsize = self.fs.config().block_size() as u64;
        st.f_frsize = 4096;
        st.f_blocks = u64::MAX / st.f_frsize;
        st.f_bfree = st.f_blocks;
        st.f_bavail = st.f_blocks;
        st.f_files = u64::MAX;
        st.f_ffree = u64::MAX;
        st.f_namemax = 1024;
        Ok(st)
    }
}

/// Rebuilds the resolved-child view of a listed entry so the inode table
/// can mint (or find) its inode.
fn child_of(prefix: &str, entry: &DirEntry) -> Child {
    let bare = entry
        .name
        .strip_suffix(crate::listing::CONFLICT_SUFFIX)
        .unwrap_or(&entry.name);
    let object_name = match entry.kind {
        EntryKind::Dir => format!("{prefix}{bare}/"),
        EntryKind::File | EntryKind::Symlink => format!("{prefix}{bare}"),
    };
    Child {
        kind: entry.kind,
        object_name,
        record: entry.record.clone(),
        implicit: entry.kind == EntryKind::Dir && entry.record.is_none(),
    }
}

/// Replying into a torn-down session fails with this errno; it is the only
/// signal a dispatch thread gets that the mount is gone.
#[cfg(target_os = "linux")]
const SESSION_GONE_ERRNO: libc::c_int = libc::EBADFD;
#[cfg(target_os = "macos")]
const SESSION_GONE_ERRNO: libc::c_int = libc::EBADF;

/// Pulls requests off one kernel channel and dispatches them into the
/// adapter until the session is torn down. One dispatch thread runs one of
/// these; a failed request is logged and the loop keeps serving.
fn serve_channel(
    server: Arc<fuse_backend_rs::api::server::Server<Arc<FuseAdapter>>>,
    mut channel: fuse_backend_rs::transport::FuseChannel,
) {
    loop {
        let (reader, writer) = match channel.get_request() {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(error) => {
                warn!(?error, "reading from the fuse channel failed");
                break;
            }
        };
        match server.handle_message(reader, writer.into(), None, None) {
            Ok(_) => {}
            Err(fuse_backend_rs::Error::EncodeMessage(e))
                if e.raw_os_error() == Some(SESSION_GONE_ERRNO) =>
            {
                debug!("fuse session went away, stopping dispatch");
                break;
            }
            Err(error) => warn!(?error, "fuse request failed"),
        }
    }
}

/// Mounts a [FuseAdapter] and serves it with a fixed number of dispatch
/// threads until unmounted.
#[derive(Clone)]
pub struct FuseDaemon {
    session: Arc<Mutex<FuseSession>>,
    threads: Arc<ThreadPool>,
}

impl FuseDaemon {
    #[instrument(skip(adapter, mountpoint), fields(mountpoint = ?mountpoint), err)]
    pub fn new<P>(
        adapter: FuseAdapter,
        mountpoint: P,
        num_threads: usize,
        allow_other: bool,
    ) -> Result<Self, io::Error>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        let server = Arc::new(fuse_backend_rs::api::server::Server::new(Arc::new(adapter)));

        let mut session = FuseSession::new(mountpoint.as_ref(), "bucketfs", "", false)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        #[cfg(target_os = "linux")]
        session.set_allow_other(allow_other);
        session
            .mount()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let threads = threadpool::Builder::new()
            .num_threads(num_threads)
            .thread_name("fuse_server".to_string())
            .build();

        for _ in 0..num_threads {
            let server = server.clone();
            let channel = session
                .new_channel()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            threads.execute(move || serve_channel(server, channel));
        }

        Ok(FuseDaemon {
            session: Arc::new(Mutex::new(session)),
            threads: Arc::new(threads),
        })
    }

    /// Waits for all dispatch threads to finish.
    #[instrument(skip_all)]
    pub fn wait(&self) {
        self.threads.join()
    }

    /// Sends the unmount command and waits for the dispatch threads.
    #[instrument(skip_all, err)]
    pub fn unmount(&self) -> Result<(), io::Error> {
        self.session
            .lock()
            .umount()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.wait();
        Ok(())
    }
}

impl Drop for FuseDaemon {
    fn drop(&mut self) {
        if let Err(error) = self.unmount() {
            warn!(?error, "failed to unmount filesystem");
        }
    }
}
