//! Per-open state: file handles and directory handles.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::inodes::Inode;
use super::write::WriteProxy;
use crate::listing::DirEntry;
use crate::read::AdaptiveReader;

/// One open file. The reader is built lazily on first read, the write proxy
/// lazily on first write; the async mutex serializes operations on the
/// handle, as the kernel expects per-handle ordering but nothing across
/// handles.
pub struct FileHandle {
    pub inode: Arc<Inode>,
    pub writable: bool,
    /// Fired when the handle is released; pending reads observe it.
    pub cancel: CancellationToken,
    pub state: Mutex<FileHandleState>,
}

#[derive(Default)]
pub struct FileHandleState {
    pub reader: Option<AdaptiveReader>,
    pub writer: Option<WriteProxy>,
}

impl FileHandle {
    pub fn new(inode: Arc<Inode>, writable: bool) -> Self {
        Self {
            inode,
            writable,
            cancel: CancellationToken::new(),
            state: Mutex::new(FileHandleState::default()),
        }
    }
}

/// One open directory, holding the entry snapshot the kernel pages through.
/// Entry offsets are contiguous from 1; a readdir at offset 0 rewinds and
/// rebuilds the snapshot.
pub struct DirHandle {
    pub inode: Arc<Inode>,
    pub entries: Vec<DirEntry>,
    pub entries_valid: bool,
}

impl DirHandle {
    pub fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            entries: Vec::new(),
            entries_valid: false,
        }
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.entries_valid = false;
    }
}
