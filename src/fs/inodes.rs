//! Inode variants and their attributes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

/// The root inode id, as the kernel expects it. All other ids are strictly
/// greater and unique for the process lifetime.
pub const ROOT_INODE_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attributes {
    pub size: u64,
    /// Permission bits only; the file type comes from the inode variant.
    pub mode: u32,
    pub mtime: SystemTime,
    pub uid: u32,
    pub gid: u32,
    /// 1 while the inode is reachable through a name, 0 once unlinked.
    pub nlink: u32,
}

#[derive(Debug, Clone)]
pub enum InodeKind {
    Dir {
        /// Directory inferred from objects under the prefix; it has no
        /// placeholder object backing it.
        implicit: bool,
    },
    File,
    Symlink {
        target: String,
    },
}

struct InodeState {
    attrs: Attributes,
    /// Kernel references from lookups; `forget` takes them back.
    lookup_count: u64,
    /// Present in a name index of the table.
    linked: bool,
}

/// One live filesystem node.
///
/// The name is the fully qualified object name: directories end with `/`
/// and the root is the empty string. Files and symlinks additionally pin
/// the generation they were minted from; handles opened against the inode
/// keep reading that generation even after an overwrite displaces it.
pub struct Inode {
    id: u64,
    name: String,
    kind: InodeKind,
    /// Source generation for files and symlinks, unused for directories.
    /// Replaced in place when a flush from this process succeeds.
    generation: AtomicI64,
    state: Mutex<InodeState>,
}

impl Inode {
    pub(super) fn new(
        id: u64,
        name: String,
        kind: InodeKind,
        generation: i64,
        attrs: Attributes,
    ) -> Self {
        match kind {
            InodeKind::Dir { .. } => {
                debug_assert!(name.is_empty() || name.ends_with('/'), "dir name {name:?}")
            }
            InodeKind::File | InodeKind::Symlink { .. } => {
                debug_assert!(!name.ends_with('/'), "file name {name:?}")
            }
        }
        Self {
            id,
            name,
            kind,
            generation: AtomicI64::new(generation),
            state: Mutex::new(InodeState {
                attrs,
                lookup_count: 0,
                linked: true,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fully qualified object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &InodeKind {
        &self.kind
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, InodeKind::Dir { .. })
    }

    pub fn generation(&self) -> Option<i64> {
        match self.kind {
            InodeKind::Dir { .. } => None,
            InodeKind::File | InodeKind::Symlink { .. } => {
                Some(self.generation.load(Ordering::SeqCst))
            }
        }
    }

    pub fn attributes(&self) -> Attributes {
        let state = self.state.lock();
        Attributes {
            nlink: state.linked as u32,
            ..state.attrs
        }
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().linked
    }

    pub(super) fn set_generation(&self, generation: i64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    pub(super) fn update_attrs(&self, size: u64, mtime: SystemTime) {
        let mut state = self.state.lock();
        state.attrs.size = size;
        state.attrs.mtime = mtime;
    }

    pub(super) fn mark_unlinked(&self) {
        self.state.lock().linked = false;
    }

    pub(super) fn increment_lookup(&self) {
        self.state.lock().lookup_count += 1;
    }

    /// Returns the remaining count.
    pub(super) fn decrement_lookup(&self, n: u64) -> u64 {
        let mut state = self.state.lock();
        state.lookup_count = state.lookup_count.saturating_sub(n);
        state.lookup_count
    }

    pub(super) fn lookup_count(&self) -> u64 {
        self.state.lock().lookup_count
    }
}
