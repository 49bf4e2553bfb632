//! The live inode set and its name indexes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use super::inodes::{Attributes, Inode, InodeKind, ROOT_INODE_ID};
use crate::config::Config;
use crate::listing::{Child, EntryKind};

/// Maps inode ids to inodes and maintains two secondary indexes: directory
/// names, and `(name, generation)` for files and symlinks. At most one
/// linked inode exists per name; overwriting generations displace their
/// predecessor, which lives on unlinked for as long as the kernel still
/// references it.
pub struct InodeTable {
    uid: u32,
    gid: u32,
    file_mode: u32,
    dir_mode: u32,

    inodes: HashMap<u64, Arc<Inode>>,
    dirs_by_name: HashMap<String, u64>,
    files_by_key: HashMap<(String, i64), u64>,
    /// The linked generation for each file name, keyed without generation
    /// so unlink and displacement can find the current holder.
    file_generations: HashMap<String, i64>,

    next_id: u64,
}

impl InodeTable {
    pub fn new(config: &Config) -> Self {
        let mut table = Self {
            uid: config.uid,
            gid: config.gid,
            file_mode: config.file_mode,
            dir_mode: config.dir_mode,
            inodes: HashMap::new(),
            dirs_by_name: HashMap::new(),
            files_by_key: HashMap::new(),
            file_generations: HashMap::new(),
            next_id: ROOT_INODE_ID + 1,
        };
        let root = Arc::new(Inode::new(
            ROOT_INODE_ID,
            String::new(),
            InodeKind::Dir { implicit: false },
            0,
            table.dir_attrs(SystemTime::now()),
        ));
        table.inodes.insert(ROOT_INODE_ID, root);
        table.dirs_by_name.insert(String::new(), ROOT_INODE_ID);
        table
    }

    fn dir_attrs(&self, mtime: SystemTime) -> Attributes {
        Attributes {
            size: 0,
            mode: self.dir_mode,
            mtime,
            uid: self.uid,
            gid: self.gid,
            nlink: 1,
        }
    }

    fn file_attrs(&self, size: u64, mtime: SystemTime) -> Attributes {
        Attributes {
            size,
            mode: self.file_mode,
            mtime,
            uid: self.uid,
            gid: self.gid,
            nlink: 1,
        }
    }

    pub fn root(&self) -> Arc<Inode> {
        self.inodes[&ROOT_INODE_ID].clone()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Inode>> {
        self.inodes.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    fn mint(&mut self, name: String, kind: InodeKind, generation: i64, attrs: Attributes) -> Arc<Inode> {
        let id = self.next_id;
        self.next_id += 1;
        let inode = Arc::new(Inode::new(id, name, kind, generation, attrs));
        self.inodes.insert(id, inode.clone());
        inode
    }

    /// Returns the inode for a resolved child, creating one if the name (or
    /// name and generation) is not indexed yet. A file record carrying a
    /// generation the index does not know displaces the previous holder of
    /// the name.
    pub fn lookup_or_create(&mut self, child: &Child) -> Arc<Inode> {
        match child.kind {
            EntryKind::Dir => self.lookup_or_create_dir(child),
            EntryKind::File | EntryKind::Symlink => self.lookup_or_create_file(child),
        }
    }

    fn lookup_or_create_dir(&mut self, child: &Child) -> Arc<Inode> {
        if let Some(&id) = self.dirs_by_name.get(&child.object_name) {
            return self.inodes[&id].clone();
        }
        let mtime = child
            .record
            .as_ref()
            .map(|r| r.updated)
            .unwrap_or_else(SystemTime::now);
        let attrs = self.dir_attrs(mtime);
        let inode = self.mint(
            child.object_name.clone(),
            InodeKind::Dir {
                implicit: child.implicit,
            },
            0,
            attrs,
        );
        self.dirs_by_name.insert(child.object_name.clone(), inode.id());
        inode
    }

    fn lookup_or_create_file(&mut self, child: &Child) -> Arc<Inode> {
        let record = child
            .record
            .as_ref()
            .expect("file children always carry a record");
        let name = &child.object_name;

        if let Some(&linked_generation) = self.file_generations.get(name) {
            if linked_generation == record.generation {
                let id = self.files_by_key[&(name.clone(), linked_generation)];
                let inode = self.inodes[&id].clone();
                inode.update_attrs(record.size, record.updated);
                return inode;
            }
            // A different generation is live in the store: the indexed
            // inode has been overwritten. Displace it; open handles keep
            // reading the old generation until they close.
            debug!(
                object = %name,
                old_generation = linked_generation,
                new_generation = record.generation,
                "overwrite detected, displacing inode"
            );
            self.unlink_file(name);
        }

        let kind = match child.kind {
            EntryKind::Symlink => InodeKind::Symlink {
                target: record.symlink_target().unwrap_or_default().to_owned(),
            },
            _ => InodeKind::File,
        };
        let attrs = self.file_attrs(record.size, record.updated);
        let inode = self.mint(name.clone(), kind, record.generation, attrs);
        self.files_by_key
            .insert((name.clone(), record.generation), inode.id());
        self.file_generations.insert(name.clone(), record.generation);
        inode
    }

    /// Moves the inode's index entry to a new generation after this process
    /// wrote the object. The inode identity is preserved.
    pub fn reindex_file(&mut self, inode: &Arc<Inode>, generation: i64, size: u64, mtime: SystemTime) {
        let name = inode.name().to_owned();
        if let Some(old) = inode.generation() {
            self.files_by_key.remove(&(name.clone(), old));
        }
        inode.set_generation(generation);
        inode.update_attrs(size, mtime);
        if inode.is_linked() {
            self.files_by_key.insert((name.clone(), generation), inode.id());
            self.file_generations.insert(name, generation);
        }
    }

    pub fn increment_lookup(&self, id: u64) {
        if let Some(inode) = self.inodes.get(&id) {
            inode.increment_lookup();
        }
    }

    /// Takes back `n` kernel references. Once the count reaches zero and the
    /// inode is no longer indexed under any name, it is destroyed.
    pub fn forget(&mut self, id: u64, n: u64) {
        if id == ROOT_INODE_ID {
            return;
        }
        let Some(inode) = self.inodes.get(&id).cloned() else {
            return;
        };
        if inode.decrement_lookup(n) == 0 && !inode.is_linked() {
            self.inodes.remove(&id);
        }
    }

    /// Unlinks the file or symlink at `name`: it disappears from the
    /// indexes, `nlink` drops to 0, and the inode itself is destroyed once
    /// the kernel forgets it.
    pub fn unlink_file(&mut self, name: &str) -> Option<Arc<Inode>> {
        let generation = self.file_generations.remove(name)?;
        let id = self.files_by_key.remove(&(name.to_owned(), generation))?;
        let inode = self.inodes.get(&id).cloned()?;
        inode.mark_unlinked();
        if inode.lookup_count() == 0 {
            self.inodes.remove(&id);
        }
        Some(inode)
    }

    /// Directory counterpart of [Self::unlink_file].
    pub fn remove_dir(&mut self, name: &str) -> Option<Arc<Inode>> {
        let id = self.dirs_by_name.remove(name)?;
        let inode = self.inodes.get(&id).cloned()?;
        inode.mark_unlinked();
        if inode.lookup_count() == 0 {
            self.inodes.remove(&id);
        }
        Some(inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::ObjectRecord;

    fn file_child(name: &str, generation: i64, size: u64) -> Child {
        Child {
            kind: EntryKind::File,
            object_name: name.to_owned(),
            record: Some(ObjectRecord {
                name: name.to_owned(),
                generation,
                size,
                updated: SystemTime::now(),
                metadata: Default::default(),
            }),
            implicit: false,
        }
    }

    fn dir_child(name: &str) -> Child {
        Child {
            kind: EntryKind::Dir,
            object_name: name.to_owned(),
            record: None,
            implicit: true,
        }
    }

    #[test]
    fn root_is_reserved_and_ids_grow() {
        let mut table = InodeTable::new(&Config::default());
        let root = table.root();
        assert_eq!(root.id(), ROOT_INODE_ID);
        assert_eq!(root.name(), "");

        let a = table.lookup_or_create(&file_child("a", 1, 10));
        let b = table.lookup_or_create(&dir_child("b/"));
        assert!(a.id() > ROOT_INODE_ID);
        assert!(b.id() > a.id());
    }

    #[test]
    fn same_key_yields_the_same_inode() {
        let mut table = InodeTable::new(&Config::default());
        let first = table.lookup_or_create(&file_child("f", 3, 10));
        let second = table.lookup_or_create(&file_child("f", 3, 10));
        assert_eq!(first.id(), second.id());

        let dir = table.lookup_or_create(&dir_child("d/"));
        assert_eq!(dir.id(), table.lookup_or_create(&dir_child("d/")).id());
    }

    #[test]
    fn overwrite_displaces_the_old_generation() {
        let mut table = InodeTable::new(&Config::default());
        let old = table.lookup_or_create(&file_child("f", 1, 10));
        old.increment_lookup();

        let new = table.lookup_or_create(&file_child("f", 2, 20));
        assert_ne!(old.id(), new.id());
        assert_eq!(old.attributes().nlink, 0);
        assert_eq!(new.attributes().nlink, 1);
        assert_eq!(old.generation(), Some(1));

        // The displaced inode survives until the kernel forgets it.
        assert!(table.get(old.id()).is_some());
        table.forget(old.id(), 1);
        assert!(table.get(old.id()).is_none());
    }

    #[test]
    fn unlink_keeps_open_inodes_alive() {
        let mut table = InodeTable::new(&Config::default());
        let inode = table.lookup_or_create(&file_child("f", 1, 10));
        inode.increment_lookup();

        let unlinked = table.unlink_file("f").expect("was linked");
        assert_eq!(unlinked.id(), inode.id());
        assert_eq!(inode.attributes().nlink, 0);
        assert!(table.get(inode.id()).is_some());

        // Recreating the name mints a fresh inode.
        let fresh = table.lookup_or_create(&file_child("f", 2, 5));
        assert_ne!(fresh.id(), inode.id());

        table.forget(inode.id(), 1);
        assert!(table.get(inode.id()).is_none());
    }

    #[test]
    fn unlink_without_references_destroys_immediately() {
        let mut table = InodeTable::new(&Config::default());
        let inode = table.lookup_or_create(&file_child("f", 1, 10));
        table.unlink_file("f");
        assert!(table.get(inode.id()).is_none());
    }

    #[test]
    fn reindex_preserves_identity() {
        let mut table = InodeTable::new(&Config::default());
        let inode = table.lookup_or_create(&file_child("f", 1, 10));
        table.reindex_file(&inode, 7, 42, SystemTime::now());

        assert_eq!(inode.generation(), Some(7));
        assert_eq!(inode.attributes().size, 42);
        let again = table.lookup_or_create(&file_child("f", 7, 42));
        assert_eq!(again.id(), inode.id());
    }

    #[test]
    fn forget_is_idempotent_for_the_root() {
        let mut table = InodeTable::new(&Config::default());
        table.forget(ROOT_INODE_ID, 100);
        assert!(table.get(ROOT_INODE_ID).is_some());
    }
}
