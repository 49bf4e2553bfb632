#![allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS

use std::time::{SystemTime, UNIX_EPOCH};

use fuse_backend_rs::abi::fuse_abi::Attr;

use crate::fs::inodes::{Attributes, InodeKind};

fn unix_time(t: SystemTime) -> (u64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

/// Builds the FUSE attribute block for an inode.
pub(super) fn attr_for(ino: u64, kind: &InodeKind, attrs: &Attributes) -> Attr {
    let type_bits = match kind {
        InodeKind::Dir { .. } => libc::S_IFDIR as u32,
        InodeKind::File => libc::S_IFREG as u32,
        InodeKind::Symlink { .. } => libc::S_IFLNK as u32,
    };
    let (mtime, mtimensec) = unix_time(attrs.mtime);

    Attr {
        ino,
        size: attrs.size,
        blocks: attrs.size.div_ceil(512),
        blksize: 4096,
        mode: type_bits | attrs.mode,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        mtime,
        mtimensec,
        ctime: mtime,
        ctimensec: mtimensec,
        atime: mtime,
        atimensec: mtimensec,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_and_file_modes() {
        let attrs = Attributes {
            size: 1024,
            mode: 0o644,
            mtime: SystemTime::now(),
            uid: 1000,
            gid: 1000,
            nlink: 1,
        };
        let attr = attr_for(7, &InodeKind::File, &attrs);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.mode, libc::S_IFREG as u32 | 0o644);
        assert_eq!(attr.size, 1024);

        let attr = attr_for(8, &InodeKind::Dir { implicit: false }, &attrs);
        assert_eq!(attr.mode, libc::S_IFDIR as u32 | 0o644);
    }
}
