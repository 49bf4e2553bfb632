//! Reconciles the flat object namespace into POSIX directory views.
//!
//! A directory is a listing prefix. Objects directly under it become file or
//! symlink entries, collapsed prefixes become child directories. The store
//! allows `foo` and `foo/` to coexist; the listing keeps both by tagging the
//! non-directory with a conflict suffix that is illegal in object names, so
//! the tagged name can never collide with a real object.

use std::sync::Arc;

use futures::StreamExt;
use tracing::instrument;

use crate::bucket::{Bucket, ListRequest, ObjectRecord};
use crate::{Error, Result};

/// Appended to a file or symlink entry that shares its name with a
/// directory. U+000A cannot appear in object names.
pub const CONFLICT_SUFFIX: char = '\n';

/// Concurrent placeholder stats while filtering non-implicit directories.
const PLACEHOLDER_STAT_PARALLELISM: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    /// Name within the parent, conflict-suffixed when shadowed by a
    /// same-named directory.
    pub name: String,
    pub kind: EntryKind,
    /// Backing record; absent for directories known only from a collapsed
    /// prefix.
    pub record: Option<ObjectRecord>,
    /// Position in the directory, starting at 1.
    pub offset: u64,
}

/// Result of resolving one child name within a parent prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Child {
    pub kind: EntryKind,
    /// Fully qualified object name; directories end with `/`.
    pub object_name: String,
    pub record: Option<ObjectRecord>,
    /// Directory inferred from objects below it, with no placeholder.
    pub implicit: bool,
}

fn entry_kind(record: &ObjectRecord) -> EntryKind {
    if record.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}

/// Produces the complete, sorted, conflict-resolved entry list for the
/// directory at `prefix` (empty for the root, `…/`-terminated otherwise).
#[instrument(skip(bucket), level = "debug")]
pub async fn list_directory(
    bucket: &Arc<dyn Bucket>,
    prefix: &str,
    implicit_dirs: bool,
) -> Result<Vec<DirEntry>> {
    let mut objects = Vec::new();
    // A prefix group can straddle a page boundary and be reported twice.
    let mut subdirs = std::collections::BTreeSet::new();

    let mut continuation_token = None;
    loop {
        let listing = bucket
            .list_objects(&ListRequest {
                prefix: prefix.to_owned(),
                delimiter: Some('/'),
                continuation_token,
                max_results: None,
            })
            .await?;

        for record in listing.objects {
            // The directory's own placeholder lists under its prefix.
            if record.name == prefix {
                continue;
            }
            objects.push(record);
        }
        subdirs.extend(listing.collapsed_prefixes);

        match listing.next_token {
            Some(token) => continuation_token = Some(token),
            None => break,
        }
    }

    let mut subdirs: Vec<String> = subdirs.into_iter().collect();
    if !implicit_dirs {
        subdirs = filter_unbacked_directories(bucket, subdirs).await?;
    }

    let mut entries: Vec<DirEntry> = Vec::with_capacity(objects.len() + subdirs.len());
    for record in objects {
        entries.push(DirEntry {
            name: record.name[prefix.len()..].to_owned(),
            kind: entry_kind(&record),
            record: Some(record),
            offset: 0,
        });
    }
    for dir in subdirs {
        let name = dir[prefix.len()..]
            .strip_suffix('/')
            .unwrap_or(&dir[prefix.len()..])
            .to_owned();
        entries.push(DirEntry {
            name,
            kind: EntryKind::Dir,
            record: None,
            offset: 0,
        });
    }

    // Directories sort before a same-named file so the conflict walk sees
    // the pair in a fixed order; the suffix keeps the final list sorted.
    entries.sort_by(|a, b| {
        (a.name.as_str(), a.kind != EntryKind::Dir).cmp(&(b.name.as_str(), b.kind != EntryKind::Dir))
    });
    for i in 1..entries.len() {
        if entries[i].name == entries[i - 1].name {
            entries[i].name.push(CONFLICT_SUFFIX);
        }
    }

    for (i, entry) in entries.iter_mut().enumerate() {
        entry.offset = i as u64 + 1;
    }
    Ok(entries)
}

/// Keeps only collapsed prefixes backed by a placeholder object, statting
/// them with bounded parallelism.
async fn filter_unbacked_directories(
    bucket: &Arc<dyn Bucket>,
    subdirs: Vec<String>,
) -> Result<Vec<String>> {
    let checked: Vec<Result<Option<String>>> = futures::stream::iter(subdirs)
        .map(|dir| {
            let bucket = bucket.clone();
            async move {
                match bucket.stat_object(&dir).await {
                    Ok(_) => Ok(Some(dir)),
                    Err(Error::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        })
        .buffer_unordered(PLACEHOLDER_STAT_PARALLELISM)
        .collect()
        .await;

    let mut kept = Vec::new();
    for result in checked {
        if let Some(dir) = result? {
            kept.push(dir);
        }
    }
    // buffer_unordered scrambles completion order.
    kept.sort();
    Ok(kept)
}

/// Resolves whether `dir_name` (`…/`-terminated) exists, either as a
/// placeholder or, when enabled, implicitly through objects below it.
async fn directory_exists(
    bucket: &Arc<dyn Bucket>,
    dir_name: &str,
    implicit_dirs: bool,
) -> Result<Option<(Option<ObjectRecord>, bool)>> {
    match bucket.stat_object(dir_name).await {
        Ok(record) => return Ok(Some((Some(record), false))),
        Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    if !implicit_dirs {
        return Ok(None);
    }
    let listing = bucket
        .list_objects(&ListRequest {
            prefix: dir_name.to_owned(),
            delimiter: Some('/'),
            max_results: Some(1),
            continuation_token: None,
        })
        .await?;
    if listing.objects.is_empty() && listing.collapsed_prefixes.is_empty() {
        Ok(None)
    } else {
        Ok(Some((None, true)))
    }
}

/// Resolves child `name` within `parent_prefix`. The file and directory
/// stats race in parallel; a directory wins any tie. The conflict-suffixed
/// form resolves to the file, and only while the directory still exists.
#[instrument(skip(bucket), level = "debug")]
pub async fn lookup_child(
    bucket: &Arc<dyn Bucket>,
    parent_prefix: &str,
    name: &str,
    implicit_dirs: bool,
) -> Result<Option<Child>> {
    if let Some(stripped) = name.strip_suffix(CONFLICT_SUFFIX) {
        if stripped.is_empty() || stripped.contains(CONFLICT_SUFFIX) {
            return Ok(None);
        }
        let file_name = format!("{parent_prefix}{stripped}");
        let dir_name = format!("{file_name}/");
        let (file_res, dir_res) = tokio::join!(
            bucket.stat_object(&file_name),
            directory_exists(bucket, &dir_name, implicit_dirs)
        );
        if dir_res?.is_none() {
            // Without the directory the bare name is the file's own; the
            // suffixed alias does not exist.
            return Ok(None);
        }
        return match file_res {
            Ok(record) => Ok(Some(Child {
                kind: entry_kind(&record),
                object_name: file_name,
                record: Some(record),
                implicit: false,
            })),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        };
    }

    if name.is_empty() || name.contains('/') || name.contains(CONFLICT_SUFFIX) {
        return Ok(None);
    }

    let file_name = format!("{parent_prefix}{name}");
    let dir_name = format!("{file_name}/");
    let (file_res, dir_res) = tokio::join!(
        bucket.stat_object(&file_name),
        directory_exists(bucket, &dir_name, implicit_dirs)
    );

    if let Some((record, implicit)) = dir_res? {
        return Ok(Some(Child {
            kind: EntryKind::Dir,
            object_name: dir_name,
            record,
            implicit,
        }));
    }
    match file_res {
        Ok(record) => Ok(Some(Child {
            kind: entry_kind(&record),
            object_name: file_name,
            record: Some(record),
            implicit: false,
        })),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
