//! File stat snapshots and the change predicates built on them.

use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};

use crate::types::{FileStat, Inode};

/// Stats `path`, returning `None` if it does not exist.
///
/// # Errors
///
/// Returns any I/O error other than not-found.
pub async fn stat_for(path: &Path) -> io::Result<Option<FileStat>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(from_metadata(&meta))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Builds a [`FileStat`] from already fetched metadata.
#[must_use]
pub fn from_metadata(meta: &Metadata) -> FileStat {
    let mtime = meta
        .modified()
        .map_or_else(|_| DateTime::<Utc>::from(UNIX_EPOCH), DateTime::<Utc>::from);
    FileStat {
        inode: inode_of(meta),
        size: meta.len(),
        mtime,
    }
}

#[cfg(unix)]
fn inode_of(meta: &Metadata) -> Inode {
    use std::os::unix::fs::MetadataExt;

    let dev = meta.dev();
    Inode {
        number: meta.ino(),
        major: ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0fff),
        minor: ((dev >> 12) & 0xffff_ff00) | (dev & 0x00ff),
    }
}

#[cfg(not(unix))]
fn inode_of(_meta: &Metadata) -> Inode {
    Inode::default()
}

/// True when the path went from absent to present.
#[must_use]
pub const fn file_created(old: Option<&FileStat>, new: Option<&FileStat>) -> bool {
    old.is_none() && new.is_some()
}

/// True when the path went from present to absent.
#[must_use]
pub const fn file_deleted(old: Option<&FileStat>, new: Option<&FileStat>) -> bool {
    old.is_some() && new.is_none()
}

/// True when both stats exist and refer to different files.
#[must_use]
pub fn file_replaced(old: Option<&FileStat>, new: Option<&FileStat>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => old.inode != new.inode,
        _ => false,
    }
}

/// True when the file grew, or appeared non-empty.
#[must_use]
pub const fn file_appended(old: Option<&FileStat>, new: Option<&FileStat>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => new.size > old.size,
        (None, Some(new)) => new.size > 0,
        _ => false,
    }
}

/// True when both stats exist and the file shrank.
#[must_use]
pub const fn file_truncated(old: Option<&FileStat>, new: Option<&FileStat>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => new.size < old.size,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn stat(number: u64, size: u64) -> FileStat {
        FileStat {
            inode: Inode {
                number,
                major: 8,
                minor: 1,
            },
            size,
            mtime: DateTime::<Utc>::from(UNIX_EPOCH),
        }
    }

    #[test]
    fn predicates_on_absent_stats() {
        assert!(!file_created(None, None));
        assert!(!file_deleted(None, None));
        assert!(!file_replaced(None, None));
        assert!(!file_appended(None, None));
        assert!(!file_truncated(None, None));
    }

    #[test]
    fn created_and_deleted_are_exclusive() {
        let s = stat(1, 0);
        assert!(file_created(None, Some(&s)));
        assert!(!file_deleted(None, Some(&s)));
        assert!(file_deleted(Some(&s), None));
        assert!(!file_created(Some(&s), None));
    }

    #[test]
    fn appended_from_absent_needs_content() {
        assert!(!file_appended(None, Some(&stat(1, 0))));
        assert!(file_appended(None, Some(&stat(1, 3))));
    }

    #[test]
    fn replaced_compares_device_too() {
        let a = stat(1, 10);
        let mut b = stat(1, 10);
        b.inode.minor = 2;
        assert!(file_replaced(Some(&a), Some(&b)));
        assert!(!file_replaced(Some(&a), Some(&a.clone())));
    }

    #[test]
    fn truncated_requires_both() {
        assert!(file_truncated(Some(&stat(1, 10)), Some(&stat(1, 4))));
        assert!(!file_truncated(None, Some(&stat(1, 4))));
        assert!(!file_truncated(Some(&stat(1, 10)), Some(&stat(1, 10))));
    }

    #[tokio::test]
    async fn stat_for_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stat = stat_for(&dir.path().join("absent.log"))
            .await
            .expect("stat");
        assert!(stat.is_none());
    }

    #[tokio::test]
    async fn stat_for_reports_size_and_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.log");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(b"Hello, world!\n").expect("write");
        drop(file);

        let first = stat_for(&path).await.expect("stat").expect("present");
        assert_eq!(first.size, 14);

        let second = stat_for(&path).await.expect("stat").expect("present");
        assert_eq!(first.inode, second.inode);

        std::fs::remove_file(&path).expect("remove");
        std::fs::write(&path, b"x").expect("recreate");
        let third = stat_for(&path).await.expect("stat").expect("present");
        assert_eq!(third.size, 1);
    }
}
