//! Uniform file-tree access over the local filesystem, S3-compatible object
//! stores and an in-process map.
//!
//! The three backends disagree about what a directory is: the filesystem has
//! real ones, object stores infer them from shared key prefixes and the
//! in-memory store keeps explicit marker entries. [`Storage`] hides that
//! behind one set of operations on POSIX-style paths.

use std::collections::VecDeque;
use std::path::Path;

use tracing::debug;

use crate::error::StorageResult;

pub mod archive;
pub mod local;
pub mod memory;
pub mod object;
pub mod path;

pub use archive::{ArchiveChunks, ArchiveError, ByteChunks, DirectoryArchive, file_chunks};
pub use local::LocalStorage;
pub use memory::InMemoryStorage;
pub use object::{ObjectClient, ObjectStorage, S3Client, S3Credentials, S3Location};

/// One entry of a shallow directory listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathInfo {
    pub name: String,
    pub is_dir: bool,
    pub is_file: bool,
}

impl PathInfo {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            is_file: true,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            is_file: false,
        }
    }
}

/// Lazy listing of direct children. Not restartable: a second listing is a
/// new call.
pub type DirEntries<'a> = Box<dyn Iterator<Item = StorageResult<PathInfo>> + 'a>;

pub trait Storage: Send + Sync {
    /// Backend identity used in errors and logs. Never includes credentials.
    fn describe(&self) -> String;

    fn exists(&self, path: &str) -> bool {
        self.is_file(path) || self.is_dir(path)
    }

    fn is_file(&self, path: &str) -> bool;

    fn is_dir(&self, path: &str) -> bool;

    /// Direct children of `path`; fails with `NotADirectory` for a file and
    /// `NotFound` for an absent path.
    fn list_dir(&self, path: &str) -> StorageResult<DirEntries<'_>>;

    fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Creates missing parent directories and replaces existing content.
    fn write(&self, path: &str, contents: &[u8]) -> StorageResult<()>;

    /// Removes a file, or everything below a directory.
    fn remove(&self, path: &str) -> StorageResult<()>;

    /// Copies one file of this backend onto the local filesystem.
    fn store_to_local_file(&self, src: &str, dest: &Path) -> StorageResult<()>;

    /// Copies the tree at `source_path` in `source` to `dest_path` in `self`.
    fn copy_from(
        &self,
        source: &dyn Storage,
        source_path: &str,
        dest_path: &str,
    ) -> StorageResult<()> {
        let copied = walk_files(source, source_path, dest_path, |file, target| {
            let contents = source.read(file)?;
            self.write(target, &contents)
        })?;
        debug!(
            from = %source.describe(),
            to = %self.describe(),
            source_path,
            dest_path,
            files = copied,
            "copied tree"
        );
        Ok(())
    }
}

/// Breadth-first walk of the files below `source_path`, calling `transfer`
/// with each file and its destination rebased under `dest_path`.
///
/// When `source_path` is itself a file, its destination is `dest_path`.
pub fn walk_files<F>(
    source: &dyn Storage,
    source_path: &str,
    dest_path: &str,
    mut transfer: F,
) -> StorageResult<usize>
where
    F: FnMut(&str, &str) -> StorageResult<()>,
{
    let mut pending = VecDeque::from([path::normalize(source_path)]);
    let mut copied = 0;
    while let Some(current) = pending.pop_front() {
        if source.is_file(&current) {
            let relative = path::relative_to(&current, source_path)
                .unwrap_or_else(|| path::file_name(&current).to_string());
            let target = path::join(dest_path, &relative);
            transfer(&current, &target)?;
            copied += 1;
            continue;
        }
        for entry in source.list_dir(&current)? {
            let entry = entry?;
            pending.push_back(path::join(&current, &entry.name));
        }
    }
    Ok(copied)
}

pub(crate) fn ensure_parent(dest: &Path) -> std::io::Result<()> {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
