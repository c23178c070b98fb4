use std::fs;
use std::path::Path;

use tracing::debug;

use super::{DirEntries, PathInfo, Storage, ensure_parent, walk_files};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "local filesystem";

/// The real filesystem. Directories are native.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Storage for LocalStorage {
    fn describe(&self) -> String {
        BACKEND.to_string()
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn is_file(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    fn is_dir(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }

    fn list_dir(&self, path: &str) -> StorageResult<DirEntries<'_>> {
        let target = Path::new(path);
        if target.is_file() {
            return Err(StorageError::not_a_directory(BACKEND, path));
        }
        let entries = fs::read_dir(target).map_err(|err| StorageError::from_io(BACKEND, path, err))?;
        let owner = path.to_string();
        Ok(Box::new(entries.map(move |entry| {
            let entry = entry.map_err(|err| StorageError::from_io(BACKEND, &owner, err))?;
            // Follow symlinks so a linked directory lists as a directory.
            let entry_path = entry.path();
            Ok(PathInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry_path.is_dir(),
                is_file: entry_path.is_file(),
            })
        })))
    }

    fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        if Path::new(path).is_dir() {
            return Err(StorageError::is_a_directory(BACKEND, path));
        }
        fs::read(path).map_err(|err| StorageError::from_io(BACKEND, path, err))
    }

    fn write(&self, path: &str, contents: &[u8]) -> StorageResult<()> {
        let target = Path::new(path);
        if target.is_dir() {
            return Err(StorageError::is_a_directory(BACKEND, path));
        }
        ensure_parent(target).map_err(|err| StorageError::failure(BACKEND, path, err))?;
        fs::write(target, contents).map_err(|err| StorageError::from_io(BACKEND, path, err))
    }

    fn remove(&self, path: &str) -> StorageResult<()> {
        let target = Path::new(path);
        let outcome = if target.is_dir() {
            fs::remove_dir_all(target)
        } else {
            fs::remove_file(target)
        };
        outcome.map_err(|err| StorageError::from_io(BACKEND, path, err))
    }

    fn store_to_local_file(&self, src: &str, dest: &Path) -> StorageResult<()> {
        if !self.is_file(src) {
            return Err(StorageError::not_found(BACKEND, src));
        }
        ensure_parent(dest)
            .map_err(|err| StorageError::failure(BACKEND, dest.display().to_string(), err))?;
        fs::copy(src, dest)
            .map(|_| ())
            .map_err(|err| StorageError::from_io(BACKEND, src, err))
    }

    /// Streams every file through `source.store_to_local_file` instead of
    /// holding whole files in memory.
    fn copy_from(
        &self,
        source: &dyn Storage,
        source_path: &str,
        dest_path: &str,
    ) -> StorageResult<()> {
        let copied = walk_files(source, source_path, dest_path, |file, target| {
            source.store_to_local_file(file, Path::new(target))
        })?;
        debug!(
            from = %source.describe(),
            source_path,
            dest_path,
            files = copied,
            "copied tree to local filesystem"
        );
        Ok(())
    }
}
