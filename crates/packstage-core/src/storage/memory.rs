use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;

use super::path::normalize;
use super::{DirEntries, PathInfo, Storage, ensure_parent};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "in-memory storage";
const ROOT: &str = "/";

/// Path → content map where directories are explicit marker entries.
///
/// Keys are absolute. A key ending in `/` with no content marks a directory,
/// every other key holds a file. Every ancestor of every entry has a marker
/// and `/` is always present. Removing entries leaves emptied parents behind.
#[derive(Debug)]
pub struct InMemoryStorage {
    entries: RwLock<BTreeMap<String, Option<Vec<u8>>>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(ROOT.to_string(), None);
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Seeds the store; a `None` value creates an (empty) directory. Fails
    /// when a seed path passes through a file or replaces a directory with one.
    pub fn from_entries<I, P>(seed: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = (P, Option<Vec<u8>>)>,
        P: AsRef<str>,
    {
        let storage = Self::new();
        {
            let mut entries = storage.entries.write();
            for (path, contents) in seed {
                let path = path.as_ref();
                let key = tidy(path, contents.is_none());
                check_ancestors(&entries, &key)?;
                if contents.is_some() && Self::has_dir(&entries, &tidy(path, true)) {
                    return Err(StorageError::is_a_directory(BACKEND, path));
                }
                mark_ancestors(&mut entries, &key);
                entries.insert(key, contents);
            }
        }
        Ok(storage)
    }

    /// Copy of the raw entries, markers included.
    pub fn snapshot(&self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_dir(entries: &BTreeMap<String, Option<Vec<u8>>>, dir: &str) -> bool {
        entries
            .range(dir.to_string()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(dir))
    }
}

fn tidy(path: &str, is_dir: bool) -> String {
    let mut key = normalize(path);
    if !key.starts_with('/') {
        key.insert(0, '/');
    }
    if is_dir && !key.ends_with('/') {
        key.push('/');
    }
    key
}

/// No ancestor of `key` may hold file content.
fn check_ancestors(entries: &BTreeMap<String, Option<Vec<u8>>>, key: &str) -> StorageResult<()> {
    for (idx, _) in key.match_indices('/').filter(|(idx, _)| *idx > 0) {
        if let Some(Some(_)) = entries.get(&key[..idx]) {
            return Err(StorageError::not_a_directory(BACKEND, &key[..idx]));
        }
    }
    Ok(())
}

fn mark_ancestors(entries: &mut BTreeMap<String, Option<Vec<u8>>>, key: &str) {
    for (idx, _) in key.match_indices('/') {
        entries
            .entry(key[..=idx].to_string())
            .or_insert(None);
    }
}

impl Storage for InMemoryStorage {
    fn describe(&self) -> String {
        BACKEND.to_string()
    }

    fn is_file(&self, path: &str) -> bool {
        let key = tidy(path, false);
        if key.ends_with('/') {
            return false;
        }
        matches!(self.entries.read().get(&key), Some(Some(_)))
    }

    fn is_dir(&self, path: &str) -> bool {
        let dir = tidy(path, true);
        Self::has_dir(&self.entries.read(), &dir)
    }

    fn list_dir(&self, path: &str) -> StorageResult<DirEntries<'_>> {
        let dir = tidy(path, true);
        let entries = self.entries.read();
        if !Self::has_dir(&entries, &dir) {
            let key = tidy(path, false);
            return Err(match entries.get(&key) {
                Some(Some(_)) => StorageError::not_a_directory(BACKEND, path),
                _ => StorageError::not_found(BACKEND, path),
            });
        }
        let mut children = Vec::new();
        for (key, contents) in entries.range(dir.clone()..) {
            let Some(rest) = key.strip_prefix(dir.as_str()) else {
                break;
            };
            if rest.is_empty() {
                continue;
            }
            match contents {
                None => {
                    if let Some(name) = rest.strip_suffix('/')
                        && !name.contains('/')
                    {
                        children.push(Ok(PathInfo::dir(name)));
                    }
                }
                Some(_) => {
                    if !rest.contains('/') {
                        children.push(Ok(PathInfo::file(rest)));
                    }
                }
            }
        }
        Ok(Box::new(children.into_iter()))
    }

    fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let key = tidy(path, false);
        let entries = self.entries.read();
        if key.ends_with('/') {
            return Err(StorageError::is_a_directory(BACKEND, path));
        }
        match entries.get(&key) {
            Some(Some(contents)) => Ok(contents.clone()),
            _ if Self::has_dir(&entries, &tidy(path, true)) => {
                Err(StorageError::is_a_directory(BACKEND, path))
            }
            _ => Err(StorageError::not_found(BACKEND, path)),
        }
    }

    fn write(&self, path: &str, contents: &[u8]) -> StorageResult<()> {
        let key = tidy(path, false);
        let mut entries = self.entries.write();
        if key.ends_with('/') || Self::has_dir(&entries, &tidy(path, true)) {
            return Err(StorageError::is_a_directory(BACKEND, path));
        }
        check_ancestors(&entries, &key)?;
        mark_ancestors(&mut entries, &key);
        entries.insert(key, Some(contents.to_vec()));
        Ok(())
    }

    fn remove(&self, path: &str) -> StorageResult<()> {
        let mut entries = self.entries.write();
        let dir = tidy(path, true);
        if Self::has_dir(&entries, &dir) {
            entries.retain(|key, _| !key.starts_with(dir.as_str()));
            entries.entry(ROOT.to_string()).or_insert(None);
            return Ok(());
        }
        let key = tidy(path, false);
        match entries.remove(&key) {
            Some(_) => Ok(()),
            None => Err(StorageError::not_found(BACKEND, path)),
        }
    }

    fn store_to_local_file(&self, src: &str, dest: &Path) -> StorageResult<()> {
        if !self.is_file(src) {
            return Err(StorageError::not_found(BACKEND, src));
        }
        let contents = self.read(src)?;
        let dest_display = dest.display().to_string();
        ensure_parent(dest).map_err(|err| StorageError::failure(BACKEND, &dest_display, err))?;
        fs::write(dest, contents).map_err(|err| StorageError::failure(BACKEND, &dest_display, err))
    }
}
