//! S3-compatible object storage.
//!
//! Objects live under flat keys; a "directory" is only ever inferred from the
//! keys sharing a `dir/` prefix and is never written. [`ObjectStorage`] maps
//! the [`Storage`] operations onto an [`ObjectClient`], which is the wire
//! seam: [`S3Client`] talks HTTP to a real endpoint, [`MockObjectClient`]
//! keeps a bucket in memory.

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use super::path::{as_dir, normalize};
use super::{DirEntries, PathInfo, Storage, ensure_parent};
use crate::error::{StorageError, StorageResult};

mod mock;
mod s3;
mod sigv4;

pub use mock::MockObjectClient;
pub use s3::{S3Client, S3Credentials, S3Location};

/// Keys returned per listing request.
pub const MAX_KEYS_PER_PAGE: usize = 1000;
/// Keys accepted by one bulk delete request.
pub const MAX_KEYS_PER_DELETE: usize = 1000;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no such key")]
    NoSuchKey,

    #[error("{0}")]
    Backend(String),
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

pub trait ObjectClient: Send + Sync {
    /// Bucket and endpoint, without credentials.
    fn describe(&self) -> String;

    /// Keys starting with `prefix`, at most [`MAX_KEYS_PER_PAGE`] per page.
    fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, ClientError>;

    fn head_object(&self, key: &str) -> Result<bool, ClientError>;

    /// Streams the object into `sink`, returning the number of bytes written.
    fn get_object(&self, key: &str, sink: &mut dyn Write) -> Result<u64, ClientError>;

    fn put_object(&self, key: &str, contents: &[u8]) -> Result<(), ClientError>;

    fn delete_object(&self, key: &str) -> Result<(), ClientError>;

    /// Deletes at most [`MAX_KEYS_PER_DELETE`] keys in one request.
    fn delete_objects(&self, keys: &[String]) -> Result<(), ClientError>;
}

pub struct ObjectStorage {
    client: Arc<dyn ObjectClient>,
    identity: String,
}

impl ObjectStorage {
    pub fn new(client: impl ObjectClient + 'static) -> Self {
        Self::from_client(Arc::new(client))
    }

    pub fn from_client(client: Arc<dyn ObjectClient>) -> Self {
        let identity = client.describe();
        Self { client, identity }
    }

    /// Storage over an S3 endpoint; `None` credentials means anonymous access.
    pub fn s3(
        location: S3Location,
        credentials: Option<S3Credentials>,
        timeout: Option<Duration>,
    ) -> StorageResult<Self> {
        let identity = location.describe();
        let client = S3Client::new(location, credentials, timeout)
            .map_err(|err| StorageError::failure(&identity, "", err))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Arc<dyn ObjectClient> {
        &self.client
    }

    fn translate(&self, path: &str, err: ClientError) -> StorageError {
        match err {
            ClientError::NoSuchKey => StorageError::not_found(&self.identity, path),
            ClientError::Backend(reason) => StorageError::failure(&self.identity, path, reason),
        }
    }

    /// Every key below `prefix`, following continuation tokens.
    fn all_keys(&self, prefix: &str, path: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_page(prefix, token.as_deref())
                .map_err(|err| self.translate(path, err))?;
            keys.extend(page.keys);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }
}

fn object_key(path: &str) -> String {
    normalize(path).trim_start_matches('/').to_string()
}

fn dir_prefix(path: &str) -> String {
    as_dir(&object_key(path))
}

impl Storage for ObjectStorage {
    fn describe(&self) -> String {
        self.identity.clone()
    }

    fn is_file(&self, path: &str) -> bool {
        let key = object_key(path);
        if key.is_empty() || key.ends_with('/') {
            return false;
        }
        match self.client.head_object(&key) {
            Ok(found) => found,
            Err(err) => {
                warn!(backend = %self.identity, path, error = %err, "object lookup failed");
                false
            }
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = dir_prefix(path);
        match self.client.list_page(&prefix, None) {
            Ok(page) => !page.keys.is_empty(),
            Err(err) => {
                warn!(backend = %self.identity, path, error = %err, "prefix lookup failed");
                false
            }
        }
    }

    fn list_dir(&self, path: &str) -> StorageResult<DirEntries<'_>> {
        let prefix = dir_prefix(path);
        let first = self
            .client
            .list_page(&prefix, None)
            .map_err(|err| self.translate(path, err))?;
        if first.keys.is_empty() {
            return Err(if self.is_file(path) {
                StorageError::not_a_directory(&self.identity, path)
            } else {
                StorageError::not_found(&self.identity, path)
            });
        }
        Ok(Box::new(ObjectListing {
            storage: self,
            path: path.to_string(),
            prefix,
            buffered: first.keys.into(),
            next_token: first.next_token,
            seen: HashSet::new(),
            failed: false,
        }))
    }

    fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let key = object_key(path);
        if key.is_empty() || key.ends_with('/') {
            return Err(StorageError::is_a_directory(&self.identity, path));
        }
        let mut contents = Vec::new();
        match self.client.get_object(&key, &mut contents) {
            Ok(_) => Ok(contents),
            Err(ClientError::NoSuchKey) if self.is_dir(path) => {
                Err(StorageError::is_a_directory(&self.identity, path))
            }
            Err(err) => Err(self.translate(path, err)),
        }
    }

    fn write(&self, path: &str, contents: &[u8]) -> StorageResult<()> {
        let key = object_key(path);
        if key.is_empty() || key.ends_with('/') {
            return Err(StorageError::is_a_directory(&self.identity, path));
        }
        self.client
            .put_object(&key, contents)
            .map_err(|err| self.translate(path, err))
    }

    fn remove(&self, path: &str) -> StorageResult<()> {
        let prefix = dir_prefix(path);
        let keys = self.all_keys(&prefix, path)?;
        if !keys.is_empty() {
            for chunk in keys.chunks(MAX_KEYS_PER_DELETE) {
                self.client
                    .delete_objects(chunk)
                    .map_err(|err| self.translate(path, err))?;
            }
            debug!(backend = %self.identity, path, keys = keys.len(), "removed prefix");
            return Ok(());
        }
        let key = object_key(path);
        if key.is_empty() || !self.is_file(path) {
            return Err(StorageError::not_found(&self.identity, path));
        }
        self.client
            .delete_object(&key)
            .map_err(|err| self.translate(path, err))
    }

    fn store_to_local_file(&self, src: &str, dest: &Path) -> StorageResult<()> {
        if !self.is_file(src) {
            return Err(StorageError::not_found(&self.identity, src));
        }
        let dest_display = dest.display().to_string();
        ensure_parent(dest)
            .map_err(|err| StorageError::failure(&self.identity, &dest_display, err))?;
        let mut file = File::create(dest)
            .map_err(|err| StorageError::failure(&self.identity, &dest_display, err))?;
        let outcome = self
            .client
            .get_object(&object_key(src), &mut file)
            .and_then(|_| {
                file.flush()
                    .map_err(|err| ClientError::Backend(format!("failed to flush {dest_display}: {err}")))
            });
        if let Err(err) = outcome {
            drop(file);
            let _ = fs::remove_file(dest);
            return Err(self.translate(src, err));
        }
        Ok(())
    }
}

/// Lazy listing that pages through the prefix and surfaces each direct child
/// once.
struct ObjectListing<'a> {
    storage: &'a ObjectStorage,
    path: String,
    prefix: String,
    buffered: VecDeque<String>,
    next_token: Option<String>,
    seen: HashSet<String>,
    failed: bool,
}

impl Iterator for ObjectListing<'_> {
    type Item = StorageResult<PathInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(key) = self.buffered.pop_front() {
                let Some(relative) = key.strip_prefix(self.prefix.as_str()) else {
                    continue;
                };
                let (name, is_dir) = match relative.split_once('/') {
                    Some((first, _)) => (first, true),
                    None => (relative, false),
                };
                if name.is_empty() || !self.seen.insert(name.to_string()) {
                    continue;
                }
                return Some(Ok(if is_dir {
                    PathInfo::dir(name)
                } else {
                    PathInfo::file(name)
                }));
            }
            let token = self.next_token.take()?;
            match self.storage.client.list_page(&self.prefix, Some(&token)) {
                Ok(page) => {
                    self.buffered = page.keys.into();
                    self.next_token = page.next_token;
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(self.storage.translate(&self.path, err)));
                }
            }
        }
    }
}
