use std::collections::BTreeMap;
use std::io::Write;

use parking_lot::Mutex;

use super::{ClientError, ListPage, MAX_KEYS_PER_DELETE, MAX_KEYS_PER_PAGE, ObjectClient};

/// Flat in-memory bucket speaking the [`ObjectClient`] protocol.
///
/// Records delete traffic so callers can assert on batching.
#[derive(Debug)]
pub struct MockObjectClient {
    name: String,
    page_size: usize,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    delete_batches: Mutex<Vec<usize>>,
    single_deletes: Mutex<usize>,
}

impl MockObjectClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            page_size: MAX_KEYS_PER_PAGE,
            objects: Mutex::new(BTreeMap::new()),
            delete_batches: Mutex::new(Vec::new()),
            single_deletes: Mutex::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_KEYS_PER_PAGE);
        self
    }

    pub fn insert(&self, key: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.objects.lock().insert(key.into(), contents.into());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Sizes of every bulk delete request, in order.
    pub fn delete_batches(&self) -> Vec<usize> {
        self.delete_batches.lock().clone()
    }

    pub fn single_deletes(&self) -> usize {
        *self.single_deletes.lock()
    }
}

impl ObjectClient for MockObjectClient {
    fn describe(&self) -> String {
        format!("mock bucket {}", self.name)
    }

    fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, ClientError> {
        let objects = self.objects.lock();
        let start = token.unwrap_or(prefix).to_string();
        let mut keys = Vec::new();
        let mut next_token = None;
        for key in objects.range(start..).map(|(key, _)| key) {
            if !key.starts_with(prefix) {
                break;
            }
            if token.is_some_and(|after| key.as_str() == after) {
                continue;
            }
            if keys.len() == self.page_size {
                next_token = keys.last().cloned();
                break;
            }
            keys.push(key.clone());
        }
        Ok(ListPage { keys, next_token })
    }

    fn head_object(&self, key: &str) -> Result<bool, ClientError> {
        Ok(self.objects.lock().contains_key(key))
    }

    fn get_object(&self, key: &str, sink: &mut dyn Write) -> Result<u64, ClientError> {
        let contents = self
            .objects
            .lock()
            .get(key)
            .cloned()
            .ok_or(ClientError::NoSuchKey)?;
        sink.write_all(&contents)
            .map_err(|err| ClientError::Backend(format!("failed to write {key}: {err}")))?;
        Ok(contents.len() as u64)
    }

    fn put_object(&self, key: &str, contents: &[u8]) -> Result<(), ClientError> {
        self.insert(key, contents);
        Ok(())
    }

    fn delete_object(&self, key: &str) -> Result<(), ClientError> {
        *self.single_deletes.lock() += 1;
        self.objects.lock().remove(key);
        Ok(())
    }

    fn delete_objects(&self, keys: &[String]) -> Result<(), ClientError> {
        if keys.len() > MAX_KEYS_PER_DELETE {
            return Err(ClientError::Backend(format!(
                "bulk delete of {} keys exceeds the limit of {MAX_KEYS_PER_DELETE}",
                keys.len()
            )));
        }
        self.delete_batches.lock().push(keys.len());
        let mut objects = self.objects.lock();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }
}
