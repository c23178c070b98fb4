use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use super::metadata::{ConcreteDefinition, Manifest, RetrievedMetadata};
use super::source::WorkflowPackage;

/// Reentrancy counter: `acquire` reports the first entry, `release` the last
/// exit. Not a lock.
#[derive(Debug, Default)]
pub struct ScopeCounter {
    depth: AtomicUsize,
    total: AtomicUsize,
}

impl ScopeCounter {
    /// Returns `true` when this is the outermost acquisition.
    pub fn acquire(&self) -> bool {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.depth.fetch_add(1, Ordering::SeqCst) == 0
    }

    /// Returns `true` when the depth dropped to zero.
    pub fn release(&self) -> bool {
        self.depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| depth.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }

    /// Undoes an acquisition whose setup failed.
    pub fn rollback(&self) {
        self.release();
        let _ = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| total.checked_sub(1));
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Registry of retrieved packages keyed by name.
///
/// Getters hand out copies, so callers never hold the registry lock. Entering
/// a scope only counts; resource handling belongs to the downloader.
#[derive(Debug, Default)]
pub struct PackageMetadataCollection {
    metadata: Mutex<BTreeMap<String, RetrievedMetadata>>,
    owner: Mutex<Option<WorkflowPackage>>,
    counter: ScopeCounter,
}

impl PackageMetadataCollection {
    pub fn new(owner: Option<WorkflowPackage>) -> Self {
        Self {
            owner: Mutex::new(owner),
            ..Self::default()
        }
    }

    pub fn with_metadata(
        owner: Option<WorkflowPackage>,
        metadata: BTreeMap<String, RetrievedMetadata>,
    ) -> Self {
        Self {
            metadata: Mutex::new(metadata),
            owner: Mutex::new(owner),
            counter: ScopeCounter::default(),
        }
    }

    pub fn upsert_metadata(&self, name: impl Into<String>, metadata: RetrievedMetadata) {
        self.metadata.lock().insert(name.into(), metadata);
    }

    pub fn metadata(&self, name: &str) -> Option<RetrievedMetadata> {
        self.metadata.lock().get(name).cloned()
    }

    pub fn all_metadata(&self) -> BTreeMap<String, RetrievedMetadata> {
        self.metadata.lock().clone()
    }

    pub fn package_names(&self) -> Vec<String> {
        self.metadata.lock().keys().cloned().collect()
    }

    pub fn concrete_definition(&self, name: &str) -> Option<ConcreteDefinition> {
        self.with_entry(name, |entry| entry.definition.clone())
    }

    pub fn manifest(&self, name: &str) -> Option<Manifest> {
        self.with_entry(name, |entry| entry.manifest_data.clone())
    }

    pub fn data_files(&self, name: &str) -> Option<Vec<String>> {
        self.with_entry(name, |entry| entry.data_files.clone())
    }

    pub fn root_directory(&self, name: &str) -> Option<PathBuf> {
        self.with_entry(name, |entry| entry.root_directory.clone())
            .flatten()
    }

    pub fn location(&self, name: &str) -> Option<PathBuf> {
        self.with_entry(name, |entry| entry.location.clone())
    }

    fn with_entry<T>(&self, name: &str, read: impl FnOnce(&RetrievedMetadata) -> T) -> Option<T> {
        self.metadata.lock().get(name).map(read)
    }

    /// Platforms every registered package supports, sorted. Empty when no
    /// package is registered.
    pub fn common_platforms(&self) -> Vec<String> {
        let metadata = self.metadata.lock();
        let mut common: Option<BTreeSet<&str>> = None;
        for entry in metadata.values() {
            let platforms: BTreeSet<&str> = entry
                .definition
                .platforms
                .iter()
                .map(String::as_str)
                .collect();
            common = Some(match common {
                None => platforms,
                Some(current) => current.intersection(&platforms).copied().collect(),
            });
        }
        common
            .unwrap_or_default()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn owner(&self) -> Option<WorkflowPackage> {
        self.owner.lock().clone()
    }

    /// Replaces the owner; a change after the first scope is logged.
    pub fn set_owner(&self, owner: Option<WorkflowPackage>) {
        let mut current = self.owner.lock();
        if self.counter.total() > 0 && *current != owner {
            let name = |package: &Option<WorkflowPackage>| {
                package
                    .as_ref()
                    .map_or_else(|| "*none*".to_string(), |package| package.name.clone())
            };
            warn!(from = %name(&*current), to = %name(&owner), "changing owner package");
        }
        *current = owner;
    }

    pub(crate) fn update_owner(&self, update: impl FnOnce(&mut WorkflowPackage)) {
        if let Some(owner) = self.owner.lock().as_mut() {
            update(owner);
        }
    }

    pub fn enter(&self) -> CollectionScope<'_> {
        self.counter.acquire();
        CollectionScope { collection: self }
    }

    pub fn depth(&self) -> usize {
        self.counter.depth()
    }

    pub fn times_entered(&self) -> usize {
        self.counter.total()
    }

    pub(crate) fn counter(&self) -> &ScopeCounter {
        &self.counter
    }
}

/// Held while a caller uses the collection; dropping it exits the scope.
#[derive(Debug)]
pub struct CollectionScope<'a> {
    collection: &'a PackageMetadataCollection,
}

impl std::ops::Deref for CollectionScope<'_> {
    type Target = PackageMetadataCollection;

    fn deref(&self) -> &Self::Target {
        self.collection
    }
}

impl Drop for CollectionScope<'_> {
    fn drop(&mut self) {
        self.collection.counter.release();
    }
}
