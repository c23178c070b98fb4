use std::env;
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use packstage_secrets::{InMemorySecrets, SecretStore};
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::collection::PackageMetadataCollection;
use super::credentials::{
    DatasetResolver, DefaultCredentialSource, NoDefaultCredential, ObjectStoreConnector,
    S3Connector, StaticDatasets, storage_for_source,
};
use super::git::{CloneJob, GitRunner, SystemGit, resolve_git_credential};
use super::metadata::{
    DefinitionLoader, LayoutLoader, StagedAs, load_metadata, manifest_outside_prefix,
    staged_layout,
};
use super::source::{BasePackage, PackageSource, ResolvedSource, WorkflowPackage, resolve_source};
use crate::error::{RetrievalError, RetrievalResult};
use crate::storage::path::file_name;
use crate::storage::{DirectoryArchive, LocalStorage, Storage};

const STAGING_PREFIX: &str = "packstage-";

#[derive(Debug)]
enum Staging {
    /// Nothing retrieved yet.
    Pending,
    Owned(TempDir),
    /// Supplied by the caller; never deleted.
    Existing(PathBuf),
    Released,
}

/// Stages the base packages of a [`WorkflowPackage`] into one private
/// directory and records their metadata.
///
/// The first [`enter`](Self::enter) creates the directory and retrieves every
/// package in declaration order; nested scopes share it and dropping the
/// outermost scope deletes it.
pub struct PackagesDownloader {
    collection: PackageMetadataCollection,
    prefix_dir: PathBuf,
    secrets: Arc<dyn SecretStore>,
    datasets: Arc<dyn DatasetResolver>,
    defaults: Arc<dyn DefaultCredentialSource>,
    connector: Arc<dyn ObjectStoreConnector>,
    git: Arc<dyn GitRunner>,
    loader: Arc<dyn DefinitionLoader>,
    staging: Mutex<Staging>,
}

impl PackagesDownloader {
    pub fn builder(owner: WorkflowPackage) -> DownloaderBuilder {
        DownloaderBuilder::new(owner)
    }

    /// Downloader over a tree that already holds `<root>/<package>` for every
    /// base package.
    pub fn with_existing_root(owner: WorkflowPackage, root: impl Into<PathBuf>) -> Self {
        Self::builder(owner).existing_root(root).build()
    }

    pub fn collection(&self) -> &PackageMetadataCollection {
        &self.collection
    }

    /// Root of the staged packages while a scope is held.
    pub fn staging_root(&self) -> Option<PathBuf> {
        match &*self.staging.lock() {
            Staging::Owned(dir) => Some(dir.path().to_path_buf()),
            Staging::Existing(root) => Some(root.clone()),
            Staging::Pending | Staging::Released => None,
        }
    }

    pub fn enter(&self) -> RetrievalResult<DownloadScope<'_>> {
        let counter = self.collection.counter();
        if !counter.acquire() {
            return Ok(DownloadScope { downloader: self });
        }

        let mut staging = self.staging.lock();
        let outcome = if matches!(*staging, Staging::Pending) {
            match self.create_staging() {
                Ok(dir) => {
                    let populated = self.populate(dir.path(), true);
                    if populated.is_ok() {
                        *staging = Staging::Owned(dir);
                    } else {
                        discard(dir);
                        *staging = Staging::Released;
                    }
                    populated
                }
                Err(err) => Err(err),
            }
        } else {
            match &*staging {
                Staging::Existing(root) => self.populate(root, false),
                Staging::Released => Err(RetrievalError::SessionClosed),
                Staging::Owned(_) | Staging::Pending => Ok(()),
            }
        };

        match outcome {
            Ok(()) => Ok(DownloadScope { downloader: self }),
            Err(err) => {
                counter.rollback();
                Err(err)
            }
        }
    }

    fn create_staging(&self) -> RetrievalResult<TempDir> {
        let staging_error = |source| RetrievalError::Staging {
            path: self.prefix_dir.clone(),
            source,
        };
        fs::create_dir_all(&self.prefix_dir).map_err(staging_error)?;
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.prefix_dir)
            .map_err(staging_error)?;
        info!(path = %dir.path().display(), "created staging directory");
        Ok(dir)
    }

    fn populate(&self, root: &Path, retrieve: bool) -> RetrievalResult<()> {
        let Some(owner) = self.collection.owner() else {
            debug!("no owner package, nothing to stage");
            return Ok(());
        };
        let platform = owner.platform_hint();
        for package in &owner.base.packages {
            check_package_name(&package.name)?;
            let source = package.source_kind()?;
            let package_dir = root.join(&package.name);
            let staged = if retrieve {
                self.retrieve(package, &source, &package_dir)?
            } else {
                match source {
                    PackageSource::Repository(_) => StagedAs::Repository,
                    PackageSource::ObjectStore(_) | PackageSource::Dataset(_) => {
                        StagedAs::ObjectStore
                    }
                }
            };

            let (location, manifest) = staged_layout(&package_dir, &package.config, staged);
            let metadata = load_metadata(
                self.loader.as_ref(),
                &package_dir,
                location.clone(),
                manifest.as_deref(),
                platform,
            )
            .map_err(|err| RetrievalError::InvalidDefinition {
                package: package.name.clone(),
                location,
                reason: err.reason,
            })?;
            self.collection.upsert_metadata(package.name.clone(), metadata);
            info!(package = %package.name, retrieved = retrieve, "package staged");
        }
        Ok(())
    }

    fn retrieve(
        &self,
        package: &BasePackage,
        source: &PackageSource,
        package_dir: &Path,
    ) -> RetrievalResult<StagedAs> {
        if let PackageSource::Dataset(dataset) = source {
            info!(
                package = %package.name,
                dataset = %dataset.credentials_dataset(),
                "resolving dataset to object store"
            );
        }
        match resolve_source(&package.name, source, self.datasets.as_ref())? {
            ResolvedSource::Repository(git) => {
                let credential = resolve_git_credential(
                    &package.name,
                    &git,
                    self.secrets.as_ref(),
                    self.defaults.as_ref(),
                )?;
                let commit = CloneJob {
                    package: &package.name,
                    location: &git.location,
                    credential: credential.as_ref(),
                    dest: package_dir,
                }
                .run(self.git.as_ref())?;
                debug!(package = %package.name, %commit, "cloned repository");
                self.collection.update_owner(|owner| {
                    let git = owner
                        .base
                        .packages
                        .iter_mut()
                        .find(|entry| entry.name == package.name)
                        .and_then(|entry| entry.source.git.as_mut());
                    if let Some(git) = git {
                        git.version = Some(commit);
                    }
                });
                Ok(StagedAs::Repository)
            }
            ResolvedSource::ObjectStore(s3) => {
                info!(
                    package = %package.name,
                    bucket = %s3.location.bucket,
                    "copying package from object store"
                );
                let storage = storage_for_source(
                    &package.name,
                    &s3,
                    self.secrets.as_ref(),
                    self.connector.as_ref(),
                )?;
                fs::create_dir_all(package_dir).map_err(|source| RetrievalError::Staging {
                    path: package_dir.to_path_buf(),
                    source,
                })?;
                let prefix = package.config.path.as_deref().unwrap_or("");
                let dest = package_dir.to_str().ok_or_else(|| RetrievalError::Staging {
                    path: package_dir.to_path_buf(),
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "staging path is not valid UTF-8",
                    ),
                })?;
                LocalStorage::new().copy_from(storage.as_ref(), prefix, dest)?;
                if let Some(manifest) = manifest_outside_prefix(&package.config) {
                    let dest = package_dir.join(file_name(manifest));
                    storage.store_to_local_file(manifest, &dest)?;
                }
                Ok(StagedAs::ObjectStore)
            }
        }
    }

    fn release(&self) {
        let mut staging = self.staging.lock();
        if matches!(*staging, Staging::Owned(_))
            && let Staging::Owned(dir) = std::mem::replace(&mut *staging, Staging::Released)
        {
            discard(dir);
        }
    }
}

impl Deref for PackagesDownloader {
    type Target = PackageMetadataCollection;

    fn deref(&self) -> &Self::Target {
        &self.collection
    }
}

fn discard(dir: TempDir) {
    let path = dir.path().to_path_buf();
    match dir.close() {
        Ok(()) => info!(path = %path.display(), "removed staging directory"),
        Err(err) => warn!(
            path = %path.display(),
            error = %err,
            "failed to remove staging directory"
        ),
    }
}

fn check_package_name(name: &str) -> RetrievalResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(RetrievalError::InvalidPackageSource {
            package: name.to_string(),
            reason: "package names must be a single path segment".to_string(),
        });
    }
    Ok(())
}

/// A held scope on a [`PackagesDownloader`]; the staged tree lives until the
/// outermost scope is dropped.
pub struct DownloadScope<'a> {
    downloader: &'a PackagesDownloader,
}

impl DownloadScope<'_> {
    pub fn downloader(&self) -> &PackagesDownloader {
        self.downloader
    }

    pub fn staging_root(&self) -> Option<PathBuf> {
        self.downloader.staging_root()
    }

    /// Zip archive of a staged package's directory, valid while the scope
    /// is held.
    pub fn archive(&self, package: &str) -> Option<DirectoryArchive> {
        self.root_directory(package).map(DirectoryArchive::new)
    }
}

impl Deref for DownloadScope<'_> {
    type Target = PackageMetadataCollection;

    fn deref(&self) -> &Self::Target {
        &self.downloader.collection
    }
}

impl Drop for DownloadScope<'_> {
    fn drop(&mut self) {
        if self.downloader.collection.counter().release() {
            self.downloader.release();
        }
    }
}

pub struct DownloaderBuilder {
    owner: WorkflowPackage,
    prefix_dir: Option<PathBuf>,
    existing_root: Option<PathBuf>,
    secrets: Arc<dyn SecretStore>,
    datasets: Arc<dyn DatasetResolver>,
    defaults: Arc<dyn DefaultCredentialSource>,
    connector: Arc<dyn ObjectStoreConnector>,
    git: Arc<dyn GitRunner>,
    loader: Arc<dyn DefinitionLoader>,
}

impl DownloaderBuilder {
    pub fn new(owner: WorkflowPackage) -> Self {
        Self {
            owner,
            prefix_dir: None,
            existing_root: None,
            secrets: Arc::new(InMemorySecrets::new()),
            datasets: Arc::new(StaticDatasets::new()),
            defaults: Arc::new(NoDefaultCredential),
            connector: Arc::new(S3Connector::default()),
            git: Arc::new(SystemGit::default()),
            loader: Arc::new(LayoutLoader),
        }
    }

    /// Directory the staging directory is created in; the system temp
    /// directory by default.
    pub fn prefix_dir(mut self, prefix_dir: impl Into<PathBuf>) -> Self {
        self.prefix_dir = Some(prefix_dir.into());
        self
    }

    pub fn existing_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.existing_root = Some(root.into());
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn datasets(mut self, datasets: impl DatasetResolver + 'static) -> Self {
        self.datasets = Arc::new(datasets);
        self
    }

    pub fn default_credentials(
        mut self,
        defaults: impl DefaultCredentialSource + 'static,
    ) -> Self {
        self.defaults = Arc::new(defaults);
        self
    }

    pub fn connector(mut self, connector: impl ObjectStoreConnector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn git(mut self, git: impl GitRunner + 'static) -> Self {
        self.git = Arc::new(git);
        self
    }

    pub fn loader(mut self, loader: impl DefinitionLoader + 'static) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    pub fn build(self) -> PackagesDownloader {
        let staging = match self.existing_root {
            Some(root) => Staging::Existing(root),
            None => Staging::Pending,
        };
        PackagesDownloader {
            collection: PackageMetadataCollection::new(Some(self.owner)),
            prefix_dir: self.prefix_dir.unwrap_or_else(env::temp_dir),
            secrets: self.secrets,
            datasets: self.datasets,
            defaults: self.defaults,
            connector: self.connector,
            git: self.git,
            loader: self.loader,
            staging: Mutex::new(staging),
        }
    }
}
