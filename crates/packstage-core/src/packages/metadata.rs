use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml_bw as serde_yaml;
use thiserror::Error;
use tracing::debug;

use super::source::PackageConfig;
use crate::storage::path::{file_name, relative_to};

/// Platform reported when the owner declares none.
pub const DEFAULT_PLATFORM: &str = "default";
/// Application folder whose direct files are the package's data files.
pub const DATA_FOLDER: &str = "data";

/// Folder name → `path[:method]`, as written in a package manifest.
pub type Manifest = BTreeMap<String, String>;

/// The parts of a loaded definition this crate cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcreteDefinition {
    pub platforms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievedMetadata {
    pub root_directory: Option<PathBuf>,
    pub location: PathBuf,
    pub definition: ConcreteDefinition,
    pub manifest_data: Manifest,
    pub data_files: Vec<String>,
    pub top_level_folders: Vec<String>,
}

impl RetrievedMetadata {
    /// Where an application folder lives on disk. Manifest entries win and
    /// relative ones hang off the parent of the location, or off the location
    /// itself when it is the package root.
    pub fn application_directory(&self, folder: &str) -> Option<PathBuf> {
        if let Some(entry) = self.manifest_data.get(folder) {
            let raw = entry.rsplit_once(':').map_or(entry.as_str(), |(path, _)| path);
            let path = Path::new(raw);
            if path.is_absolute() {
                return Some(path.to_path_buf());
            }
            return Some(self.manifest_base().join(path));
        }
        self.location
            .is_dir()
            .then(|| self.location.join(folder))
    }

    /// Regular files directly inside the data folder, sorted.
    pub fn discover_data_files(&mut self) -> Vec<String> {
        let mut files: Vec<String> = self
            .application_directory(DATA_FOLDER)
            .and_then(|dir| fs::read_dir(dir).ok())
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        self.data_files = files.clone();
        files
    }

    fn manifest_base(&self) -> &Path {
        if self.root_directory.as_deref() == Some(self.location.as_path()) {
            return &self.location;
        }
        self.location.parent().unwrap_or(&self.location)
    }
}

#[derive(Debug, Error)]
#[error("{reason}")]
pub struct DefinitionError {
    pub reason: String,
}

impl DefinitionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// What a [`DefinitionLoader`] extracts from a retrieved package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedDefinition {
    pub definition: ConcreteDefinition,
    pub manifest_data: Manifest,
    pub top_level_folders: Vec<String>,
}

/// Boundary to the workflow-definition parser.
pub trait DefinitionLoader: Send + Sync {
    fn load(
        &self,
        location: &Path,
        manifest: Option<&Path>,
        platform: Option<&str>,
    ) -> Result<LoadedDefinition, DefinitionError>;
}

/// Reads the package layout without interpreting definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutLoader;

impl DefinitionLoader for LayoutLoader {
    fn load(
        &self,
        location: &Path,
        manifest: Option<&Path>,
        platform: Option<&str>,
    ) -> Result<LoadedDefinition, DefinitionError> {
        if !location.exists() {
            return Err(DefinitionError::new("nothing was retrieved at this location"));
        }
        let manifest_data = match manifest {
            Some(path) => read_manifest(path)?,
            None => Manifest::new(),
        };
        let top_level_folders = if manifest_data.is_empty() {
            subdirectories(location)
        } else {
            manifest_data.keys().cloned().collect()
        };
        Ok(LoadedDefinition {
            definition: ConcreteDefinition {
                platforms: vec![platform.unwrap_or(DEFAULT_PLATFORM).to_string()],
            },
            manifest_data,
            top_level_folders,
        })
    }
}

fn read_manifest(path: &Path) -> Result<Manifest, DefinitionError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        DefinitionError::new(format!("cannot read manifest {}: {err}", path.display()))
    })?;
    if raw.trim().is_empty() {
        return Ok(Manifest::new());
    }
    serde_yaml::from_str(&raw).map_err(|err| {
        DefinitionError::new(format!("manifest {} is not a folder mapping: {err}", path.display()))
    })
}

fn subdirectories(location: &Path) -> Vec<String> {
    let mut folders: Vec<String> = fs::read_dir(location)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect();
    folders.sort();
    folders
}

/// How a package landed in its staging subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedAs {
    /// The whole repository; `config.path` is relative to its root.
    Repository,
    /// The contents of `config.path` only.
    ObjectStore,
}

/// Manifest path when it is not below the package's content prefix.
pub fn manifest_outside_prefix(config: &PackageConfig) -> Option<&str> {
    let manifest = config.manifest_path.as_deref()?;
    let prefix = config.path.as_deref().unwrap_or("");
    relative_to(manifest, prefix).is_none().then_some(manifest)
}

/// Definition location and manifest path inside `package_dir`.
pub fn staged_layout(
    package_dir: &Path,
    config: &PackageConfig,
    staged: StagedAs,
) -> (PathBuf, Option<PathBuf>) {
    let in_package = |path: &str| package_dir.join(path.trim_start_matches('/'));
    match staged {
        StagedAs::Repository => (
            config
                .path
                .as_deref()
                .map_or_else(|| package_dir.to_path_buf(), in_package),
            config.manifest_path.as_deref().map(in_package),
        ),
        StagedAs::ObjectStore => {
            let prefix = config.path.as_deref().unwrap_or("");
            let manifest = config.manifest_path.as_deref().map(|manifest| {
                match relative_to(manifest, prefix) {
                    Some(relative) => in_package(relative.as_str()),
                    None => package_dir.join(file_name(manifest)),
                }
            });
            (package_dir.to_path_buf(), manifest)
        }
    }
}

/// Loads the definition at `location` and discovers its data files.
/// `package_dir` becomes the metadata's root directory.
pub fn load_metadata(
    loader: &dyn DefinitionLoader,
    package_dir: &Path,
    location: PathBuf,
    manifest: Option<&Path>,
    platform: Option<&str>,
) -> Result<RetrievedMetadata, DefinitionError> {
    let loaded = loader.load(&location, manifest, platform)?;
    let mut metadata = RetrievedMetadata {
        root_directory: Some(package_dir.to_path_buf()),
        location,
        definition: loaded.definition,
        manifest_data: loaded.manifest_data,
        data_files: Vec::new(),
        top_level_folders: loaded.top_level_folders,
    };
    let files = metadata.discover_data_files();
    debug!(
        location = %metadata.location.display(),
        data_files = files.len(),
        "loaded package metadata"
    );
    Ok(metadata)
}
