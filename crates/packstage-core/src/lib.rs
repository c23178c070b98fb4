//! Package staging core for workflow runners.
//!
//! This crate provides a uniform storage layer over the local filesystem,
//! S3-compatible object stores and memory, plus a downloader that retrieves
//! the base packages of a workflow from git, buckets or named datasets into a
//! private staging directory and records their metadata.

pub mod config;
pub mod env;
pub mod error;
pub mod packages;
pub mod storage;

pub use config::DeploymentConfig;
pub use env::DownloaderConfig;
pub use error::{RetrievalError, RetrievalResult, StorageError, StorageResult};
pub use packages::{
    BasePackage, DownloadScope, PackageMetadataCollection, PackagesDownloader, RetrievedMetadata,
    WorkflowPackage,
};
pub use storage::{InMemoryStorage, LocalStorage, ObjectStorage, PathInfo, Storage};
