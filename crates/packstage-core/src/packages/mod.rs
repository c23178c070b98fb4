//! Package descriptors, the metadata registry and the downloader that stages
//! packages from git repositories, object stores and datasets.

pub mod collection;
pub mod credentials;
pub mod downloader;
pub mod git;
pub mod metadata;
pub mod source;

pub use collection::{CollectionScope, PackageMetadataCollection, ScopeCounter};
pub use credentials::{
    DatasetCredentials, DatasetError, DatasetResolver, DefaultCredentialSource,
    NoDefaultCredential, ObjectStoreConnector, S3Connector, StaticDatasets, storage_for_source,
};
pub use downloader::{DownloadScope, DownloaderBuilder, PackagesDownloader};
pub use git::{GitCredential, GitOutput, GitRunner, SystemGit, redact, resolve_git_credential};
pub use metadata::{
    ConcreteDefinition, DefinitionError, DefinitionLoader, LayoutLoader, LoadedDefinition,
    Manifest, RetrievedMetadata,
};
pub use source::{
    BasePackage, BaseSource, DatasetSource, GitSource, PackageConfig, PackageSource,
    ResolvedSource, S3Source, WorkflowPackage, resolve_source,
};
