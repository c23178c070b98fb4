use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use packstage_secrets::SecretStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::source::S3Source;
use crate::error::{RetrievalError, RetrievalResult, StorageResult};
use crate::storage::{ObjectStorage, S3Credentials, S3Location, Storage};

/// Dataset types backed by an S3-compatible bucket.
pub const SUPPORTED_DATASET_TYPES: [&str; 2] = ["S3", "COS"];

const DEFAULT_KEY_ACCESS_KEY_ID: &str = "accessKeyID";
const DEFAULT_KEY_SECRET_ACCESS_KEY: &str = "secretAccessKey";

fn default_dataset_type() -> String {
    "S3".to_string()
}

/// Everything needed to reach the bucket behind a dataset.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetCredentials {
    pub bucket: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(rename = "accessKeyID")]
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(rename = "type", default = "default_dataset_type")]
    pub dataset_type: String,
}

impl DatasetCredentials {
    pub fn s3(
        bucket: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: None,
            region: None,
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            dataset_type: default_dataset_type(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_DATASET_TYPES
            .iter()
            .any(|kind| kind.eq_ignore_ascii_case(&self.dataset_type))
    }
}

impl fmt::Debug for DatasetCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetCredentials")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("dataset_type", &self.dataset_type)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset {0} does not exist")]
    Unknown(String),

    #[error("failed to look up dataset {dataset}: {reason}")]
    Lookup { dataset: String, reason: String },
}

/// Looks up the bucket and credentials behind a named dataset.
pub trait DatasetResolver: Send + Sync {
    fn resolve(&self, dataset: &str) -> Result<DatasetCredentials, DatasetError>;
}

/// Fixed dataset table, usually loaded from the deployment config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct StaticDatasets {
    datasets: BTreeMap<String, DatasetCredentials>,
}

impl StaticDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, name: impl Into<String>, credentials: DatasetCredentials) -> Self {
        self.insert(name, credentials);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, credentials: DatasetCredentials) {
        self.datasets.insert(name.into(), credentials);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

impl DatasetResolver for StaticDatasets {
    fn resolve(&self, dataset: &str) -> Result<DatasetCredentials, DatasetError> {
        self.datasets
            .get(dataset)
            .cloned()
            .ok_or_else(|| DatasetError::Unknown(dataset.to_string()))
    }
}

/// Deployment-wide git secret used when a package declares no security.
pub trait DefaultCredentialSource: Send + Sync {
    fn default_git_secret(&self) -> Option<String>;
}

/// No deployment default: packages without security clone anonymously.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDefaultCredential;

impl DefaultCredentialSource for NoDefaultCredential {
    fn default_git_secret(&self) -> Option<String> {
        None
    }
}

/// Opens a [`Storage`] for a bucket.
pub trait ObjectStoreConnector: Send + Sync {
    fn connect(
        &self,
        location: S3Location,
        credentials: Option<S3Credentials>,
    ) -> StorageResult<Arc<dyn Storage>>;
}

/// Production connector backed by [`ObjectStorage::s3`].
#[derive(Debug, Clone, Default)]
pub struct S3Connector {
    timeout: Option<Duration>,
}

impl S3Connector {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl ObjectStoreConnector for S3Connector {
    fn connect(
        &self,
        location: S3Location,
        credentials: Option<S3Credentials>,
    ) -> StorageResult<Arc<dyn Storage>> {
        let storage = ObjectStorage::s3(location, credentials, self.timeout)?;
        Ok(Arc::new(storage))
    }
}

/// Builds the storage for an object-store source: literal keys first, then
/// keys read from a secret, otherwise anonymous access.
pub fn storage_for_source(
    package: &str,
    source: &S3Source,
    secrets: &dyn SecretStore,
    connector: &dyn ObjectStoreConnector,
) -> RetrievalResult<Arc<dyn Storage>> {
    let cannot = |reason: String| RetrievalError::CannotResolveCredential {
        package: package.to_string(),
        reason,
    };
    let location = S3Location {
        bucket: source.location.bucket.clone(),
        endpoint: source.location.endpoint.clone(),
        region: source.location.region.clone(),
    };
    if location.bucket.is_empty() {
        return Err(RetrievalError::InvalidPackageSource {
            package: package.to_string(),
            reason: "s3 location has no bucket".to_string(),
        });
    }

    let declared = source
        .security
        .as_ref()
        .and_then(|security| security.credentials.as_ref());
    let credentials = match declared {
        Some(declared) if declared.value.is_some() => declared.value.as_ref().map(|pair| {
            S3Credentials::new(pair.access_key_id.clone(), pair.secret_access_key.clone())
        }),
        Some(declared) if declared.value_from.is_some() => {
            let Some(reference) = declared.value_from.as_ref() else {
                return Err(cannot("s3 credentials reference is empty".to_string()));
            };
            let secret = secrets
                .secret_get(&reference.secret_name)
                .map_err(|err| cannot(err.to_string()))?
                .ok_or_else(|| {
                    cannot(format!(
                        "secret {} holding the s3 credentials is missing",
                        reference.secret_name
                    ))
                })?;
            let key_id = reference
                .key_access_key_id
                .as_deref()
                .unwrap_or(DEFAULT_KEY_ACCESS_KEY_ID);
            let key_secret = reference
                .key_secret_access_key
                .as_deref()
                .unwrap_or(DEFAULT_KEY_SECRET_ACCESS_KEY);
            let lookup = |key: &str| {
                secret.get(key).map(str::to_string).ok_or_else(|| {
                    cannot(format!(
                        "secret {} has no key {key}",
                        reference.secret_name
                    ))
                })
            };
            Some(S3Credentials::new(lookup(key_id)?, lookup(key_secret)?))
        }
        _ => None,
    };

    debug!(
        package,
        bucket = %location.bucket,
        authenticated = credentials.is_some(),
        "connecting to object store"
    );
    connector
        .connect(location, credentials)
        .map_err(RetrievalError::from)
}
