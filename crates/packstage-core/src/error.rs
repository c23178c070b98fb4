use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of a [`Storage`](crate::storage::Storage) operation.
///
/// `backend` is the identity from [`Storage::describe`](crate::storage::Storage::describe)
/// and never contains credentials.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{path} not found in {backend}")]
    NotFound { backend: String, path: String },

    #[error("{path} is not a directory in {backend}")]
    NotADirectory { backend: String, path: String },

    #[error("{path} is a directory in {backend}")]
    IsADirectory { backend: String, path: String },

    #[error("{backend} failed on {path}: {reason}")]
    Failure {
        backend: String,
        path: String,
        reason: String,
    },
}

impl StorageError {
    pub fn not_found(backend: impl Into<String>, path: impl Into<String>) -> Self {
        Self::NotFound {
            backend: backend.into(),
            path: path.into(),
        }
    }

    pub fn not_a_directory(backend: impl Into<String>, path: impl Into<String>) -> Self {
        Self::NotADirectory {
            backend: backend.into(),
            path: path.into(),
        }
    }

    pub fn is_a_directory(backend: impl Into<String>, path: impl Into<String>) -> Self {
        Self::IsADirectory {
            backend: backend.into(),
            path: path.into(),
        }
    }

    pub fn failure(
        backend: impl Into<String>,
        path: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::Failure {
            backend: backend.into(),
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Maps a filesystem error, keeping `NotFound` distinguishable.
    pub fn from_io(backend: &str, path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_found(backend, path),
            _ => Self::failure(backend, path, err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Failure while staging packages.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("cannot retrieve repository {location} {}: {reason}", credential_clause(.credential))]
    CannotRetrieveRepository {
        location: String,
        credential: Option<String>,
        reason: String,
    },

    #[error("cannot resolve credentials for package {package}: {reason}")]
    CannotResolveCredential { package: String, reason: String },

    #[error("package {package} has an invalid source: {reason}")]
    InvalidPackageSource { package: String, reason: String },

    #[error("package {package} has no usable definition at {location}: {reason}")]
    InvalidDefinition {
        package: String,
        location: PathBuf,
        reason: String,
    },

    #[error("staging directory {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("retrieval session already released its staging directory")]
    SessionClosed,
}

fn credential_clause(credential: &Option<String>) -> String {
    match credential {
        Some(secret) => format!(
            "using the oauth credentials in secret {secret} (check the location, then verify those credentials can clone it)"
        ),
        None => "without any oauth credentials (check the location is correct and public)"
            .to_string(),
    }
}

pub type RetrievalResult<T> = Result<T, RetrievalError>;
