//! Secret lookup for package retrieval.
//!
//! A secret is a named bag of string entries (an OAuth token under
//! `oauth-token`, an access key pair for an object store, ...). Retrieval code
//! only ever asks for a secret by name through [`SecretStore`]; which backend
//! answers is a deployment decision made with [`SecretsBackend`].

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

/// Prefix used by [`EnvSecrets`] unless another one is supplied.
pub const DEFAULT_ENV_PREFIX: &str = "PACKSTAGE_SECRET_";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("unsupported secrets backend `{0}`")]
    UnsupportedBackend(String),

    #[error("secrets backend `{backend}` requires a root directory")]
    MissingRoot { backend: SecretsBackend },

    #[error("failed to read secret `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("entry `{key}` of secret `{name}` is not valid UTF-8")]
    InvalidEncoding { name: String, key: String },
}

/// A named secret. `Debug` lists the entry names, never the values.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Exact entry first, then one that differs only in case or `-`/`_`,
    /// since [`EnvSecrets`] cannot preserve either.
    pub fn get(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.data.get(key) {
            return Some(value.as_str());
        }
        let wanted = fold_key(key);
        self.data
            .iter()
            .find(|(candidate, _)| fold_key(candidate) == wanted)
            .map(|(_, value)| value.as_str())
    }
}

fn fold_key(key: &str) -> String {
    key.chars()
        .map(|ch| if ch == '_' { '-' } else { ch.to_ascii_lowercase() })
        .collect()
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub trait SecretStore: Send + Sync {
    /// Returns `Ok(None)` when no secret with that name exists.
    fn secret_get(&self, name: &str) -> Result<Option<Secret>, SecretError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretsBackend {
    Env,
    Mounted,
    Memory,
}

impl SecretsBackend {
    pub fn from_env(env_value: Option<String>) -> Result<Self, SecretError> {
        match env_value {
            Some(raw) => raw.parse(),
            None => Ok(SecretsBackend::Env),
        }
    }

    /// Opens the backend. `root` is only consulted by [`SecretsBackend::Mounted`].
    pub fn open(self, root: Option<PathBuf>) -> Result<Arc<dyn SecretStore>, SecretError> {
        match self {
            SecretsBackend::Env => {
                info!("secrets backend=env (environment variables)");
                Ok(Arc::new(EnvSecrets::default()))
            }
            SecretsBackend::Mounted => {
                let root = root.ok_or(SecretError::MissingRoot { backend: self })?;
                info!(root = %root.display(), "secrets backend=mounted");
                Ok(Arc::new(MountedSecrets::new(root)))
            }
            SecretsBackend::Memory => {
                info!("secrets backend=memory (empty until populated)");
                Ok(Arc::new(InMemorySecrets::default()))
            }
        }
    }
}

impl FromStr for SecretsBackend {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, SecretError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "env" | "" => Ok(SecretsBackend::Env),
            "mounted" | "dir" | "k8s" => Ok(SecretsBackend::Mounted),
            "memory" | "mem" => Ok(SecretsBackend::Memory),
            other => Err(SecretError::UnsupportedBackend(other.to_string())),
        }
    }
}

impl fmt::Display for SecretsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretsBackend::Env => write!(f, "env"),
            SecretsBackend::Mounted => write!(f, "mounted"),
            SecretsBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Secrets read from environment variables.
///
/// Entry `oauth-token` of secret `git-creds` is read from
/// `PACKSTAGE_SECRET_GIT_CREDS__OAUTH_TOKEN`. Entry names come back lowercase
/// with `_` turned into `-`.
#[derive(Debug, Clone)]
pub struct EnvSecrets {
    prefix: String,
}

impl EnvSecrets {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, secret: &str, key: &str) -> String {
        format!("{}{}__{}", self.prefix, env_segment(secret), env_segment(key))
    }
}

impl Default for EnvSecrets {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_ENV_PREFIX)
    }
}

impl SecretStore for EnvSecrets {
    fn secret_get(&self, name: &str) -> Result<Option<Secret>, SecretError> {
        let prefix = format!("{}{}__", self.prefix, env_segment(name));
        let mut secret = Secret::new(name);
        for (var, value) in env::vars_os() {
            let Some(var) = var.to_str() else {
                continue;
            };
            let Some(rest) = var.strip_prefix(&prefix) else {
                continue;
            };
            let key = rest.to_ascii_lowercase().replace('_', "-");
            let value = value.into_string().map_err(|_| SecretError::InvalidEncoding {
                name: name.to_string(),
                key: key.clone(),
            })?;
            secret.data.insert(key, value);
        }
        if secret.data.is_empty() {
            debug!(secret = %name, "secret not present in environment");
            return Ok(None);
        }
        Ok(Some(secret))
    }
}

fn env_segment(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Secrets mounted as directories: `<root>/<secret>/<key>` holds one entry.
///
/// This is the layout a Kubernetes secret volume produces; the hidden
/// `..data` bookkeeping entries are skipped.
#[derive(Debug, Clone)]
pub struct MountedSecrets {
    root: PathBuf,
}

impl MountedSecrets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SecretStore for MountedSecrets {
    fn secret_get(&self, name: &str) -> Result<Option<Secret>, SecretError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            debug!(secret = %name, "refusing to resolve secret name outside the mount root");
            return Ok(None);
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Ok(None);
        }
        let io_err = |source| SecretError::Io {
            name: name.to_string(),
            source,
        };
        let mut secret = Secret::new(name);
        for entry in fs::read_dir(&dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let key = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if key.starts_with('.') || !path.is_file() {
                continue;
            }
            let raw = fs::read(&path).map_err(io_err)?;
            let value = String::from_utf8(raw).map_err(|_| SecretError::InvalidEncoding {
                name: name.to_string(),
                key: key.clone(),
            })?;
            secret
                .data
                .insert(key, value.trim_end_matches(['\r', '\n']).to_string());
        }
        Ok(Some(secret))
    }
}

/// Process-local secrets, mostly for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemorySecrets {
    secrets: RwLock<BTreeMap<String, Secret>>,
}

impl InMemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, secret: Secret) {
        self.secrets.write().insert(secret.name.clone(), secret);
    }

    pub fn with_secret(self, secret: Secret) -> Self {
        self.insert(secret);
        self
    }
}

impl SecretStore for InMemorySecrets {
    fn secret_get(&self, name: &str) -> Result<Option<Secret>, SecretError> {
        Ok(self.secrets.read().get(name).cloned())
    }
}
