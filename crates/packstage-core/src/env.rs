use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use packstage_secrets::SecretsBackend;
use tracing::info;

use crate::config::DeploymentConfig;
use crate::packages::{DownloaderBuilder, PackagesDownloader, S3Connector, SystemGit, WorkflowPackage};

/// Environment-driven configuration for package downloaders.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub staging_dir: PathBuf,
    pub git_program: PathBuf,
    pub s3_timeout: Option<Duration>,
    pub deployment_config: Option<PathBuf>,
    pub secrets_backend: SecretsBackend,
    pub secrets_dir: Option<PathBuf>,
}

impl DownloaderConfig {
    /// Build a [`DownloaderConfig`] by reading the documented PACKSTAGE_* variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`DownloaderConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let set = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let staging_dir = set("PACKSTAGE_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);

        let git_program = set("PACKSTAGE_GIT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("git"));

        let s3_timeout = match set("PACKSTAGE_S3_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("PACKSTAGE_S3_TIMEOUT_SECS `{raw}` is not a number"))?;
                if secs == 0 {
                    bail!("PACKSTAGE_S3_TIMEOUT_SECS must be greater than zero");
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        let deployment_config = set("PACKSTAGE_DEPLOYMENT_CONFIG").map(PathBuf::from);

        let secrets_backend = SecretsBackend::from_env(set("PACKSTAGE_SECRETS_BACKEND"))
            .context("PACKSTAGE_SECRETS_BACKEND is invalid")?;
        let secrets_dir = set("PACKSTAGE_SECRETS_DIR").map(PathBuf::from);

        Ok(Self {
            staging_dir,
            git_program,
            s3_timeout,
            deployment_config,
            secrets_backend,
            secrets_dir,
        })
    }

    /// Loads the deployment file, or the empty default when none is configured.
    pub fn deployment(&self) -> Result<DeploymentConfig> {
        match &self.deployment_config {
            Some(path) => DeploymentConfig::load_from_path(path),
            None => Ok(DeploymentConfig::default()),
        }
    }

    /// A builder wired to the system git, the S3 connector, the configured
    /// secrets backend and the deployment's datasets and default credential.
    pub fn builder(&self, owner: WorkflowPackage) -> Result<DownloaderBuilder> {
        let deployment = self.deployment()?;
        let secrets = self
            .secrets_backend
            .open(self.secrets_dir.clone())
            .context("failed to open the secrets backend")?;
        info!(
            owner = %owner.name,
            staging_dir = %self.staging_dir.display(),
            datasets = deployment.datasets.names().count(),
            "configuring package downloader"
        );
        Ok(PackagesDownloader::builder(owner)
            .prefix_dir(&self.staging_dir)
            .secrets(secrets)
            .datasets(deployment.datasets.clone())
            .default_credentials(deployment)
            .connector(S3Connector::new(self.s3_timeout))
            .git(SystemGit::new(&self.git_program)))
    }
}
