use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml_bw as serde_yaml;

use crate::packages::{DefaultCredentialSource, StaticDatasets};

/// Deployment-wide settings shared by every downloader in a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeploymentConfig {
    /// Secret used for git packages that declare no security block.
    #[serde(rename = "gitsecret-oauth", default)]
    pub git_secret_oauth: Option<String>,
    #[serde(default)]
    pub datasets: StaticDatasets,
}

impl DeploymentConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read deployment config {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("failed to parse deployment config {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }
}

impl DefaultCredentialSource for DeploymentConfig {
    fn default_git_secret(&self) -> Option<String> {
        self.git_secret_oauth
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}
