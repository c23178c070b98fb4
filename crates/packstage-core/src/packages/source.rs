//! Package descriptors as they appear in upstream documents, and the tagged
//! source union retrieval dispatches on.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::credentials::{DatasetResolver, SUPPORTED_DATASET_TYPES};
use crate::error::{RetrievalError, RetrievalResult};

fn default_package_name() -> String {
    "main".to_string()
}

/// The package that owns a list of base packages.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPackage {
    pub name: String,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub base: BaseLayer,
}

impl WorkflowPackage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platforms.push(platform.into());
        self
    }

    pub fn with_package(mut self, package: BasePackage) -> Self {
        self.base.packages.push(package);
        self
    }

    /// Platform used when loading definitions: the first declared one.
    pub fn platform_hint(&self) -> Option<&str> {
        self.platforms.first().map(String::as_str)
    }

    pub fn package(&self, name: &str) -> Option<&BasePackage> {
        self.base.packages.iter().find(|package| package.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseLayer {
    #[serde(default)]
    pub packages: Vec<BasePackage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasePackage {
    #[serde(default = "default_package_name")]
    pub name: String,
    #[serde(default)]
    pub source: BaseSource,
    #[serde(default)]
    pub config: PackageConfig,
}

impl BasePackage {
    pub fn new(name: impl Into<String>, source: impl Into<BaseSource>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            config: PackageConfig::default(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.config.path = Some(path.into());
        self
    }

    pub fn with_manifest(mut self, manifest_path: impl Into<String>) -> Self {
        self.config.manifest_path = Some(manifest_path.into());
        self
    }

    pub fn source_kind(&self) -> RetrievalResult<PackageSource> {
        self.source.kind(&self.name)
    }
}

/// Where inside the retrieved tree the definition lives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
}

/// Wire form of a package source: exactly one field must be set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetSource>,
}

impl BaseSource {
    pub fn kind(&self, package: &str) -> RetrievalResult<PackageSource> {
        let invalid = |reason: String| RetrievalError::InvalidPackageSource {
            package: package.to_string(),
            reason,
        };
        match (&self.git, &self.s3, &self.dataset) {
            (Some(git), None, None) => {
                let refs = [
                    git.location.branch.as_ref(),
                    git.location.tag.as_ref(),
                    git.location.commit.as_ref(),
                ];
                if refs.iter().flatten().count() > 1 {
                    return Err(invalid(
                        "git location sets more than one of branch, tag and commit".to_string(),
                    ));
                }
                Ok(PackageSource::Repository(git.clone()))
            }
            (None, Some(s3), None) => Ok(PackageSource::ObjectStore(s3.clone())),
            (None, None, Some(dataset)) => Ok(PackageSource::Dataset(dataset.clone())),
            (None, None, None) => Err(invalid("no git, s3 or dataset source".to_string())),
            _ => Err(invalid(
                "more than one of git, s3 and dataset is set".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    Repository(GitSource),
    ObjectStore(S3Source),
    Dataset(DatasetSource),
}

impl From<PackageSource> for BaseSource {
    fn from(source: PackageSource) -> Self {
        match source {
            PackageSource::Repository(git) => Self {
                git: Some(git),
                ..Self::default()
            },
            PackageSource::ObjectStore(s3) => Self {
                s3: Some(s3),
                ..Self::default()
            },
            PackageSource::Dataset(dataset) => Self {
                dataset: Some(dataset),
                ..Self::default()
            },
        }
    }
}

impl From<GitSource> for BaseSource {
    fn from(git: GitSource) -> Self {
        PackageSource::Repository(git).into()
    }
}

impl From<S3Source> for BaseSource {
    fn from(s3: S3Source) -> Self {
        PackageSource::ObjectStore(s3).into()
    }
}

impl From<DatasetSource> for BaseSource {
    fn from(dataset: DatasetSource) -> Self {
        PackageSource::Dataset(dataset).into()
    }
}

/// A source ready for retrieval; datasets are already translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    Repository(GitSource),
    ObjectStore(S3Source),
}

/// Translates a dataset source into the object-store source it stands for.
/// Other sources pass through unchanged.
pub fn resolve_source(
    package: &str,
    source: &PackageSource,
    datasets: &dyn DatasetResolver,
) -> RetrievalResult<ResolvedSource> {
    match source {
        PackageSource::Repository(git) => Ok(ResolvedSource::Repository(git.clone())),
        PackageSource::ObjectStore(s3) => Ok(ResolvedSource::ObjectStore(s3.clone())),
        PackageSource::Dataset(dataset) => {
            let name = dataset.credentials_dataset();
            let resolved = datasets.resolve(name).map_err(|err| {
                RetrievalError::CannotResolveCredential {
                    package: package.to_string(),
                    reason: err.to_string(),
                }
            })?;
            if !resolved.is_supported() {
                return Err(RetrievalError::CannotResolveCredential {
                    package: package.to_string(),
                    reason: format!(
                        "dataset {name} has type {} but only {} datasets can be read",
                        resolved.dataset_type,
                        SUPPORTED_DATASET_TYPES.join(" and ")
                    ),
                });
            }
            Ok(ResolvedSource::ObjectStore(S3Source {
                location: S3SourceLocation {
                    bucket: resolved.bucket,
                    endpoint: resolved.endpoint,
                    region: resolved.region,
                },
                security: Some(S3Security {
                    credentials: Some(S3SourceCredentials {
                        value: Some(S3KeyPair {
                            access_key_id: resolved.access_key_id,
                            secret_access_key: resolved.secret_access_key,
                        }),
                        value_from: None,
                    }),
                }),
            }))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub location: GitLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<GitSecurity>,
    /// Commit id, filled in once the repository was cloned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl GitSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            location: GitLocation {
                url: url.into(),
                ..GitLocation::default()
            },
            ..Self::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.location.branch = Some(branch.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.location.tag = Some(tag.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.location.commit = Some(commit.into());
        self
    }

    pub fn with_secret_ref(mut self, name: impl Into<String>, key: Option<&str>) -> Self {
        self.security = Some(GitSecurity {
            oauth: Some(GitOAuth {
                value: None,
                value_from: Some(OAuthValueFrom {
                    secret_key_ref: Some(SecretKeyRef {
                        name: name.into(),
                        key: key.map(str::to_string),
                    }),
                }),
            }),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitLocation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSecurity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<GitOAuth>,
}

impl GitSecurity {
    pub fn is_empty(&self) -> bool {
        self.oauth.is_none()
    }
}

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitOAuth {
    /// Literal tokens are refused at retrieval time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<OAuthValueFrom>,
}

impl fmt::Debug for GitOAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitOAuth")
            .field("value", &self.value.as_ref().map(|_| "<redacted>"))
            .field("value_from", &self.value_from)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthValueFrom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Source {
    pub location: S3SourceLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<S3Security>,
}

impl S3Source {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            location: S3SourceLocation {
                bucket: bucket.into(),
                ..S3SourceLocation::default()
            },
            security: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.location.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_keys(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.security = Some(S3Security {
            credentials: Some(S3SourceCredentials {
                value: Some(S3KeyPair {
                    access_key_id: access_key_id.into(),
                    secret_access_key: secret_access_key.into(),
                }),
                value_from: None,
            }),
        });
        self
    }

    pub fn with_secret(mut self, secret_name: impl Into<String>) -> Self {
        self.security = Some(S3Security {
            credentials: Some(S3SourceCredentials {
                value: None,
                value_from: Some(S3SecretRef {
                    secret_name: secret_name.into(),
                    key_access_key_id: None,
                    key_secret_access_key: None,
                }),
            }),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3SourceLocation {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Security {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<S3SourceCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3SourceCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<S3KeyPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<S3SecretRef>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3KeyPair {
    #[serde(rename = "accessKeyID")]
    pub access_key_id: String,
    #[serde(rename = "secretAccessKey")]
    pub secret_access_key: String,
}

impl fmt::Debug for S3KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3KeyPair")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Secret holding an access key pair; the key names default to
/// `accessKeyID` and `secretAccessKey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3SecretRef {
    #[serde(rename = "secretName")]
    pub secret_name: String,
    #[serde(
        rename = "keyAccessKeyID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub key_access_key_id: Option<String>,
    #[serde(
        rename = "keySecretAccessKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub key_secret_access_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSource {
    pub location: DatasetRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<DatasetRef>,
}

impl DatasetSource {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            location: DatasetRef {
                dataset: dataset.into(),
            },
            security: None,
        }
    }

    /// Dataset whose credentials are used; defaults to the location's.
    pub fn credentials_dataset(&self) -> &str {
        self.security
            .as_ref()
            .map(|security| security.dataset.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(self.location.dataset.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatasetRef {
    pub dataset: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::credentials::{DatasetCredentials, StaticDatasets};

    #[test]
    fn parses_upstream_document() {
        let raw = r#"{
            "name": "owner",
            "platforms": ["openshift"],
            "base": {"packages": [
                {"source": {"git": {
                    "location": {"url": "https://example.com/r.git", "tag": "v1"},
                    "security": {"oauth": {"valueFrom": {"secretKeyRef": {"name": "gh"}}}}
                }}, "config": {"path": "wf", "manifestPath": "wf/manifest.yaml"}},
                {"name": "bucketed", "source": {"s3": {
                    "location": {"bucket": "b", "endpoint": "http://minio:9000"},
                    "security": {"credentials": {"valueFrom": {"secretName": "s3", "keyAccessKeyID": "id"}}}
                }}}
            ]}
        }"#;
        let package: WorkflowPackage = serde_json::from_str(raw).unwrap();
        assert_eq!(package.platform_hint(), Some("openshift"));
        let main = package.package("main").unwrap();
        assert_eq!(main.config.manifest_path.as_deref(), Some("wf/manifest.yaml"));
        match main.source_kind().unwrap() {
            PackageSource::Repository(git) => {
                assert_eq!(git.location.tag.as_deref(), Some("v1"));
                let key_ref = git
                    .security
                    .and_then(|s| s.oauth)
                    .and_then(|o| o.value_from)
                    .and_then(|v| v.secret_key_ref)
                    .unwrap();
                assert_eq!(key_ref.name, "gh");
                assert_eq!(key_ref.key, None);
            }
            other => panic!("unexpected source {other:?}"),
        }
        let bucketed = package.package("bucketed").unwrap();
        assert!(matches!(
            bucketed.source_kind().unwrap(),
            PackageSource::ObjectStore(_)
        ));
    }

    #[test]
    fn source_needs_exactly_one_kind() {
        let empty = BasePackage::new("p", BaseSource::default());
        assert!(matches!(
            empty.source_kind(),
            Err(RetrievalError::InvalidPackageSource { .. })
        ));

        let both = BasePackage::new(
            "p",
            BaseSource {
                git: Some(GitSource::new("https://x/y")),
                dataset: Some(DatasetSource::new("d")),
                s3: None,
            },
        );
        assert!(matches!(
            both.source_kind(),
            Err(RetrievalError::InvalidPackageSource { .. })
        ));

        let ambiguous = BasePackage::new(
            "p",
            GitSource::new("https://x/y").with_branch("main").with_commit("abc"),
        );
        assert!(matches!(
            ambiguous.source_kind(),
            Err(RetrievalError::InvalidPackageSource { .. })
        ));
    }

    #[test]
    fn dataset_resolves_to_object_store_without_touching_input() {
        let datasets = StaticDatasets::new().with_dataset(
            "creds",
            DatasetCredentials::s3("bucket", "AKID", "secret").with_endpoint("http://minio:9000"),
        );
        let mut dataset = DatasetSource::new("data");
        dataset.security = Some(DatasetRef {
            dataset: "creds".to_string(),
        });
        let source = PackageSource::Dataset(dataset);
        let before = source.clone();

        let resolved = resolve_source("p", &source, &datasets).unwrap();
        assert_eq!(source, before);
        assert_eq!(
            resolved,
            ResolvedSource::ObjectStore(
                S3Source::new("bucket")
                    .with_endpoint("http://minio:9000")
                    .with_keys("AKID", "secret")
            )
        );
    }

    #[test]
    fn unsupported_dataset_type_is_rejected() {
        let mut credentials = DatasetCredentials::s3("bucket", "AKID", "secret");
        credentials.dataset_type = "NFS".to_string();
        let datasets = StaticDatasets::new().with_dataset("d", credentials);
        let source = PackageSource::Dataset(DatasetSource::new("d"));
        assert!(matches!(
            resolve_source("p", &source, &datasets),
            Err(RetrievalError::CannotResolveCredential { .. })
        ));
        let unknown = PackageSource::Dataset(DatasetSource::new("missing"));
        assert!(matches!(
            resolve_source("p", &unknown, &datasets),
            Err(RetrievalError::CannotResolveCredential { .. })
        ));
    }

    #[test]
    fn oauth_debug_hides_literal_token() {
        let oauth = GitOAuth {
            value: Some("ghp_secret".to_string()),
            value_from: None,
        };
        assert!(!format!("{oauth:?}").contains("ghp_secret"));
    }
}
