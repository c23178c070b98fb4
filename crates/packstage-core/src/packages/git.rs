//! Repository retrieval through the git command line.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use packstage_secrets::SecretStore;
use tracing::{debug, info, warn};

use super::credentials::DefaultCredentialSource;
use super::source::{GitLocation, GitSource};
use crate::error::{RetrievalError, RetrievalResult};

/// Secret key holding the token when a reference names none.
pub const DEFAULT_TOKEN_KEY: &str = "oauth-token";
/// Replaces the token in any git output that leaves this module.
pub const REDACTED: &str = "<redacted>";

const HTTPS: &str = "https://";

/// Captured result of one git invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait GitRunner: Send + Sync {
    /// Runs git with `args`, inside `cwd` when given.
    fn run(&self, args: &[String], cwd: Option<&Path>) -> io::Result<GitOutput>;
}

/// Spawns the configured git program.
#[derive(Debug, Clone)]
pub struct SystemGit {
    program: PathBuf,
}

impl SystemGit {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SystemGit {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitRunner for SystemGit {
    fn run(&self, args: &[String], cwd: Option<&Path>) -> io::Result<GitOutput> {
        let mut command = Command::new(&self.program);
        command.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command.output()?;
        Ok(GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Token read from a secret, with the secret's name for error messages.
#[derive(Clone, PartialEq, Eq)]
pub struct GitCredential {
    pub secret: String,
    pub token: String,
}

impl fmt::Debug for GitCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCredential")
            .field("secret", &self.secret)
            .field("token", &REDACTED)
            .finish()
    }
}

/// Picks the token for a repository: the package's secret reference, then the
/// deployment default, then none.
pub fn resolve_git_credential(
    package: &str,
    source: &GitSource,
    secrets: &dyn SecretStore,
    defaults: &dyn DefaultCredentialSource,
) -> RetrievalResult<Option<GitCredential>> {
    let cannot = |reason: String| RetrievalError::CannotResolveCredential {
        package: package.to_string(),
        reason,
    };

    let (secret_name, key, is_default) = match source.security.as_ref().and_then(|s| s.oauth.as_ref())
    {
        None => match defaults.default_git_secret() {
            Some(name) => (name, DEFAULT_TOKEN_KEY.to_string(), true),
            None => return Ok(None),
        },
        Some(oauth) => match (&oauth.value_from, &oauth.value) {
            (Some(value_from), _) => {
                let Some(key_ref) = value_from.secret_key_ref.as_ref() else {
                    return Err(cannot(
                        "git oauth valueFrom is set but has no secretKeyRef".to_string(),
                    ));
                };
                let key = key_ref
                    .key
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TOKEN_KEY.to_string());
                (key_ref.name.clone(), key, false)
            }
            (None, Some(_)) => {
                return Err(cannot(
                    "git oauth tokens must come from a secretKeyRef, not a literal value".to_string(),
                ));
            }
            (None, None) => return Ok(None),
        },
    };

    let what = if is_default { "default secret" } else { "secret" };
    let secret = secrets
        .secret_get(&secret_name)
        .map_err(|err| cannot(format!("cannot read {what} {secret_name}: {err}")))?
        .ok_or_else(|| cannot(format!("{what} {secret_name} with oauth credentials does not exist")))?;
    let token = secret
        .get(&key)
        .ok_or_else(|| cannot(format!("{what} {secret_name} does not contain the key {key}")))?;
    debug!(package, secret = %secret_name, default = is_default, "using oauth credentials");
    Ok(Some(GitCredential {
        secret: secret_name,
        token: token.to_string(),
    }))
}

/// `https://<token>@host/...`; the URL is returned unchanged without a token.
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    match (token, url.strip_prefix(HTTPS)) {
        (Some(token), Some(rest)) if !token.is_empty() => format!("{HTTPS}{token}@{rest}"),
        _ => url.to_string(),
    }
}

/// Replaces every occurrence of `token` in `text`.
pub fn redact(text: &str, token: Option<&str>) -> String {
    match token {
        Some(token) if !token.is_empty() => text.replace(token, REDACTED),
        _ => text.to_string(),
    }
}

fn describe_location(location: &GitLocation) -> String {
    let reference = location
        .branch
        .as_deref()
        .map(|branch| format!(" (branch {branch})"))
        .or_else(|| location.tag.as_deref().map(|tag| format!(" (tag {tag})")))
        .or_else(|| {
            location
                .commit
                .as_deref()
                .map(|commit| format!(" (commit {commit})"))
        })
        .unwrap_or_default();
    format!("{}{reference}", location.url)
}

/// One clone of one repository into `dest`.
pub(crate) struct CloneJob<'a> {
    pub package: &'a str,
    pub location: &'a GitLocation,
    pub credential: Option<&'a GitCredential>,
    pub dest: &'a Path,
}

impl CloneJob<'_> {
    fn token(&self) -> Option<&str> {
        self.credential.map(|credential| credential.token.as_str())
    }

    fn failure(&self, reason: String) -> RetrievalError {
        RetrievalError::CannotRetrieveRepository {
            location: describe_location(self.location),
            credential: self.credential.map(|credential| credential.secret.clone()),
            reason: redact(&reason, self.token()),
        }
    }

    fn step(
        &self,
        runner: &dyn GitRunner,
        args: &[String],
        cwd: Option<&Path>,
    ) -> RetrievalResult<GitOutput> {
        let verb = args.first().map(String::as_str).unwrap_or("git");
        let output = runner
            .run(args, cwd)
            .map_err(|err| self.failure(format!("cannot run git {verb}: {err}")))?;
        if output.success() {
            return Ok(output);
        }
        let code = output
            .code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let message = redact(
            &format!(
                "git {verb} exited with {code}\ngit-stderr: {}\ngit-stdout: {}",
                output.stderr.trim_end(),
                output.stdout.trim_end()
            ),
            self.token(),
        );
        warn!(package = self.package, %message, "git failed");
        Err(self.failure(message))
    }

    fn head_commit(&self, runner: &dyn GitRunner) -> RetrievalResult<String> {
        let output = self.step(runner, &args(["rev-parse", "HEAD"]), Some(self.dest))?;
        let commit = output.stdout.trim().to_string();
        if commit.is_empty() {
            return Err(self.failure("git rev-parse HEAD printed no commit".to_string()));
        }
        Ok(commit)
    }

    /// Clones and returns the checked-out commit id.
    pub fn run(&self, runner: &dyn GitRunner) -> RetrievalResult<String> {
        let url = &self.location.url;
        if !url.starts_with(HTTPS) {
            return Err(RetrievalError::InvalidPackageSource {
                package: self.package.to_string(),
                reason: format!("only https:// git urls can be cloned, got {url}"),
            });
        }
        let remote = authenticated_url(url, self.token());
        let dest = self.dest.display().to_string();
        info!(
            package = self.package,
            location = %describe_location(self.location),
            authenticated = self.credential.is_some(),
            "cloning repository"
        );

        let reference = self.location.branch.as_ref().or(self.location.tag.as_ref());
        if let Some(reference) = reference {
            self.step(
                runner,
                &args([
                    "clone",
                    "--depth",
                    "1",
                    remote.as_str(),
                    "-b",
                    reference.as_str(),
                    dest.as_str(),
                ]),
                None,
            )?;
            return self.head_commit(runner);
        }

        if let Some(commit) = &self.location.commit {
            fs::create_dir_all(self.dest).map_err(|source| RetrievalError::Staging {
                path: self.dest.to_path_buf(),
                source,
            })?;
            let cwd = Some(self.dest);
            self.step(runner, &args(["init", "."]), cwd)?;
            self.step(runner, &args(["remote", "add", "origin", remote.as_str()]), cwd)?;
            self.step(
                runner,
                &args(["fetch", "--depth", "1", "origin", commit.as_str()]),
                cwd,
            )?;
            self.step(runner, &args(["checkout", "FETCH_HEAD"]), cwd)?;
            return Ok(commit.clone());
        }

        self.step(
            runner,
            &args(["clone", "--depth", "1", remote.as_str(), dest.as_str()]),
            None,
        )?;
        self.head_commit(runner)
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use packstage_secrets::{InMemorySecrets, Secret};

    use super::*;
    use crate::packages::credentials::NoDefaultCredential;
    use crate::packages::source::{GitOAuth, GitSecurity};

    struct DefaultSecret(&'static str);

    impl DefaultCredentialSource for DefaultSecret {
        fn default_git_secret(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn secrets() -> InMemorySecrets {
        InMemorySecrets::new()
            .with_secret(Secret::new("gh").with_entry("oauth-token", "tok-package"))
            .with_secret(Secret::new("fallback").with_entry("oauth-token", "tok-default"))
            .with_secret(Secret::new("custom").with_entry("pat", "tok-custom"))
    }

    #[test]
    fn package_reference_beats_default() {
        let source = GitSource::new("https://h/r.git").with_secret_ref("gh", None);
        let credential =
            resolve_git_credential("p", &source, &secrets(), &DefaultSecret("fallback"))
                .unwrap()
                .unwrap();
        assert_eq!(credential.token, "tok-package");
        assert_eq!(credential.secret, "gh");
    }

    #[test]
    fn default_secret_applies_without_security() {
        let source = GitSource::new("https://h/r.git");
        let credential =
            resolve_git_credential("p", &source, &secrets(), &DefaultSecret("fallback"))
                .unwrap()
                .unwrap();
        assert_eq!(credential.token, "tok-default");
        assert!(
            resolve_git_credential("p", &source, &secrets(), &NoDefaultCredential)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn explicit_key_is_honoured() {
        let source = GitSource::new("https://h/r.git").with_secret_ref("custom", Some("pat"));
        let credential = resolve_git_credential("p", &source, &secrets(), &NoDefaultCredential)
            .unwrap()
            .unwrap();
        assert_eq!(credential.token, "tok-custom");
    }

    #[test]
    fn literal_tokens_and_missing_secrets_are_rejected() {
        let mut literal = GitSource::new("https://h/r.git");
        literal.security = Some(GitSecurity {
            oauth: Some(GitOAuth {
                value: Some("tok".to_string()),
                value_from: None,
            }),
        });
        assert!(matches!(
            resolve_git_credential("p", &literal, &secrets(), &NoDefaultCredential),
            Err(RetrievalError::CannotResolveCredential { .. })
        ));

        let missing = GitSource::new("https://h/r.git").with_secret_ref("nope", None);
        assert!(matches!(
            resolve_git_credential("p", &missing, &secrets(), &NoDefaultCredential),
            Err(RetrievalError::CannotResolveCredential { .. })
        ));

        let missing_key = GitSource::new("https://h/r.git").with_secret_ref("gh", Some("other"));
        assert!(matches!(
            resolve_git_credential("p", &missing_key, &secrets(), &NoDefaultCredential),
            Err(RetrievalError::CannotResolveCredential { .. })
        ));
    }

    #[test]
    fn embeds_and_redacts_token() {
        let url = authenticated_url("https://github.com/o/r.git", Some("tok"));
        assert_eq!(url, "https://tok@github.com/o/r.git");
        assert_eq!(
            redact("fatal: could not read tok from tok", Some("tok")),
            "fatal: could not read <redacted> from <redacted>"
        );
        assert_eq!(authenticated_url("https://h/r", None), "https://h/r");
    }

    #[test]
    fn describes_requested_reference() {
        let location = GitSource::new("https://h/r.git").with_tag("v2").location;
        assert_eq!(describe_location(&location), "https://h/r.git (tag v2)");
    }
}
