use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use packstage_core::error::StorageResult;
use packstage_core::packages::{
    BasePackage, BaseSource, DatasetCredentials, DatasetSource, GitOutput, GitRunner, GitSource,
    ObjectStoreConnector, PackagesDownloader, S3Source, StaticDatasets, WorkflowPackage,
};
use packstage_core::storage::object::MockObjectClient;
use packstage_core::storage::{ObjectStorage, S3Credentials, S3Location, Storage};
use packstage_core::RetrievalError;
use packstage_secrets::{InMemorySecrets, Secret};
use parking_lot::Mutex;
use zip::ZipArchive;

const COMMIT: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
const TOKEN: &str = "ghp_tok123";

/// Stands in for the git binary: records every call and materialises a small
/// repository on clone or checkout.
#[derive(Clone, Default)]
struct FakeGit {
    calls: Arc<Mutex<Vec<Vec<String>>>>,
    fail_clone: bool,
}

impl FakeGit {
    fn failing() -> Self {
        Self {
            fail_clone: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    fn populate(dest: &Path) -> io::Result<()> {
        fs::create_dir_all(dest.join("wf/data"))?;
        fs::create_dir_all(dest.join("wf/conf"))?;
        fs::write(dest.join("wf/data/input.csv"), "a,b\n")?;
        fs::write(dest.join("wf/conf/settings.yaml"), "retries: 3\n")?;
        Ok(())
    }
}

impl GitRunner for FakeGit {
    fn run(&self, args: &[String], cwd: Option<&Path>) -> io::Result<GitOutput> {
        self.calls.lock().push(args.to_vec());
        match args.first().map(String::as_str) {
            Some("clone") if self.fail_clone => Ok(GitOutput::failed(
                128,
                format!("fatal: repository '{}' not found", args[3]),
            )),
            Some("clone") => {
                let dest = args.last().map(PathBuf::from).unwrap_or_default();
                Self::populate(&dest)?;
                Ok(GitOutput::ok(""))
            }
            Some("checkout") => {
                if let Some(cwd) = cwd {
                    Self::populate(cwd)?;
                }
                Ok(GitOutput::ok(""))
            }
            Some("rev-parse") => Ok(GitOutput::ok(format!("{COMMIT}\n"))),
            _ => Ok(GitOutput::ok("")),
        }
    }
}

/// Serves every bucket from one mock client and records what was asked for.
#[derive(Clone)]
struct SharedBucket {
    client: Arc<MockObjectClient>,
    seen: Arc<Mutex<Vec<(S3Location, Option<S3Credentials>)>>>,
}

impl SharedBucket {
    fn new() -> Self {
        let client = Arc::new(MockObjectClient::new("workflows"));
        client.insert("wf/conf/settings.yaml", "retries: 3\n");
        client.insert("wf/data/input.csv", "a,b\n");
        client.insert("wf/data/labels.csv", "x\n");
        client.insert("manifests/wf.yaml", "conf: conf:copy\n");
        client.insert("unrelated/file", "skip");
        Self {
            client,
            seen: Arc::default(),
        }
    }
}

impl ObjectStoreConnector for SharedBucket {
    fn connect(
        &self,
        location: S3Location,
        credentials: Option<S3Credentials>,
    ) -> StorageResult<Arc<dyn Storage>> {
        self.seen.lock().push((location, credentials));
        Ok(Arc::new(ObjectStorage::from_client(self.client.clone())))
    }
}

fn git_owner(source: GitSource) -> WorkflowPackage {
    WorkflowPackage::new("owner")
        .with_platform("openshift")
        .with_package(BasePackage::new("main", source).with_path("wf"))
}

fn git_secrets() -> Arc<InMemorySecrets> {
    Arc::new(
        InMemorySecrets::new()
            .with_secret(Secret::new("git-creds").with_entry("oauth-token", TOKEN)),
    )
}

fn files_below(root: &Path) -> Result<Vec<String>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path.strip_prefix(root)?;
                found.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    found.sort();
    Ok(found)
}

fn staging_entries(prefix: &Path) -> Result<usize> {
    Ok(fs::read_dir(prefix)?.count())
}

#[test]
fn clones_git_package_and_records_commit() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let git = FakeGit::default();
    let source = GitSource::new("https://git.example.com/team/wf.git")
        .with_branch("release")
        .with_secret_ref("git-creds", None);
    let downloader = PackagesDownloader::builder(git_owner(source))
        .prefix_dir(temp.path())
        .secrets(git_secrets())
        .git(git.clone())
        .build();

    {
        let scope = downloader.enter()?;
        let root = scope
            .staging_root()
            .ok_or_else(|| anyhow!("no staging root while entered"))?;
        assert!(root.starts_with(temp.path()));
        let metadata = scope
            .metadata("main")
            .ok_or_else(|| anyhow!("main was not registered"))?;
        assert_eq!(metadata.location, root.join("main").join("wf"));
        assert_eq!(metadata.data_files, vec!["input.csv"]);
        assert_eq!(metadata.top_level_folders, vec!["conf", "data"]);
        assert_eq!(scope.common_platforms(), vec!["openshift"]);
    }

    let calls = git.calls();
    assert_eq!(calls[0][0], "clone");
    assert!(calls[0].contains(&format!("https://{TOKEN}@git.example.com/team/wf.git")));
    assert!(calls[0].windows(2).any(|pair| pair == ["-b", "release"]));
    assert_eq!(calls[1], vec!["rev-parse", "HEAD"]);

    let owner = downloader
        .owner()
        .ok_or_else(|| anyhow!("owner went missing"))?;
    let recorded = owner
        .package("main")
        .and_then(|package| package.source.git.as_ref())
        .and_then(|git| git.version.clone());
    assert_eq!(recorded.as_deref(), Some(COMMIT));
    Ok(())
}

#[test]
fn commit_checkout_fetches_the_exact_revision() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let git = FakeGit::default();
    let source = GitSource::new("https://git.example.com/team/wf.git").with_commit(COMMIT);
    let downloader = PackagesDownloader::builder(git_owner(source))
        .prefix_dir(temp.path())
        .git(git.clone())
        .build();

    let scope = downloader.enter()?;
    assert_eq!(scope.data_files("main"), Some(vec!["input.csv".to_string()]));
    let verbs: Vec<String> = git.calls().iter().map(|call| call[0].clone()).collect();
    assert_eq!(verbs, vec!["init", "remote", "fetch", "checkout"]);
    assert!(git.calls()[2].contains(&COMMIT.to_string()));
    Ok(())
}

#[test]
fn git_failure_never_leaks_the_token() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let source = GitSource::new("https://git.example.com/team/private.git")
        .with_secret_ref("git-creds", None);
    let downloader = PackagesDownloader::builder(git_owner(source))
        .prefix_dir(temp.path())
        .secrets(git_secrets())
        .git(FakeGit::failing())
        .build();

    let err = downloader.enter().err().ok_or_else(|| anyhow!("clone should fail"))?;
    let message = err.to_string();
    assert!(matches!(err, RetrievalError::CannotRetrieveRepository { .. }));
    assert!(!message.contains(TOKEN), "{message}");
    assert!(message.contains("<redacted>"));
    assert!(message.contains("git-creds"));
    assert!(message.contains("https://git.example.com/team/private.git"));

    assert_eq!(staging_entries(temp.path())?, 0);
    assert_eq!(downloader.depth(), 0);
    assert!(matches!(downloader.enter(), Err(RetrievalError::SessionClosed)));
    Ok(())
}

#[test]
fn dataset_and_s3_sources_stage_the_same_tree() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let bucket = SharedBucket::new();

    let direct = WorkflowPackage::new("owner").with_package(
        BasePackage::new(
            "main",
            S3Source::new("workflows")
                .with_endpoint("https://minio.internal:9000")
                .with_keys("AKID", "s3cr3t"),
        )
        .with_path("wf")
        .with_manifest("manifests/wf.yaml"),
    );
    let via_dataset = WorkflowPackage::new("owner").with_package(
        BasePackage::new("main", DatasetSource::new("shared"))
            .with_path("wf")
            .with_manifest("manifests/wf.yaml"),
    );
    let datasets = StaticDatasets::new().with_dataset(
        "shared",
        DatasetCredentials::s3("workflows", "AKID", "s3cr3t")
            .with_endpoint("https://minio.internal:9000"),
    );

    let first = PackagesDownloader::builder(direct)
        .prefix_dir(temp.path())
        .connector(bucket.clone())
        .build();
    let second = PackagesDownloader::builder(via_dataset)
        .prefix_dir(temp.path())
        .datasets(datasets)
        .connector(bucket.clone())
        .build();

    let one = first.enter()?;
    let two = second.enter()?;
    let root_one = one.staging_root().ok_or_else(|| anyhow!("missing root"))?;
    let root_two = two.staging_root().ok_or_else(|| anyhow!("missing root"))?;
    assert_ne!(root_one, root_two);

    let tree = files_below(&root_one.join("main"))?;
    assert_eq!(
        tree,
        vec![
            "conf/settings.yaml",
            "data/input.csv",
            "data/labels.csv",
            "wf.yaml"
        ]
    );
    assert_eq!(tree, files_below(&root_two.join("main"))?);

    let a = one.metadata("main").ok_or_else(|| anyhow!("missing"))?;
    let b = two.metadata("main").ok_or_else(|| anyhow!("missing"))?;
    assert_eq!(a.location, root_one.join("main"));
    assert_eq!(a.data_files, vec!["input.csv", "labels.csv"]);
    assert_eq!(a.data_files, b.data_files);
    assert_eq!(a.top_level_folders, vec!["conf"]);
    assert_eq!(
        a.application_directory("conf"),
        Some(root_one.join("main").join("conf"))
    );
    assert_eq!(a.root_directory, Some(root_one.join("main")));
    assert_eq!(a.manifest_data, b.manifest_data);

    let seen = bucket.seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[0].1, Some(S3Credentials::new("AKID", "s3cr3t")));
    Ok(())
}

#[test]
fn manifest_folders_resolve_inside_the_object_store_package() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let bucket = SharedBucket::new();
    bucket.client.insert("wf/manifest.yaml", "data: data\nconf: conf\n");
    let owner = WorkflowPackage::new("owner")
        .with_package(
            BasePackage::new("main", S3Source::new("workflows"))
                .with_path("wf")
                .with_manifest("wf/manifest.yaml"),
        )
        .with_package(BasePackage::new("other", S3Source::new("workflows")).with_path("wf/conf"));
    let downloader = PackagesDownloader::builder(owner)
        .prefix_dir(temp.path())
        .connector(bucket)
        .build();

    let scope = downloader.enter()?;
    let root = scope.staging_root().ok_or_else(|| anyhow!("missing root"))?;
    let main = scope.metadata("main").ok_or_else(|| anyhow!("missing"))?;
    assert_eq!(
        main.application_directory("data"),
        Some(root.join("main").join("data"))
    );
    assert_eq!(main.data_files, vec!["input.csv", "labels.csv"]);
    assert_eq!(main.top_level_folders, vec!["conf", "data"]);
    assert_eq!(scope.root_directory("main"), Some(root.join("main")));
    assert_eq!(scope.root_directory("other"), Some(root.join("other")));
    Ok(())
}

#[test]
fn staged_package_streams_as_a_zip() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let owner = WorkflowPackage::new("owner")
        .with_package(BasePackage::new("main", S3Source::new("workflows")).with_path("wf"));
    let downloader = PackagesDownloader::builder(owner)
        .prefix_dir(temp.path())
        .connector(SharedBucket::new())
        .build();

    let scope = downloader.enter()?;
    assert!(scope.archive("missing").is_none());
    let archive = scope
        .archive("main")
        .ok_or_else(|| anyhow!("main has no root directory"))?;
    let mut bytes = Vec::new();
    for chunk in archive.stream()? {
        bytes.extend(chunk?);
    }

    let mut unpacked = ZipArchive::new(Cursor::new(bytes))?;
    let mut names: Vec<String> = unpacked.file_names().map(str::to_string).collect();
    names.sort();
    assert_eq!(
        names,
        vec!["conf/settings.yaml", "data/input.csv", "data/labels.csv"]
    );
    let mut contents = String::new();
    unpacked.by_name("data/input.csv")?.read_to_string(&mut contents)?;
    assert_eq!(contents, "a,b\n");
    Ok(())
}

#[cfg(unix)]
#[test]
fn non_utf8_staging_path_is_a_staging_error() -> Result<()> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let temp = tempfile::tempdir()?;
    let prefix = temp.path().join(OsStr::from_bytes(b"stage-\xff"));
    let owner = WorkflowPackage::new("owner")
        .with_package(BasePackage::new("main", S3Source::new("workflows")).with_path("wf"));
    let downloader = PackagesDownloader::builder(owner)
        .prefix_dir(&prefix)
        .connector(SharedBucket::new())
        .build();

    let err = downloader.enter().err().ok_or_else(|| anyhow!("should fail"))?;
    assert!(matches!(err, RetrievalError::Staging { .. }), "{err}");
    if prefix.exists() {
        assert_eq!(staging_entries(&prefix)?, 0);
    }
    Ok(())
}

#[test]
fn staging_lives_until_the_outermost_scope_ends() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let owner = WorkflowPackage::new("owner")
        .with_package(BasePackage::new("main", S3Source::new("workflows")).with_path("wf"));
    let downloader = PackagesDownloader::builder(owner)
        .prefix_dir(temp.path())
        .connector(SharedBucket::new())
        .build();
    assert_eq!(downloader.staging_root(), None);

    let outer = downloader.enter()?;
    let root = outer
        .staging_root()
        .ok_or_else(|| anyhow!("missing root"))?;
    {
        let inner = downloader.enter()?;
        assert_eq!(inner.staging_root().as_deref(), Some(root.as_path()));
        assert_eq!(downloader.depth(), 2);
    }
    assert!(root.join("main/data/input.csv").is_file());
    drop(outer);

    assert!(!root.exists());
    assert_eq!(downloader.staging_root(), None);
    assert_eq!(downloader.times_entered(), 2);
    assert!(matches!(downloader.enter(), Err(RetrievalError::SessionClosed)));
    assert!(downloader.metadata("main").is_some());
    Ok(())
}

#[test]
fn ambiguous_source_is_rejected_before_anything_is_fetched() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let bucket = SharedBucket::new();
    let git = FakeGit::default();
    let source = BaseSource {
        git: Some(GitSource::new("https://git.example.com/team/wf.git")),
        s3: Some(S3Source::new("workflows")),
        dataset: None,
    };
    let owner = WorkflowPackage::new("owner").with_package(BasePackage::new("main", source));
    let downloader = PackagesDownloader::builder(owner)
        .prefix_dir(temp.path())
        .connector(bucket.clone())
        .git(git.clone())
        .build();

    let err = downloader.enter().err().ok_or_else(|| anyhow!("should fail"))?;
    assert!(matches!(err, RetrievalError::InvalidPackageSource { .. }));
    assert!(git.calls().is_empty());
    assert!(bucket.seen.lock().is_empty());
    assert_eq!(staging_entries(temp.path())?, 0);
    Ok(())
}

#[test]
fn unknown_dataset_is_a_credential_error() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let owner = WorkflowPackage::new("owner")
        .with_package(BasePackage::new("main", DatasetSource::new("nowhere")));
    let downloader = PackagesDownloader::builder(owner)
        .prefix_dir(temp.path())
        .connector(SharedBucket::new())
        .build();

    let err = downloader.enter().err().ok_or_else(|| anyhow!("should fail"))?;
    assert!(matches!(err, RetrievalError::CannotResolveCredential { .. }));
    assert!(err.to_string().contains("nowhere"));
    assert_eq!(staging_entries(temp.path())?, 0);
    Ok(())
}

#[test]
fn later_package_failure_removes_earlier_ones() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let owner = WorkflowPackage::new("owner")
        .with_package(BasePackage::new("first", S3Source::new("workflows")).with_path("wf"))
        .with_package(BasePackage::new("second", S3Source::new("workflows")).with_path("absent"));
    let downloader = PackagesDownloader::builder(owner)
        .prefix_dir(temp.path())
        .connector(SharedBucket::new())
        .build();

    let err = downloader.enter().err().ok_or_else(|| anyhow!("should fail"))?;
    assert!(matches!(err, RetrievalError::Storage(_)), "{err}");
    assert_eq!(staging_entries(temp.path())?, 0);
    Ok(())
}

#[test]
fn existing_root_is_reused_without_retrieval() -> Result<()> {
    let temp = tempfile::tempdir()?;
    FakeGit::populate(&temp.path().join("main"))?;
    let git = FakeGit::default();
    let source = GitSource::new("https://git.example.com/team/wf.git");
    let downloader = PackagesDownloader::builder(git_owner(source))
        .existing_root(temp.path())
        .git(git.clone())
        .build();

    {
        let scope = downloader.enter()?;
        assert_eq!(scope.data_files("main"), Some(vec!["input.csv".to_string()]));
        assert_eq!(scope.root_directory("main"), Some(temp.path().join("main")));
    }
    assert!(git.calls().is_empty());
    assert!(temp.path().join("main/wf/data/input.csv").is_file());
    Ok(())
}
