use std::env;
use std::sync::Arc;

use anyhow::Result;
use packstage_core::error::StorageResult;
use packstage_core::packages::{
    BasePackage, DatasetCredentials, DatasetSource, ObjectStoreConnector, S3Source,
    StaticDatasets,
};
use packstage_core::storage::object::MockObjectClient;
use packstage_core::storage::{ObjectStorage, S3Credentials, S3Location, Storage};
use packstage_core::{DownloaderConfig, WorkflowPackage};
use tracing_subscriber::EnvFilter;

/// Serves every bucket from one in-memory client so the example runs offline.
struct DemoBucket {
    client: Arc<MockObjectClient>,
}

impl ObjectStoreConnector for DemoBucket {
    fn connect(
        &self,
        location: S3Location,
        _credentials: Option<S3Credentials>,
    ) -> StorageResult<Arc<dyn Storage>> {
        println!("connecting to {}", location.describe());
        Ok(Arc::new(ObjectStorage::from_client(self.client.clone())))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    ensure_env_defaults();

    let client = Arc::new(MockObjectClient::new("workflows"));
    client.insert("wf/conf/settings.yaml", "retries: 3\n");
    client.insert("wf/data/input.csv", "a,b\n1,2\n");
    client.insert("wf/data/labels.csv", "x\n");
    client.insert("manifests/wf.yaml", "conf: conf:copy\n");

    let owner = WorkflowPackage::new("demo")
        .with_platform("default")
        .with_package(
            BasePackage::new("main", S3Source::new("workflows").with_keys("AKID", "s3cr3t"))
                .with_path("wf")
                .with_manifest("manifests/wf.yaml"),
        )
        .with_package(BasePackage::new("extra", DatasetSource::new("shared")).with_path("wf/conf"));
    let datasets = StaticDatasets::new().with_dataset(
        "shared",
        DatasetCredentials::s3("workflows", "AKID", "s3cr3t"),
    );

    let cfg = DownloaderConfig::from_env()?;
    let downloader = cfg
        .builder(owner)?
        .datasets(datasets)
        .connector(DemoBucket { client })
        .build();

    {
        let scope = downloader.enter()?;
        if let Some(root) = scope.staging_root() {
            println!("staged under {}", root.display());
        }
        for (name, metadata) in scope.all_metadata() {
            println!(
                "package `{name}` at {} folders={:?} data={:?}",
                metadata.location.display(),
                metadata.top_level_folders,
                metadata.data_files
            );
        }
        println!("common platforms: {:?}", scope.common_platforms());
    }
    println!("staging released: {}", downloader.staging_root().is_none());
    Ok(())
}

fn ensure_env_defaults() {
    if env::var("PACKSTAGE_SECRETS_BACKEND").is_err() {
        unsafe {
            env::set_var("PACKSTAGE_SECRETS_BACKEND", "memory");
        }
    }
}
