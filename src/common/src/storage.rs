//! Opening the object store that holds the datasets.
//!
//! A storage DSN names one of three backends:
//!
//! - `memory://`, a process-local store
//! - `file:///path`, a directory (`file:///.data/x` is relative to the working directory)
//! - `s3://[access_key:secret_key@]host[:port]/bucket`
//!
//! Retries are owned by the reaper's store adapter, which retries every call
//! with the configured backoff. Backends are therefore built to make a single
//! attempt per request.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{ObjectStore, RetryConfig};
use url::Url;

use crate::config::StorageConfig;

/// Parsed storage DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageDsn {
    Memory,
    File(PathBuf),
    S3(S3Location),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    /// Set for S3-compatible services; `None` means AWS itself.
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl StorageDsn {
    pub fn parse(dsn: &str) -> Result<Self> {
        let url = Url::parse(dsn).with_context(|| format!("Invalid storage DSN '{dsn}'"))?;

        match url.scheme() {
            "memory" => Ok(Self::Memory),
            "file" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    bail!("File DSN must specify a path: file:///path/to/datasets");
                }
                let path = match path.strip_prefix("/.") {
                    Some(relative) => PathBuf::from(format!(".{relative}")),
                    None => PathBuf::from(path),
                };
                Ok(Self::File(path))
            }
            "s3" => S3Location::from_url(&url).map(Self::S3),
            scheme => Err(anyhow!(
                "Unsupported storage scheme: {scheme}. Supported: file, memory, s3"
            )),
        }
    }

    /// Open the store this DSN names, creating a missing `file://` root.
    pub fn open(&self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            Self::Memory => Ok(Arc::new(InMemory::new())),
            Self::File(path) => {
                // LocalFileSystem canonicalizes its root
                std::fs::create_dir_all(path).with_context(|| {
                    format!("Failed to create storage directory {}", path.display())
                })?;
                Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
            }
            Self::S3(location) => Ok(Arc::new(location.builder().build()?)),
        }
    }
}

impl S3Location {
    fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("Missing S3 host in DSN"))?;
        let bucket = url.path().trim_matches('/');
        if bucket.is_empty() {
            bail!("S3 DSN must specify a bucket: s3://host/bucket");
        }

        let endpoint = (!host.ends_with("amazonaws.com")).then(|| {
            let scheme = if url.port() == Some(443) { "https" } else { "http" };
            match url.port() {
                Some(port) => format!("{scheme}://{host}:{port}"),
                None => format!("{scheme}://{host}"),
            }
        });
        let access_key = Some(url.username()).filter(|key| !key.is_empty());

        Ok(Self {
            bucket: bucket.to_string(),
            endpoint,
            access_key: access_key.map(str::to_string),
            secret_key: access_key.map(|_| url.password().unwrap_or_default().to_string()),
        })
    }

    /// Builder seeded from the `AWS_*` environment; DSN credentials win.
    fn builder(&self) -> AmazonS3Builder {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&self.bucket)
            .with_retry(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            });

        if let (Some(access_key), Some(secret_key)) = (&self.access_key, &self.secret_key) {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
        }

        if let Some(endpoint) = &self.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(true)
                .with_virtual_hosted_style_request(false);
        }
        builder
    }
}

/// Open the object store configured for the datasets.
pub fn create_object_store(storage: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    StorageDsn::parse(&storage.dsn)?.open()
}
