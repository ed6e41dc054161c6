//! Key-value store contract and the `object_store` backed adapter.
//!
//! The deletion engine and garbage collector only need four primitives:
//! enumerate, get, put and an idempotent delete. Backend specifics (filesystem,
//! S3, in-memory) stay behind [`ObjectStoreAdapter`], which also owns the retry
//! policy for transient failures.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::config::RetryConfig;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use thiserror::Error;
use tokio_stream::StreamExt;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("invalid key '{key}': {message}")]
    InvalidKey { key: String, message: String },

    #[error("{operation} failed for '{target}': {source}")]
    Backend {
        operation: &'static str,
        target: String,
        transient: bool,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    pub fn backend(
        operation: &'static str,
        target: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            operation,
            target: target.into(),
            transient: true,
            source: Box::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether repeating the call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                transient: true,
                ..
            }
        )
    }
}

/// Flat, prefix-addressable key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Enumerates keys.
    ///
    /// With `Some(prefix)` only keys starting with `prefix` are returned; the
    /// prefix is expected to end with `/`. `None` enumerates the whole store.
    /// Order is unspecified.
    async fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError>;

    /// Returns `StoreError::NotFound` if the key is absent.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Removes a key. Succeeds when the key is already absent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// [`KeyValueStore`] over any `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectStoreAdapter {
    inner: Arc<dyn ObjectStore>,
    retry: RetryConfig,
}

impl ObjectStoreAdapter {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    /// Runs `call` until it succeeds, fails permanently, or attempts run out.
    async fn retrying<T, F, Fut>(
        &self,
        operation: &'static str,
        target: &str,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut delay = self.retry.initial_delay;
        let mut attempt = 1;

        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        operation,
                        target,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::time::Duration::try_from_secs_f64(
                        delay.as_secs_f64() * self.retry.backoff_multiplier,
                    )
                    .map_or(self.retry.max_delay, |next| next.min(self.retry.max_delay));
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn parse_key(key: &str) -> Result<ObjectPath, StoreError> {
    ObjectPath::parse(key).map_err(|e| StoreError::InvalidKey {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn is_transient(err: &object_store::Error) -> bool {
    !matches!(
        err,
        object_store::Error::InvalidPath { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented { .. }
            | object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
            | object_store::Error::UnknownConfigurationKey { .. }
    )
}

fn map_error(operation: &'static str, key: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NotFound {
            key: key.to_string(),
        },
        other => StoreError::Backend {
            operation,
            target: key.to_string(),
            transient: is_transient(&other),
            source: Box::new(other),
        },
    }
}

#[async_trait]
impl KeyValueStore for ObjectStoreAdapter {
    async fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        let target = prefix.unwrap_or("");
        let location = match prefix.map(|p| p.trim_end_matches('/')) {
            Some(p) if !p.is_empty() => Some(parse_key(p)?),
            _ => None,
        };
        let location = location.as_ref();

        self.retrying("list", target, || async move {
            let mut stream = self.inner.list(location);
            let mut keys = Vec::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(meta) => {
                        let key = meta.location.to_string();
                        if key.starts_with(target) {
                            keys.push(key);
                        }
                    }
                    // Entries removed while listing
                    Err(object_store::Error::NotFound { .. }) => continue,
                    Err(e) => return Err(map_error("list", target, e)),
                }
            }

            Ok(keys)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let location = parse_key(key)?;
        let location = &location;

        self.retrying("get", key, || async move {
            let result = self
                .inner
                .get(location)
                .await
                .map_err(|e| map_error("get", key, e))?;
            result.bytes().await.map_err(|e| map_error("get", key, e))
        })
        .await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let location = parse_key(key)?;
        let location = &location;

        self.retrying("put", key, || {
            let payload = data.clone();
            async move {
                self.inner
                    .put(location, payload.into())
                    .await
                    .map(|_| ())
                    .map_err(|e| map_error("put", key, e))
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let location = parse_key(key)?;
        let location = &location;

        self.retrying("delete", key, || async move {
            match self.inner.delete(location).await {
                Ok(()) => Ok(()),
                // LocalFileSystem reports missing files; absence is the goal
                Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(map_error("delete", key, e)),
            }
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let location = parse_key(key)?;
        let location = &location;

        self.retrying("head", key, || async move {
            match self.inner.head(location).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(map_error("head", key, e)),
            }
        })
        .await
    }
}
