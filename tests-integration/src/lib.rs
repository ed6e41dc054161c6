/// Common test utilities and helpers for integration tests
use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use common::config::{Configuration, SweepConfig};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use reaper::testing::{DatasetFixture, MemoryStore};
use reaper::{KeyValueStore, ObjectStoreAdapter, Reaper, StoreMetadataCatalog};
use tempfile::TempDir;

/// Store implementations the scenarios run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `reaper::testing::MemoryStore`
    Memory,
    /// `object_store::memory::InMemory` behind the adapter
    ObjectStoreInMemory,
    /// `object_store::local::LocalFileSystem` in a temp dir behind the adapter
    LocalFileSystem,
}

impl Backend {
    pub const ALL: [Backend; 3] = [
        Backend::Memory,
        Backend::ObjectStoreInMemory,
        Backend::LocalFileSystem,
    ];
}

/// Create a test configuration backed by memory storage
pub fn create_test_config() -> Configuration {
    let mut config = Configuration::default();
    config.storage.dsn = "memory://".to_string();
    config
}

/// Initialize test logging
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A store plus a reaper over it, reading metadata from the same store
pub struct ReaperTestContext {
    backend: Backend,
    store: Arc<dyn KeyValueStore>,
    reaper: Reaper,
    _temp_dir: Option<TempDir>,
}

impl ReaperTestContext {
    pub fn new(backend: Backend) -> Result<Self> {
        Self::with_config(backend, SweepConfig::default())
    }

    pub fn with_config(backend: Backend, config: SweepConfig) -> Result<Self> {
        let (store, temp_dir): (Arc<dyn KeyValueStore>, Option<TempDir>) = match backend {
            Backend::Memory => (Arc::new(MemoryStore::new()), None),
            Backend::ObjectStoreInMemory => (
                Arc::new(ObjectStoreAdapter::new(Arc::new(InMemory::new()))),
                None,
            ),
            Backend::LocalFileSystem => {
                let temp_dir = TempDir::new().context("Failed to create temp dir")?;
                let local = LocalFileSystem::new_with_prefix(temp_dir.path())
                    .context("Failed to create local object store")?;
                (
                    Arc::new(ObjectStoreAdapter::new(Arc::new(local))),
                    Some(temp_dir),
                )
            }
        };

        Ok(Self::from_store(backend, store, config, temp_dir))
    }

    /// Wrap an existing store, e.g. a `FaultyStore` around another context's store
    pub fn from_store(
        backend: Backend,
        store: Arc<dyn KeyValueStore>,
        config: SweepConfig,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let catalog = Arc::new(StoreMetadataCatalog::new(store.clone()));
        let reaper = Reaper::new(store.clone(), catalog, config);
        Self {
            backend,
            store,
            reaper,
            _temp_dir: temp_dir,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Write the default dataset fixture and return its keys
    pub async fn create_dataset(&self, dataset_id: &str) -> Result<Vec<String>> {
        self.write_fixture(&DatasetFixture::new(dataset_id)).await
    }

    pub async fn write_fixture(&self, fixture: &DatasetFixture) -> Result<Vec<String>> {
        fixture
            .write(self.store.as_ref())
            .await
            .with_context(|| format!("Failed to write dataset '{}'", fixture.dataset_id()))
    }

    pub async fn put(&self, key: &str) -> Result<()> {
        self.store
            .put(key, Bytes::from(format!("payload of {key}")))
            .await
            .with_context(|| format!("Failed to put '{key}'"))
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store
            .delete(key)
            .await
            .with_context(|| format!("Failed to delete '{key}'"))
    }

    /// Every key currently in the store
    pub async fn keys(&self) -> Result<BTreeSet<String>> {
        let keys = self
            .store
            .keys(None)
            .await
            .context("Failed to enumerate store")?;
        Ok(keys.into_iter().collect())
    }
}

pub fn key_set<I, S>(keys: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter().map(Into::into).collect()
}
