//! Test utilities for the reaper.
//!
//! Store and catalog doubles plus dataset fixtures. Only available when the
//! `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! reaper = { path = "../reaper", features = ["testing"] }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::catalog::{CatalogError, DatasetMetadata, IndexEntry, MetadataCatalog, PartitionEntry};
use crate::namespace::{DATA_DIR, DatasetId, INDEX_DIR};
use crate::store::{KeyValueStore, StoreError};

/// In-memory [`KeyValueStore`] with exact string-prefix listing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    delete_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn key_set(&self) -> BTreeSet<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of `delete` calls served, including deletes of absent keys.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::Relaxed)
    }

    /// Copy every key from `other` except those in `skip`.
    pub fn copy_from(&self, other: &MemoryStore, skip: &[&str]) {
        let source = other
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        for (key, data) in source {
            if !skip.contains(&key.as_str()) {
                objects.insert(key, data);
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .keys()
            .filter(|key| prefix.is_none_or(|p| key.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Wraps a store and injects failures.
///
/// - failing deletes return a backend error and leave the key in place
/// - sticky keys acknowledge the delete but stay in the store
/// - hidden keys are left out of listings, like a lagging listing would
/// - listing can be switched to fail
///
/// Every key passed to `delete` is recorded.
pub struct FaultyStore {
    inner: Arc<dyn KeyValueStore>,
    failing_deletes: HashSet<String>,
    sticky_keys: HashSet<String>,
    hidden_keys: HashSet<String>,
    fail_listing: AtomicBool,
    listing_budget: Option<usize>,
    listings: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            failing_deletes: HashSet::new(),
            sticky_keys: HashSet::new(),
            hidden_keys: HashSet::new(),
            fail_listing: AtomicBool::new(false),
            listing_budget: None,
            listings: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_deletes_of(mut self, key: impl Into<String>) -> Self {
        self.failing_deletes.insert(key.into());
        self
    }

    pub fn sticky(mut self, key: impl Into<String>) -> Self {
        self.sticky_keys.insert(key.into());
        self
    }

    pub fn hide(mut self, key: impl Into<String>) -> Self {
        self.hidden_keys.insert(key.into());
        self
    }

    /// Every listing after the first `n` fails.
    pub fn fail_listings_after(mut self, n: usize) -> Self {
        self.listing_budget = Some(n);
        self
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::Relaxed);
    }

    /// Keys passed to `delete`, in call order.
    pub fn delete_requests(&self) -> Vec<String> {
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StoreError> {
        let call = self.listings.fetch_add(1, Ordering::Relaxed);
        let over_budget = self.listing_budget.is_some_and(|n| call >= n);
        if over_budget || self.fail_listing.load(Ordering::Relaxed) {
            return Err(StoreError::backend(
                "list",
                prefix.unwrap_or(""),
                std::io::Error::other("injected listing failure"),
            ));
        }
        let mut keys = self.inner.keys(prefix).await?;
        keys.retain(|key| !self.hidden_keys.contains(key));
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.to_string());

        if self.failing_deletes.contains(key) {
            return Err(StoreError::Backend {
                operation: "delete",
                target: key.to_string(),
                transient: false,
                source: Box::new(std::io::Error::other("injected delete failure")),
            });
        }
        if self.sticky_keys.contains(key) {
            return Ok(());
        }
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }
}

#[derive(Debug, Clone)]
enum CatalogResponse {
    Files(HashSet<String>),
    Missing,
    Broken,
}

/// Catalog double with scripted answers per dataset.
///
/// Responses registered for a dataset are served in order; the last one
/// keeps being served. Unknown datasets are reported as not found.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    responses: Mutex<HashMap<String, VecDeque<CatalogResponse>>>,
    calls: AtomicUsize,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, dataset_id: &str, response: CatalogResponse) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(dataset_id.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn with_files<I, S>(self, dataset_id: &str, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let files = files.into_iter().map(Into::into).collect();
        self.push(dataset_id, CatalogResponse::Files(files))
    }

    pub fn with_missing(self, dataset_id: &str) -> Self {
        self.push(dataset_id, CatalogResponse::Missing)
    }

    pub fn with_broken(self, dataset_id: &str) -> Self {
        self.push(dataset_id, CatalogResponse::Broken)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetadataCatalog for StaticCatalog {
    async fn referenced_files(
        &self,
        dataset_id: &DatasetId,
    ) -> Result<HashSet<String>, CatalogError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let response = {
            let mut responses = self
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match responses.get_mut(dataset_id.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match response {
            Some(CatalogResponse::Files(files)) => Ok(files),
            Some(CatalogResponse::Broken) => Err(CatalogError::Invalid {
                dataset_id: dataset_id.to_string(),
                message: "injected catalog failure".to_string(),
            }),
            Some(CatalogResponse::Missing) | None => Err(CatalogError::NotFound {
                dataset_id: dataset_id.to_string(),
            }),
        }
    }
}

/// Builder writing a complete dataset: data files, index files and metadata.
#[derive(Debug, Clone)]
pub struct DatasetFixture {
    dataset_id: DatasetId,
    partitions: usize,
    tables: Vec<String>,
    external_indices: Vec<String>,
    embedded_indices: Vec<String>,
}

impl DatasetFixture {
    /// Two partitions of the `core` table, one external and one embedded index.
    pub fn new(dataset_id: &str) -> Self {
        Self {
            dataset_id: DatasetId::new(dataset_id).unwrap_or_else(|e| panic!("{e}")),
            partitions: 2,
            tables: vec![DATA_DIR.to_string()],
            external_indices: vec!["p".to_string()],
            embedded_indices: vec!["x".to_string()],
        }
    }

    pub fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn table(mut self, table: &str) -> Self {
        self.tables.push(table.to_string());
        self
    }

    pub fn dataset_id(&self) -> &DatasetId {
        &self.dataset_id
    }

    /// The metadata document this fixture writes.
    pub fn metadata(&self) -> DatasetMetadata {
        let id = self.dataset_id.as_str();
        let mut metadata = DatasetMetadata::new(&self.dataset_id);

        for partition in 0..self.partitions {
            let label = format!("part_{partition}");
            let files = self
                .tables
                .iter()
                .map(|table| (table.clone(), format!("{id}/{table}/{label}.parquet")))
                .collect();
            metadata.partitions.insert(label, PartitionEntry { files });
        }

        for column in &self.external_indices {
            metadata.indices.insert(
                column.clone(),
                IndexEntry::External(format!(
                    "{id}/{INDEX_DIR}/{column}/0.by-dataset-index.parquet"
                )),
            );
        }

        for column in &self.embedded_indices {
            let labels: Vec<String> = (0..self.partitions).map(|p| format!("part_{p}")).collect();
            metadata.indices.insert(
                column.clone(),
                IndexEntry::Embedded(serde_json::json!({ "1": labels })),
            );
        }

        metadata
    }

    /// Writes the dataset and returns every key written, sorted.
    pub async fn write(&self, store: &dyn KeyValueStore) -> Result<Vec<String>, StoreError> {
        let metadata = self.metadata();
        let mut keys: Vec<String> = metadata.referenced_files().into_iter().collect();

        for key in &keys {
            store.put(key, Bytes::from(format!("payload of {key}"))).await?;
        }

        let document = serde_json::to_vec(&metadata)
            .map_err(|e| StoreError::backend("put", "metadata", e))?;
        let metadata_key = self.dataset_id.namespace().metadata_key().to_string();
        store.put(&metadata_key, Bytes::from(document)).await?;

        keys.push(metadata_key);
        keys.sort();
        Ok(keys)
    }
}

/// Writes the default fixture for `dataset_id` and returns its keys.
pub async fn create_dataset(
    store: &dyn KeyValueStore,
    dataset_id: &str,
) -> Result<Vec<String>, StoreError> {
    DatasetFixture::new(dataset_id).write(store).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StoreMetadataCatalog;

    #[tokio::test]
    async fn test_fixture_layout() {
        let store = MemoryStore::new();
        let keys = create_dataset(&store, "dataset").await.unwrap();

        assert_eq!(
            keys,
            vec![
                "dataset.by-dataset-metadata.json",
                "dataset/core/part_0.parquet",
                "dataset/core/part_1.parquet",
                "dataset/indices/p/0.by-dataset-index.parquet",
            ]
        );
        assert_eq!(store.key_set().len(), 4);
    }

    #[tokio::test]
    async fn test_fixture_metadata_round_trips_through_catalog() {
        let store = Arc::new(MemoryStore::new());
        let fixture = DatasetFixture::new("dataset").partitions(3).table("helper");
        fixture.write(store.as_ref()).await.unwrap();

        let catalog = StoreMetadataCatalog::new(store.clone());
        let files = catalog
            .referenced_files(fixture.dataset_id())
            .await
            .unwrap();
        assert_eq!(files, fixture.metadata().referenced_files());
        assert_eq!(files.len(), 3 * 2 + 1);
    }

    #[tokio::test]
    async fn test_memory_store_prefix_listing_is_textual() {
        let store = MemoryStore::new();
        store.put("UUID/a", Bytes::new()).await.unwrap();
        store.put("UUID2/a", Bytes::new()).await.unwrap();

        assert_eq!(store.keys(Some("UUID/")).await.unwrap(), vec!["UUID/a"]);
        assert_eq!(store.keys(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_faulty_store_sticky_key_survives_delete() {
        let inner = Arc::new(MemoryStore::new());
        inner.put("k", Bytes::new()).await.unwrap();
        let store = FaultyStore::new(inner.clone()).sticky("k");

        store.delete("k").await.unwrap();
        assert!(inner.contains("k"));
        assert_eq!(store.delete_requests(), vec!["k"]);
    }

    #[tokio::test]
    async fn test_static_catalog_serves_scripted_responses() {
        let catalog = StaticCatalog::new()
            .with_files("d", ["d/core/a"])
            .with_files("d", ["d/core/a", "d/core/b"]);
        let id = DatasetId::new("d").unwrap();

        assert_eq!(catalog.referenced_files(&id).await.unwrap().len(), 1);
        assert_eq!(catalog.referenced_files(&id).await.unwrap().len(), 2);
        assert_eq!(catalog.referenced_files(&id).await.unwrap().len(), 2);
        assert_eq!(catalog.calls(), 3);

        let unknown = DatasetId::new("unknown").unwrap();
        assert!(catalog.referenced_files(&unknown).await.unwrap_err().is_not_found());
    }
}
