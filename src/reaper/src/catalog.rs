//! Metadata catalog access.
//!
//! The catalog is the authority on which files are logically part of a
//! dataset. The store-backed implementation reads the dataset's metadata key
//! and collects every partition file plus every external index file.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::namespace::DatasetId;
use crate::store::{KeyValueStore, StoreError};

/// Metadata document versions this reader understands.
pub const SUPPORTED_METADATA_VERSIONS: &[u32] = &[4];

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("dataset '{dataset_id}' has no metadata")]
    NotFound { dataset_id: String },

    #[error("failed to read metadata of dataset '{dataset_id}': {source}")]
    Store {
        dataset_id: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid metadata for dataset '{dataset_id}': {message}")]
    Invalid { dataset_id: String, message: String },

    #[error("dataset '{dataset_id}' uses unsupported metadata version {version}")]
    UnsupportedVersion { dataset_id: String, version: u32 },
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Source of a dataset's referenced file set.
#[async_trait]
pub trait MetadataCatalog: Send + Sync + 'static {
    /// Keys of all data and index files the dataset declares.
    ///
    /// Returns `CatalogError::NotFound` when the dataset has no metadata.
    async fn referenced_files(&self, dataset_id: &DatasetId)
    -> Result<HashSet<String>, CatalogError>;
}

/// Files written for one partition, keyed by table name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartitionEntry {
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// An index is either stored in its own file or embedded in the metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum IndexEntry {
    External(String),
    Embedded(serde_json::Value),
}

/// Dataset metadata document stored under `<id>.by-dataset-metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetMetadata {
    pub dataset_metadata_version: u32,
    pub dataset_uuid: String,
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionEntry>,
    #[serde(default)]
    pub indices: BTreeMap<String, IndexEntry>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub partition_keys: Vec<String>,
}

impl DatasetMetadata {
    pub fn new(dataset_id: &DatasetId) -> Self {
        Self {
            dataset_metadata_version: 4,
            dataset_uuid: dataset_id.to_string(),
            partitions: BTreeMap::new(),
            indices: BTreeMap::new(),
            metadata: serde_json::Map::new(),
            partition_keys: Vec::new(),
        }
    }

    /// Partition file keys followed by external index file keys.
    pub fn referenced_files(&self) -> HashSet<String> {
        let data_files = self
            .partitions
            .values()
            .flat_map(|partition| partition.files.values().cloned());

        let index_files = self.indices.values().filter_map(|index| match index {
            IndexEntry::External(key) => Some(key.clone()),
            IndexEntry::Embedded(_) => None,
        });

        data_files.chain(index_files).collect()
    }

    /// Parse and check a metadata document for `dataset_id`.
    pub fn from_slice(dataset_id: &DatasetId, bytes: &[u8]) -> Result<Self, CatalogError> {
        let metadata: Self =
            serde_json::from_slice(bytes).map_err(|e| CatalogError::Invalid {
                dataset_id: dataset_id.to_string(),
                message: e.to_string(),
            })?;

        if !SUPPORTED_METADATA_VERSIONS.contains(&metadata.dataset_metadata_version) {
            return Err(CatalogError::UnsupportedVersion {
                dataset_id: dataset_id.to_string(),
                version: metadata.dataset_metadata_version,
            });
        }

        if metadata.dataset_uuid != dataset_id.as_str() {
            return Err(CatalogError::Invalid {
                dataset_id: dataset_id.to_string(),
                message: format!(
                    "metadata declares dataset_uuid '{}'",
                    metadata.dataset_uuid
                ),
            });
        }

        Ok(metadata)
    }
}

/// Catalog that reads metadata documents from the dataset store itself.
pub struct StoreMetadataCatalog {
    store: Arc<dyn KeyValueStore>,
}

impl StoreMetadataCatalog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, dataset_id: &DatasetId) -> Result<DatasetMetadata, CatalogError> {
        let key = dataset_id.namespace().metadata_key().to_string();
        let bytes = self.store.get(&key).await.map_err(|e| {
            if e.is_not_found() {
                CatalogError::NotFound {
                    dataset_id: dataset_id.to_string(),
                }
            } else {
                CatalogError::Store {
                    dataset_id: dataset_id.to_string(),
                    source: e,
                }
            }
        })?;

        DatasetMetadata::from_slice(dataset_id, &bytes)
    }
}

#[async_trait]
impl MetadataCatalog for StoreMetadataCatalog {
    async fn referenced_files(
        &self,
        dataset_id: &DatasetId,
    ) -> Result<HashSet<String>, CatalogError> {
        let metadata = self.load(dataset_id).await?;
        let files = metadata.referenced_files();

        tracing::debug!(
            dataset_id = %dataset_id,
            partitions = metadata.partitions.len(),
            indices = metadata.indices.len(),
            referenced_files = files.len(),
            "Loaded dataset metadata"
        );

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use bytes::Bytes;

    fn dataset() -> DatasetId {
        DatasetId::new("dataset").unwrap()
    }

    const METADATA: &str = r#"{
        "dataset_metadata_version": 4,
        "dataset_uuid": "dataset",
        "partitions": {
            "part_1": {"files": {"core": "dataset/core/part_1.parquet"}},
            "part_2": {"files": {"core": "dataset/core/part_2.parquet", "helper": "dataset/helper/part_2.parquet"}}
        },
        "indices": {
            "p": "dataset/indices/p/2024.by-dataset-index.parquet",
            "x": {"1": ["part_1"], "2": ["part_2"]}
        },
        "metadata": {"creation_time": "2024-01-01T00:00:00"},
        "partition_keys": ["p"]
    }"#;

    #[test]
    fn test_referenced_files_cover_partitions_and_external_indices() {
        let metadata = DatasetMetadata::from_slice(&dataset(), METADATA.as_bytes()).unwrap();
        let files = metadata.referenced_files();

        let expected: HashSet<String> = [
            "dataset/core/part_1.parquet",
            "dataset/core/part_2.parquet",
            "dataset/helper/part_2.parquet",
            "dataset/indices/p/2024.by-dataset-index.parquet",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(files, expected);
    }

    #[test]
    fn test_minimal_document() {
        let doc = r#"{"dataset_metadata_version": 4, "dataset_uuid": "dataset"}"#;
        let metadata = DatasetMetadata::from_slice(&dataset(), doc.as_bytes()).unwrap();
        assert!(metadata.referenced_files().is_empty());
    }

    #[test]
    fn test_unsupported_version() {
        let doc = r#"{"dataset_metadata_version": 3, "dataset_uuid": "dataset"}"#;
        let err = DatasetMetadata::from_slice(&dataset(), doc.as_bytes()).unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedVersion { version: 3, .. }));
    }

    #[test]
    fn test_uuid_mismatch_is_invalid() {
        let doc = r#"{"dataset_metadata_version": 4, "dataset_uuid": "other"}"#;
        let err = DatasetMetadata::from_slice(&dataset(), doc.as_bytes()).unwrap_err();
        assert!(matches!(err, CatalogError::Invalid { .. }));
    }

    #[test]
    fn test_garbage_is_invalid() {
        let err = DatasetMetadata::from_slice(&dataset(), b"not json").unwrap_err();
        assert!(matches!(err, CatalogError::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_store_catalog_reads_metadata_key() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(
                "dataset.by-dataset-metadata.json",
                Bytes::from_static(METADATA.as_bytes()),
            )
            .await
            .unwrap();

        let catalog = StoreMetadataCatalog::new(store);
        let files = catalog.referenced_files(&dataset()).await.unwrap();
        assert_eq!(files.len(), 4);
    }

    #[tokio::test]
    async fn test_store_catalog_missing_metadata_is_not_found() {
        let catalog = StoreMetadataCatalog::new(Arc::new(MemoryStore::new()));
        let err = catalog.referenced_files(&dataset()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
