use std::sync::Arc;

use anyhow::{Context, Result};
use common::Configuration;
use common::config::SweepConfig;
use common::storage::create_object_store;
use futures::StreamExt;

use crate::catalog::{MetadataCatalog, StoreMetadataCatalog};
use crate::deletion::{DatasetDeleter, DeletionReport};
use crate::error::SweepError;
use crate::gc::{GarbageCollector, GcPlan, GcReport};
use crate::metrics::ReaperMetrics;
use crate::namespace::DatasetId;
use crate::store::{KeyValueStore, ObjectStoreAdapter, StoreError};

/// Entry point for deleting and garbage collecting datasets in one store.
///
/// Operations on distinct datasets may run concurrently; operations on the
/// same dataset rely on per-key idempotence only.
pub struct Reaper {
    store: Arc<dyn KeyValueStore>,
    deleter: DatasetDeleter,
    collector: GarbageCollector,
    config: SweepConfig,
    metrics: ReaperMetrics,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn MetadataCatalog>,
        config: SweepConfig,
    ) -> Self {
        let metrics = ReaperMetrics::new();
        let deleter = DatasetDeleter::new(store.clone(), catalog.clone(), config.clone())
            .with_metrics(metrics.clone());
        let collector = GarbageCollector::new(store.clone(), catalog, config.clone())
            .with_metrics(metrics.clone());

        Self {
            store,
            deleter,
            collector,
            config,
            metrics,
        }
    }

    /// Build a reaper over the configured object store, reading metadata from
    /// the same store.
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let object_store = create_object_store(&config.storage)
            .with_context(|| format!("Failed to open storage '{}'", config.storage.dsn))?;

        let store: Arc<dyn KeyValueStore> = Arc::new(
            ObjectStoreAdapter::new(object_store).with_retry(config.sweep.retry.clone()),
        );
        let catalog = Arc::new(StoreMetadataCatalog::new(store.clone()));

        tracing::info!(
            dsn = %config.storage.dsn,
            dry_run = config.sweep.dry_run,
            "Reaper initialized"
        );

        Ok(Self::new(store, catalog, config.sweep.clone()))
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ReaperMetrics {
        &self.metrics
    }

    pub async fn delete_dataset(
        &self,
        dataset_id: &DatasetId,
    ) -> Result<DeletionReport, SweepError> {
        self.deleter.delete_dataset(dataset_id).await
    }

    pub async fn garbage_collect(&self, dataset_id: &DatasetId) -> Result<GcReport, SweepError> {
        self.collector.garbage_collect(dataset_id).await
    }

    pub async fn find_orphans(&self, dataset_id: &DatasetId) -> Result<GcPlan, SweepError> {
        self.collector.find_orphans(dataset_id).await
    }

    /// Delete several datasets, at most `dataset_concurrency` at a time.
    ///
    /// Results are returned in input order, one per id.
    pub async fn delete_datasets(
        &self,
        dataset_ids: &[DatasetId],
    ) -> Vec<(DatasetId, Result<DeletionReport, SweepError>)> {
        futures::stream::iter(dataset_ids)
            .map(|dataset_id| async move {
                (dataset_id.clone(), self.delete_dataset(dataset_id).await)
            })
            .buffered(self.config.dataset_concurrency.max(1))
            .collect()
            .await
    }

    /// Garbage collect several datasets, at most `dataset_concurrency` at a
    /// time. Results are returned in input order, one per id.
    pub async fn garbage_collect_datasets(
        &self,
        dataset_ids: &[DatasetId],
    ) -> Vec<(DatasetId, Result<GcReport, SweepError>)> {
        futures::stream::iter(dataset_ids)
            .map(|dataset_id| async move {
                (dataset_id.clone(), self.garbage_collect(dataset_id).await)
            })
            .buffered(self.config.dataset_concurrency.max(1))
            .collect()
            .await
    }

    /// Datasets that have a metadata key in the store, sorted.
    pub async fn list_datasets(&self) -> Result<Vec<DatasetId>, StoreError> {
        let keys = self.store.keys(None).await?;

        let mut datasets: Vec<DatasetId> = keys
            .iter()
            .filter_map(|key| DatasetId::from_metadata_key(key))
            .collect();
        datasets.sort();
        datasets.dedup();

        tracing::debug!(datasets = datasets.len(), keys = keys.len(), "Listed datasets");
        Ok(datasets)
    }
}
