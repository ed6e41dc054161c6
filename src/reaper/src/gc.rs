//! Mark-and-sweep garbage collection of orphaned dataset files.
//!
//! The mark phase diffs the keys present in a dataset's namespace against the
//! files its metadata references. The sweep phase deletes the difference,
//! never the metadata key and never a referenced file.
//!
//! A writer that stores a file and references it after the mark phase can
//! lose that file. Re-reading the catalog right before the sweep narrows the
//! window; it does not close it. Collection is advisory and can be re-run.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use common::config::SweepConfig;

use crate::catalog::MetadataCatalog;
use crate::error::SweepError;
use crate::metrics::ReaperMetrics;
use crate::namespace::{DatasetId, Namespace};
use crate::store::KeyValueStore;
use crate::sweep::{delete_keys, enumerate_namespace, verify_outcome};

/// Outcome of the mark phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcPlan {
    pub dataset_id: String,
    /// Files the catalog references.
    pub referenced_count: usize,
    /// Keys found in the namespace, metadata key included.
    pub present_count: usize,
    /// Present keys that are neither referenced nor the metadata key, sorted.
    pub orphans: Vec<String>,
}

impl GcPlan {
    fn empty(dataset_id: &DatasetId) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            referenced_count: 0,
            present_count: 0,
            orphans: Vec::new(),
        }
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }
}

/// Result of a successful garbage collection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub dataset_id: String,
    /// Orphans deleted, sorted. In a dry run, the orphans that would have
    /// been deleted.
    pub deleted: Vec<String>,
    pub referenced_count: usize,
    pub present_count: usize,
    pub dry_run: bool,
}

impl GcReport {
    fn from_plan(plan: GcPlan, deleted: Vec<String>, dry_run: bool) -> Self {
        Self {
            dataset_id: plan.dataset_id,
            deleted,
            referenced_count: plan.referenced_count,
            present_count: plan.present_count,
            dry_run,
        }
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Removes unreferenced files from dataset namespaces.
pub struct GarbageCollector {
    store: Arc<dyn KeyValueStore>,
    catalog: Arc<dyn MetadataCatalog>,
    config: SweepConfig,
    metrics: ReaperMetrics,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn MetadataCatalog>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            config,
            metrics: ReaperMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: ReaperMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Mark phase only: which keys of `dataset_id` are orphans right now.
    ///
    /// A dataset without metadata yields an empty plan.
    pub async fn find_orphans(&self, dataset_id: &DatasetId) -> Result<GcPlan, SweepError> {
        let namespace = dataset_id.namespace();
        Ok(self
            .mark(&namespace)
            .await?
            .unwrap_or_else(|| GcPlan::empty(dataset_id)))
    }

    /// Delete every orphaned key of `dataset_id`.
    ///
    /// # Errors
    ///
    /// `SweepError::Catalog` if the metadata cannot be read for a reason other
    /// than absence, `SweepError::Enumerate` if the namespace cannot be
    /// listed; in both cases nothing is deleted. `SweepError::PartialFailure`
    /// names orphans that could not be removed, and `SweepError::Unverified`
    /// carries the deleted orphans when the final listing failed.
    pub async fn garbage_collect(
        &self,
        dataset_id: &DatasetId,
    ) -> Result<GcReport, SweepError> {
        let start = Instant::now();
        let namespace = dataset_id.namespace();
        let dry_run = self.config.dry_run;

        tracing::info!(dataset_id = %dataset_id, dry_run, "Starting garbage collection");

        let Some(plan) = self.mark(&namespace).await? else {
            tracing::info!(dataset_id = %dataset_id, "Dataset has no metadata, nothing to collect");
            self.metrics.record_gc_run(0);
            return Ok(GcReport::from_plan(GcPlan::empty(dataset_id), Vec::new(), dry_run));
        };

        tracing::info!(
            dataset_id = %dataset_id,
            referenced = plan.referenced_count,
            present = plan.present_count,
            orphans = plan.orphan_count(),
            "Mark phase complete"
        );

        let orphans = if plan.orphans.is_empty() || !self.config.revalidate_before_delete {
            plan.orphans.clone()
        } else {
            match self.referenced_files(dataset_id).await? {
                Some(current) => self.revalidate(dataset_id, &plan.orphans, &current),
                None => {
                    tracing::info!(
                        dataset_id = %dataset_id,
                        "Dataset metadata vanished before sweep, skipping"
                    );
                    Vec::new()
                }
            }
        };

        if orphans.is_empty() {
            self.metrics.record_gc_run(0);
            return Ok(GcReport::from_plan(plan, Vec::new(), dry_run));
        }

        if dry_run {
            for key in &orphans {
                tracing::info!(
                    dataset_id = %dataset_id,
                    key = %key,
                    "[DRY-RUN] Would delete orphan"
                );
            }
            return Ok(GcReport::from_plan(plan, orphans, true));
        }

        let mut outcome = delete_keys(
            self.store.as_ref(),
            orphans,
            self.config.delete_concurrency,
        )
        .await;

        let verify_error = if self.config.verify_after_delete {
            verify_outcome(
                self.store.as_ref(),
                &namespace,
                self.config.scoped_listing,
                &mut outcome,
            )
            .await
        } else {
            None
        };

        self.metrics.record_duration(start.elapsed());

        match outcome.into_result(dataset_id, verify_error) {
            Ok(deleted) => {
                self.metrics.record_gc_run(deleted.len());
                tracing::info!(
                    dataset_id = %dataset_id,
                    deleted = deleted.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Garbage collection complete"
                );
                Ok(GcReport::from_plan(plan, deleted, false))
            }
            Err(err) => {
                self.metrics.record_partial_failure(err.inconsistencies());
                tracing::error!(
                    dataset_id = %dataset_id,
                    deleted = err.deleted_keys().len(),
                    error = %err,
                    "Garbage collection incomplete"
                );
                Err(err)
            }
        }
    }

    /// `None` when the dataset has no metadata.
    async fn mark(&self, namespace: &Namespace) -> Result<Option<GcPlan>, SweepError> {
        let dataset_id = namespace.dataset_id();
        let Some(referenced) = self.referenced_files(dataset_id).await? else {
            return Ok(None);
        };

        let present = self.enumerate(namespace).await?;
        let orphans = present
            .iter()
            .filter(|key| !namespace.is_metadata_key(key) && !referenced.contains(*key))
            .cloned()
            .collect();

        Ok(Some(GcPlan {
            dataset_id: dataset_id.to_string(),
            referenced_count: referenced.len(),
            present_count: present.len(),
            orphans,
        }))
    }

    /// Drops orphans the catalog references by now.
    fn revalidate(
        &self,
        dataset_id: &DatasetId,
        orphans: &[String],
        current: &HashSet<String>,
    ) -> Vec<String> {
        let confirmed: Vec<String> = orphans
            .iter()
            .filter(|key| !current.contains(*key))
            .cloned()
            .collect();

        let skipped = orphans.len() - confirmed.len();
        if skipped > 0 {
            tracing::warn!(
                dataset_id = %dataset_id,
                skipped,
                "Orphans became referenced since mark phase, skipping them"
            );
        }
        confirmed
    }

    async fn referenced_files(
        &self,
        dataset_id: &DatasetId,
    ) -> Result<Option<HashSet<String>>, SweepError> {
        match self.catalog.referenced_files(dataset_id).await {
            Ok(files) => Ok(Some(files)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(SweepError::Catalog {
                dataset_id: dataset_id.to_string(),
                source,
            }),
        }
    }

    async fn enumerate(&self, namespace: &Namespace) -> Result<BTreeSet<String>, SweepError> {
        enumerate_namespace(self.store.as_ref(), namespace, self.config.scoped_listing)
            .await
            .map_err(|source| SweepError::Enumerate {
                dataset_id: namespace.dataset_id().to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StoreMetadataCatalog;
    use crate::error::FailureKind;
    use crate::testing::{FaultyStore, MemoryStore, StaticCatalog, create_dataset};
    use bytes::Bytes;

    const TRASH_DATA: &str = "dataset/core/trash.parquet";
    const TRASH_INDEX: &str = "dataset/indices/trash.parquet";

    fn collector(store: Arc<dyn KeyValueStore>) -> GarbageCollector {
        let catalog = Arc::new(StoreMetadataCatalog::new(store.clone()));
        GarbageCollector::new(store, catalog, SweepConfig::default())
    }

    fn id(raw: &str) -> DatasetId {
        DatasetId::new(raw).unwrap()
    }

    async fn dataset_with_trash() -> (Arc<MemoryStore>, Vec<String>) {
        let store = Arc::new(MemoryStore::new());
        let keys = create_dataset(store.as_ref(), "dataset").await.unwrap();
        store.put(TRASH_DATA, Bytes::from_static(b"x")).await.unwrap();
        store.put(TRASH_INDEX, Bytes::from_static(b"x")).await.unwrap();
        (store, keys)
    }

    #[tokio::test]
    async fn test_gc_removes_exactly_the_orphans() {
        let (store, keys) = dataset_with_trash().await;
        store.put("dataset2/core/trash.parquet", Bytes::new()).await.unwrap();

        let report = collector(store.clone())
            .garbage_collect(&id("dataset"))
            .await
            .unwrap();

        assert_eq!(report.deleted, vec![TRASH_DATA, TRASH_INDEX]);
        assert_eq!(report.deleted_count(), 2);
        assert_eq!(report.referenced_count, 3);
        assert_eq!(report.present_count, 6);

        let mut expected: BTreeSet<String> = keys.into_iter().collect();
        expected.insert("dataset2/core/trash.parquet".to_string());
        assert_eq!(store.key_set(), expected);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let (store, _) = dataset_with_trash().await;
        let collector = collector(store.clone());

        collector.garbage_collect(&id("dataset")).await.unwrap();
        let deletes = store.delete_calls();
        let second = collector.garbage_collect(&id("dataset")).await.unwrap();

        assert_eq!(second.deleted_count(), 0);
        assert_eq!(store.delete_calls(), deletes);
    }

    #[tokio::test]
    async fn test_find_orphans_deletes_nothing() {
        let (store, _) = dataset_with_trash().await;

        let plan = collector(store.clone())
            .find_orphans(&id("dataset"))
            .await
            .unwrap();

        assert_eq!(plan.orphans, vec![TRASH_DATA, TRASH_INDEX]);
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn test_missing_dataset_is_noop() {
        let store = Arc::new(MemoryStore::new());
        store.put("dataset/core/stray.parquet", Bytes::new()).await.unwrap();
        let metrics = ReaperMetrics::new();

        let report = collector(store.clone())
            .with_metrics(metrics.clone())
            .garbage_collect(&id("dataset"))
            .await
            .unwrap();

        assert_eq!(report.deleted_count(), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(metrics.gc_runs(), 1);
    }

    #[tokio::test]
    async fn test_catalog_error_aborts_before_deleting() {
        let (store, _) = dataset_with_trash().await;
        let catalog = Arc::new(StaticCatalog::new().with_broken("dataset"));

        let err = GarbageCollector::new(store.clone(), catalog, SweepConfig::default())
            .garbage_collect(&id("dataset"))
            .await
            .unwrap_err();

        assert!(matches!(err, SweepError::Catalog { .. }));
        assert_eq!(store.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_revalidation_spares_newly_referenced_files() {
        let store = Arc::new(MemoryStore::new());
        for key in ["d/core/a.parquet", "d/core/b.parquet", "d/core/c.parquet"] {
            store.put(key, Bytes::new()).await.unwrap();
        }
        // First read for the mark phase, second read for revalidation.
        let catalog = Arc::new(
            StaticCatalog::new()
                .with_files("d", ["d/core/a.parquet"])
                .with_files("d", ["d/core/a.parquet", "d/core/b.parquet"]),
        );

        let report = GarbageCollector::new(store.clone(), catalog.clone(), SweepConfig::default())
            .garbage_collect(&id("d"))
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["d/core/c.parquet"]);
        assert!(store.contains("d/core/b.parquet"));
        assert_eq!(catalog.calls(), 2);
    }

    #[tokio::test]
    async fn test_without_revalidation_catalog_is_read_once() {
        let store = Arc::new(MemoryStore::new());
        store.put("d/core/a.parquet", Bytes::new()).await.unwrap();
        let catalog = Arc::new(StaticCatalog::new().with_files("d", Vec::<String>::new()));
        let config = SweepConfig {
            revalidate_before_delete: false,
            ..SweepConfig::default()
        };

        let report = GarbageCollector::new(store.clone(), catalog.clone(), config)
            .garbage_collect(&id("d"))
            .await
            .unwrap();

        assert_eq!(report.deleted_count(), 1);
        assert_eq!(catalog.calls(), 1);
    }

    #[tokio::test]
    async fn test_dataset_vanishing_before_sweep_skips_deletion() {
        let store = Arc::new(MemoryStore::new());
        store.put("d/core/a.parquet", Bytes::new()).await.unwrap();
        let catalog = Arc::new(
            StaticCatalog::new()
                .with_files("d", Vec::<String>::new())
                .with_missing("d"),
        );

        let report = GarbageCollector::new(store.clone(), catalog, SweepConfig::default())
            .garbage_collect(&id("d"))
            .await
            .unwrap();

        assert_eq!(report.deleted_count(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_key_is_never_collected() {
        let store = Arc::new(MemoryStore::new());
        store.put("d.by-dataset-metadata.json", Bytes::new()).await.unwrap();
        let catalog = Arc::new(StaticCatalog::new().with_files("d", Vec::<String>::new()));

        let report = GarbageCollector::new(store.clone(), catalog, SweepConfig::default())
            .garbage_collect(&id("d"))
            .await
            .unwrap();

        assert_eq!(report.deleted_count(), 0);
        assert!(store.contains("d.by-dataset-metadata.json"));
    }

    #[tokio::test]
    async fn test_failed_orphan_delete_is_partial_failure() {
        let (inner, _) = dataset_with_trash().await;
        let store = Arc::new(FaultyStore::new(inner.clone()).fail_deletes_of(TRASH_INDEX));

        let err = collector(store)
            .garbage_collect(&id("dataset"))
            .await
            .unwrap_err();

        let failure = err.partial_failure().unwrap();
        assert_eq!(failure.deleted, vec![TRASH_DATA]);
        assert_eq!(failure.failures[0].key, TRASH_INDEX);
        assert_eq!(failure.failures[0].kind, FailureKind::DeleteFailed);
        assert!(!inner.contains(TRASH_DATA));
    }

    #[tokio::test]
    async fn test_sticky_orphan_is_inconsistency() {
        let (inner, _) = dataset_with_trash().await;
        let store = Arc::new(FaultyStore::new(inner.clone()).sticky(TRASH_DATA));

        let err = collector(store)
            .garbage_collect(&id("dataset"))
            .await
            .unwrap_err();

        let failure = err.partial_failure().unwrap();
        assert_eq!(failure.inconsistencies(), 1);
        assert_eq!(failure.failed_keys().collect::<Vec<_>>(), vec![TRASH_DATA]);
    }

    #[tokio::test]
    async fn test_failed_verification_still_names_failed_orphan() {
        let (inner, _) = dataset_with_trash().await;
        let store = Arc::new(
            FaultyStore::new(inner.clone())
                .fail_deletes_of(TRASH_INDEX)
                .fail_listings_after(1),
        );
        let metrics = ReaperMetrics::new();

        let err = collector(store)
            .with_metrics(metrics.clone())
            .garbage_collect(&id("dataset"))
            .await
            .unwrap_err();

        let failure = err.partial_failure().unwrap();
        assert_eq!(failure.failed_keys().collect::<Vec<_>>(), vec![TRASH_INDEX]);
        assert_eq!(failure.deleted, vec![TRASH_DATA]);
        assert_eq!(metrics.partial_failures(), 1);
        assert_eq!(metrics.gc_runs(), 0);
    }

    #[tokio::test]
    async fn test_failed_verification_reports_deleted_orphans() {
        let (inner, _) = dataset_with_trash().await;
        let store = Arc::new(FaultyStore::new(inner.clone()).fail_listings_after(1));

        let err = collector(store)
            .garbage_collect(&id("dataset"))
            .await
            .unwrap_err();

        assert!(matches!(err, SweepError::Unverified { .. }));
        assert_eq!(err.deleted_keys(), [TRASH_DATA, TRASH_INDEX].map(String::from));
        assert!(!inner.contains(TRASH_DATA));
        assert!(inner.contains("dataset.by-dataset-metadata.json"));
    }

    #[tokio::test]
    async fn test_dry_run_reports_orphans_only() {
        let (store, _) = dataset_with_trash().await;
        let catalog = Arc::new(StoreMetadataCatalog::new(store.clone()));
        let config = SweepConfig {
            dry_run: true,
            ..SweepConfig::default()
        };

        let report = GarbageCollector::new(store.clone(), catalog, config)
            .garbage_collect(&id("dataset"))
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.deleted, vec![TRASH_DATA, TRASH_INDEX]);
        assert_eq!(store.delete_calls(), 0);
    }
}
