//! Dataset deletion.
//!
//! Removes every key in a dataset's namespace and nothing else. Deletion is
//! resumable: keys that are already absent, including the metadata key, are
//! treated as deleted, so re-running an interrupted deletion finishes it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use common::config::SweepConfig;

use crate::catalog::MetadataCatalog;
use crate::error::SweepError;
use crate::metrics::ReaperMetrics;
use crate::namespace::{DatasetId, Namespace};
use crate::store::KeyValueStore;
use crate::sweep::{delete_keys, enumerate_namespace, verify_outcome};

/// Result of a successful dataset deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub dataset_id: String,
    /// Keys targeted and confirmed absent, sorted. In a dry run, the present
    /// keys that would have been deleted.
    pub deleted_keys: Vec<String>,
    pub dry_run: bool,
}

impl DeletionReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted_keys.len()
    }
}

/// Deletes whole datasets from a key-value store.
pub struct DatasetDeleter {
    store: Arc<dyn KeyValueStore>,
    catalog: Arc<dyn MetadataCatalog>,
    config: SweepConfig,
    metrics: ReaperMetrics,
}

impl DatasetDeleter {
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

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Delete every key belonging to `dataset_id`.
    ///
    /// The target set is the enumerated namespace plus any catalog-declared
    /// keys inside it. Data and index keys are deleted first. The metadata key
    /// goes last and only once everything else is gone, so an incomplete run
    /// leaves the dataset discoverable.
    ///
    /// # Errors
    ///
    /// `SweepError::Enumerate` if the namespace cannot be listed up front,
    /// `SweepError::PartialFailure` naming every key that failed to delete or
    /// was still present afterwards, and `SweepError::Unverified` if all
    /// deletes succeeded but the namespace could not be listed again.
    pub async fn delete_dataset(
        &self,
        dataset_id: &DatasetId,
    ) -> Result<DeletionReport, SweepError> {
        let start = Instant::now();
        let namespace = dataset_id.namespace();

        tracing::info!(
            dataset_id = %dataset_id,
            dry_run = self.config.dry_run,
            "Deleting dataset"
        );

        let present = self.enumerate(&namespace).await?;
        let declared: Vec<String> = self
            .declared_keys(&namespace)
            .await
            .into_iter()
            .filter(|key| !present.contains(key))
            .collect();

        tracing::debug!(
            dataset_id = %dataset_id,
            enumerated = present.len(),
            declared_only = declared.len(),
            "Resolved deletion targets"
        );

        if self.config.dry_run {
            return self.dry_run(dataset_id, present, declared).await;
        }

        let mut targets = present;
        targets.extend(declared);
        let has_metadata = targets.remove(namespace.metadata_key());

        let mut outcome = delete_keys(
            self.store.as_ref(),
            targets,
            self.config.delete_concurrency,
        )
        .await;

        if has_metadata {
            if outcome.failures.is_empty() {
                let metadata_key = namespace.metadata_key().to_string();
                outcome.merge(delete_keys(self.store.as_ref(), [metadata_key], 1).await);
            } else {
                tracing::warn!(
                    dataset_id = %dataset_id,
                    failed = outcome.failures.len(),
                    "Keeping metadata key until the remaining keys are removed"
                );
            }
        }

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
            Ok(deleted_keys) => {
                self.metrics.record_dataset_deleted(deleted_keys.len());
                tracing::info!(
                    dataset_id = %dataset_id,
                    deleted = deleted_keys.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Dataset deleted"
                );
                Ok(DeletionReport {
                    dataset_id: dataset_id.to_string(),
                    deleted_keys,
                    dry_run: false,
                })
            }
            Err(err) => {
                self.metrics.record_partial_failure(err.inconsistencies());
                tracing::error!(
                    dataset_id = %dataset_id,
                    deleted = err.deleted_keys().len(),
                    error = %err,
                    "Dataset deletion incomplete"
                );
                Err(err)
            }
        }
    }

    /// Reports the keys that are actually present. Declared keys the listing
    /// missed are checked one by one with `exists`.
    async fn dry_run(
        &self,
        dataset_id: &DatasetId,
        present: BTreeSet<String>,
        declared: Vec<String>,
    ) -> Result<DeletionReport, SweepError> {
        let mut would_delete = present;
        for key in declared {
            match self.store.exists(&key).await {
                Ok(true) => {
                    would_delete.insert(key);
                }
                Ok(false) => {
                    tracing::debug!(
                        dataset_id = %dataset_id,
                        key = %key,
                        "Declared key already absent"
                    );
                }
                Err(e) => {
                    return Err(SweepError::Enumerate {
                        dataset_id: dataset_id.to_string(),
                        source: e,
                    });
                }
            }
        }

        for key in &would_delete {
            tracing::info!(dataset_id = %dataset_id, key = %key, "[DRY-RUN] Would delete key");
        }
        Ok(DeletionReport {
            dataset_id: dataset_id.to_string(),
            deleted_keys: would_delete.into_iter().collect(),
            dry_run: true,
        })
    }

    async fn enumerate(&self, namespace: &Namespace) -> Result<BTreeSet<String>, SweepError> {
        enumerate_namespace(self.store.as_ref(), namespace, self.config.scoped_listing)
            .await
            .map_err(|source| SweepError::Enumerate {
                dataset_id: namespace.dataset_id().to_string(),
                source,
            })
    }

    /// Catalog-declared keys inside the namespace. Listing alone decides what
    /// gets deleted, so catalog errors only cost the extra coverage.
    async fn declared_keys(&self, namespace: &Namespace) -> Vec<String> {
        let dataset_id = namespace.dataset_id();
        match self.catalog.referenced_files(dataset_id).await {
            Ok(files) => files
                .into_iter()
                .filter(|key| {
                    let inside = namespace.contains(key);
                    if !inside {
                        tracing::warn!(
                            dataset_id = %dataset_id,
                            key = %key,
                            "Catalog declares key outside the dataset namespace, ignoring"
                        );
                    }
                    inside
                })
                .collect(),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => {
                tracing::warn!(
                    dataset_id = %dataset_id,
                    error = %e,
                    "Could not read catalog, deleting enumerated keys only"
                );
                Vec::new()
            }
        }
    }
}
