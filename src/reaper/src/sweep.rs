//! Enumeration and idempotent batch deletion shared by dataset deletion and
//! garbage collection.

use std::collections::BTreeSet;

use futures::StreamExt;

use crate::error::{KeyFailure, PartialFailure, SweepError};
use crate::namespace::{DatasetId, Namespace};
use crate::store::{KeyValueStore, StoreError};

/// Keys of `namespace` currently present in the store.
///
/// Scoped enumeration lists `<id>/` and probes the metadata key; otherwise the
/// whole store is listed. Either way the result is filtered by namespace
/// membership, so over-inclusive listings are harmless.
pub(crate) async fn enumerate_namespace(
    store: &dyn KeyValueStore,
    namespace: &Namespace,
    scoped: bool,
) -> Result<BTreeSet<String>, StoreError> {
    let mut listed = if scoped {
        store.keys(Some(namespace.key_prefix())).await?
    } else {
        store.keys(None).await?
    };

    if scoped && store.exists(namespace.metadata_key()).await? {
        listed.push(namespace.metadata_key().to_string());
    }

    Ok(listed
        .into_iter()
        .filter(|key| namespace.contains(key))
        .collect())
}

#[derive(Debug, Default)]
pub(crate) struct SweepOutcome {
    pub deleted: Vec<String>,
    pub failures: Vec<KeyFailure>,
}

impl SweepOutcome {
    /// Moves deleted keys that are still enumerated into the failures.
    pub fn flag_survivors(&mut self, remaining: &BTreeSet<String>) -> usize {
        let (survivors, gone): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deleted)
            .into_iter()
            .partition(|key| remaining.contains(key));

        self.deleted = gone;
        let count = survivors.len();
        self.failures
            .extend(survivors.into_iter().map(KeyFailure::inconsistency));
        count
    }

    pub fn merge(&mut self, other: SweepOutcome) {
        self.deleted.extend(other.deleted);
        self.failures.extend(other.failures);
        self.deleted.sort();
        self.failures.sort_by(|a, b| a.key.cmp(&b.key));
    }

    /// The deleted keys, a [`PartialFailure`] if any key failed, or
    /// `SweepError::Unverified` if only the verification listing failed.
    pub fn into_result(
        self,
        dataset_id: &DatasetId,
        verify_error: Option<StoreError>,
    ) -> Result<Vec<String>, SweepError> {
        if !self.failures.is_empty() {
            return Err(PartialFailure {
                dataset_id: dataset_id.to_string(),
                deleted: self.deleted,
                failures: self.failures,
            }
            .into());
        }
        match verify_error {
            None => Ok(self.deleted),
            Some(source) => Err(SweepError::Unverified {
                dataset_id: dataset_id.to_string(),
                deleted: self.deleted,
                source,
            }),
        }
    }
}

/// Re-enumerates `namespace` and flags acknowledged deletes that are still
/// listed. Returns the listing error instead; the outcome is left as it was.
pub(crate) async fn verify_outcome(
    store: &dyn KeyValueStore,
    namespace: &Namespace,
    scoped: bool,
    outcome: &mut SweepOutcome,
) -> Option<StoreError> {
    match enumerate_namespace(store, namespace, scoped).await {
        Ok(remaining) => {
            let survivors = outcome.flag_survivors(&remaining);
            if survivors > 0 {
                tracing::warn!(
                    dataset_id = %namespace.dataset_id(),
                    survivors,
                    "Keys still present after successful delete"
                );
            }
            None
        }
        Err(e) => {
            tracing::warn!(
                dataset_id = %namespace.dataset_id(),
                error = %e,
                "Could not list namespace to verify deletes"
            );
            Some(e)
        }
    }
}

/// Deletes `keys` with at most `concurrency` calls in flight.
///
/// Every key is attempted; failures are collected rather than aborting.
pub(crate) async fn delete_keys<I>(
    store: &dyn KeyValueStore,
    keys: I,
    concurrency: usize,
) -> SweepOutcome
where
    I: IntoIterator<Item = String>,
{
    let results: Vec<(String, Result<(), StoreError>)> = futures::stream::iter(keys)
        .map(|key| async move {
            let result = store.delete(&key).await;
            (key, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut outcome = SweepOutcome::default();
    for (key, result) in results {
        match result {
            Ok(()) => {
                tracing::trace!(key = %key, "Deleted key");
                outcome.deleted.push(key);
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to delete key");
                outcome.failures.push(KeyFailure::delete_failed(key, &e));
            }
        }
    }

    outcome.deleted.sort();
    outcome.failures.sort_by(|a, b| a.key.cmp(&b.key));
    outcome
}
