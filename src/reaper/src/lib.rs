//! Dataset Reaper Library
//!
//! Deletion and garbage collection for datasets stored as many small files in
//! a flat, prefix-addressable key-value store.
//!
//! Every dataset owns a namespace: its metadata key
//! `<id>.by-dataset-metadata.json` plus every key under `<id>/`. Deleting a
//! dataset removes exactly that namespace; garbage collection removes the
//! keys of a namespace that its metadata no longer references.
//!
//! - [`namespace`]: dataset ids and exact namespace membership
//! - [`store`]: the key-value store contract and the `object_store` adapter
//! - [`catalog`]: referenced-file sets read from dataset metadata
//! - [`deletion`] and [`gc`]: the two sweeps
//! - [`Reaper`]: single and multi-dataset orchestration with shared metrics

pub mod catalog;
pub mod deletion;
pub mod error;
pub mod gc;
pub mod metrics;
pub mod namespace;
pub mod reaper;
pub mod store;
mod sweep;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use catalog::{
    CatalogError, DatasetMetadata, IndexEntry, MetadataCatalog, PartitionEntry,
    StoreMetadataCatalog,
};
pub use deletion::{DatasetDeleter, DeletionReport};
pub use error::{FailureKind, KeyFailure, PartialFailure, SweepError};
pub use gc::{GarbageCollector, GcPlan, GcReport};
pub use metrics::{MetricsSummary, ReaperMetrics};
pub use namespace::{DatasetId, DatasetIdError, Namespace, belongs_to, metadata_key};
pub use reaper::Reaper;
pub use store::{KeyValueStore, ObjectStoreAdapter, StoreError};
