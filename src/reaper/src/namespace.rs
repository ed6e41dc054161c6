//! Dataset namespace resolution.
//!
//! Every key a dataset owns is either its metadata key
//! (`<id>.by-dataset-metadata.json`) or lives below `<id>/`. Membership is
//! decided by exact equality or by the id followed immediately by the `/`
//! separator, so `UUID` never claims `UUID2/...` or `prefixUUID`. Ids never
//! contain the separator themselves, otherwise one dataset's keys would also
//! fall inside the namespace of its parent path.

use std::fmt;

use thiserror::Error;

/// Suffix appended to the dataset id to form the metadata key.
pub const METADATA_KEY_SUFFIX: &str = ".by-dataset-metadata.json";

/// Separator between the dataset id and the rest of a namespace key.
pub const KEY_SEPARATOR: char = '/';

/// Directory holding data files below the dataset prefix.
pub const DATA_DIR: &str = "core";

/// Directory holding index files below the dataset prefix.
pub const INDEX_DIR: &str = "indices";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatasetIdError {
    #[error("dataset id must not be empty")]
    Empty,

    #[error("dataset id '{0}' must not contain '/'")]
    ContainsSeparator(String),
}

/// Identifier of a dataset, unique per store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn new(id: impl Into<String>) -> Result<Self, DatasetIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DatasetIdError::Empty);
        }
        if id.contains(KEY_SEPARATOR) {
            return Err(DatasetIdError::ContainsSeparator(id));
        }
        Ok(Self(id))
    }

    /// Recover the dataset id from a metadata key, if `key` is one.
    pub fn from_metadata_key(key: &str) -> Option<Self> {
        key.strip_suffix(METADATA_KEY_SUFFIX)
            .and_then(|id| Self::new(id).ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.clone())
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DatasetId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for DatasetId {
    type Error = DatasetIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Metadata key of a dataset.
pub fn metadata_key(dataset_id: &str) -> String {
    format!("{dataset_id}{METADATA_KEY_SUFFIX}")
}

/// Whether `key` belongs to the namespace of `dataset_id`.
pub fn belongs_to(dataset_id: &str, key: &str) -> bool {
    match key.strip_prefix(dataset_id) {
        Some(rest) => rest == METADATA_KEY_SUFFIX || rest.starts_with(KEY_SEPARATOR),
        None => false,
    }
}

/// The set of keys owned by one dataset, computed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    dataset_id: DatasetId,
    metadata_key: String,
    key_prefix: String,
}

impl Namespace {
    pub fn new(dataset_id: DatasetId) -> Self {
        let metadata_key = metadata_key(dataset_id.as_str());
        let key_prefix = format!("{dataset_id}{KEY_SEPARATOR}");
        Self {
            dataset_id,
            metadata_key,
            key_prefix,
        }
    }

    pub fn dataset_id(&self) -> &DatasetId {
        &self.dataset_id
    }

    /// `<id>.by-dataset-metadata.json`
    pub fn metadata_key(&self) -> &str {
        &self.metadata_key
    }

    /// `<id>/`, the listing prefix covering every non-metadata key.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// `<id>/core/`
    pub fn data_prefix(&self) -> String {
        format!("{}{DATA_DIR}{KEY_SEPARATOR}", self.key_prefix)
    }

    /// `<id>/indices/`
    pub fn index_prefix(&self) -> String {
        format!("{}{INDEX_DIR}{KEY_SEPARATOR}", self.key_prefix)
    }

    pub fn contains(&self, key: &str) -> bool {
        belongs_to(self.dataset_id.as_str(), key)
    }

    pub fn is_metadata_key(&self, key: &str) -> bool {
        key == self.metadata_key
    }
}
