use std::fmt;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::store::StoreError;

/// Why a single key could not be confirmed absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The delete call itself failed after the adapter's retries.
    DeleteFailed,
    /// The delete call succeeded but the key is still enumerated.
    Inconsistency,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeleteFailed => f.write_str("delete failed"),
            Self::Inconsistency => f.write_str("still present after delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub key: String,
    pub kind: FailureKind,
    pub message: String,
}

impl KeyFailure {
    pub fn delete_failed(key: impl Into<String>, error: &StoreError) -> Self {
        Self {
            key: key.into(),
            kind: FailureKind::DeleteFailed,
            message: error.to_string(),
        }
    }

    pub fn inconsistency(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: FailureKind::Inconsistency,
            message: "key is still enumerated after a successful delete".to_string(),
        }
    }
}

impl fmt::Display for KeyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.key, self.kind, self.message)
    }
}

/// Some keys of a dataset could not be removed; everything else was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFailure {
    pub dataset_id: String,
    /// Keys confirmed deleted before the failures were collected.
    pub deleted: Vec<String>,
    pub failures: Vec<KeyFailure>,
}

impl PartialFailure {
    pub fn failed_keys(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.key.as_str())
    }

    pub fn inconsistencies(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| f.kind == FailureKind::Inconsistency)
            .count()
    }

    pub fn has_inconsistencies(&self) -> bool {
        self.inconsistencies() > 0
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} keys of dataset '{}' could not be removed",
            self.failures.len(),
            self.failures.len() + self.deleted.len(),
            self.dataset_id
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailure {}

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("failed to enumerate keys of dataset '{dataset_id}': {source}")]
    Enumerate {
        dataset_id: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to read catalog for dataset '{dataset_id}': {source}")]
    Catalog {
        dataset_id: String,
        #[source]
        source: CatalogError,
    },

    #[error(transparent)]
    PartialFailure(#[from] PartialFailure),

    /// Every delete was acknowledged but the namespace could not be listed
    /// again to confirm the keys are gone.
    #[error(
        "deleted {} keys of dataset '{dataset_id}' but could not verify their absence: {source}",
        .deleted.len()
    )]
    Unverified {
        dataset_id: String,
        deleted: Vec<String>,
        #[source]
        source: StoreError,
    },
}

impl SweepError {
    pub fn partial_failure(&self) -> Option<&PartialFailure> {
        match self {
            Self::PartialFailure(failure) => Some(failure),
            _ => None,
        }
    }

    /// Keys acknowledged deleted before the error, if any were attempted.
    pub fn deleted_keys(&self) -> &[String] {
        match self {
            Self::PartialFailure(failure) => &failure.deleted,
            Self::Unverified { deleted, .. } => deleted,
            _ => &[],
        }
    }

    pub fn inconsistencies(&self) -> usize {
        self.partial_failure()
            .map_or(0, PartialFailure::inconsistencies)
    }
}
