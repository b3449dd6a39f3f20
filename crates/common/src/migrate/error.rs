use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::archive::ArchiveError;
use crate::ledger::LedgerError;
use crate::path::TreePath;
use crate::retry::RetryError;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Enumerating a folder failed; the branch under it cannot be walked
    #[error("listing {path} failed: {source}")]
    Listing {
        path: TreePath,
        #[source]
        source: RetryError,
    },
    /// A single unit failed after retries
    #[error("{operation} {path} failed: {source}")]
    Remote {
        operation: &'static str,
        path: TreePath,
        #[source]
        source: RetryError,
    },
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("migration cancelled")]
    Cancelled,
}

impl MigrationError {
    /// Whether the error ends the whole run instead of one unit or branch.
    ///
    /// Local failures (ledger, archive, staging I/O) and cancellation always
    /// do; remote failures only when the store rejected our credentials.
    pub fn is_fatal(&self) -> bool {
        match self {
            MigrationError::Listing { source, .. } | MigrationError::Remote { source, .. } => {
                source.is_fatal()
            }
            _ => true,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MigrationError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A unit or branch that did not make it, with the cause rendered for the
/// run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub path: TreePath,
    pub error: String,
}

impl ItemFailure {
    pub fn new(path: TreePath, error: impl ToString) -> Self {
        Self {
            path,
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    fn remote(source: StoreError) -> MigrationError {
        MigrationError::Remote {
            operation: "download",
            path: TreePath::from_raw("a/b"),
            source: RetryError::Failed {
                operation: "download".into(),
                source,
            },
        }
    }

    #[test]
    fn test_fatality() {
        assert!(!remote(StoreError::PermissionDenied("x".into())).is_fatal());
        assert!(remote(StoreError::Unauthenticated("x".into())).is_fatal());
        assert!(MigrationError::Cancelled.is_fatal());
    }

    #[test]
    fn test_cause_is_kept() {
        use std::error::Error;
        let err = remote(StoreError::NotFound("gone".into()));
        let retry = err.source().unwrap();
        let store = retry.source().unwrap();
        assert_eq!(store.to_string(), "not found: gone");
    }
}
